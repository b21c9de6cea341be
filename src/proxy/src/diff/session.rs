use crate::diff::backend::{
    DiffMainBackend, DiffOtherBackend, MainFinish, OtherFinish, ResponseType, Routing,
};
use crate::diff::config::{DiffConfig, Explain, OnError, Report};
use crate::diff::registry::Registry;
use crate::diff::result::{ExplainMainResult, ExplainOtherResult, OtherResult};
use crate::diff::stats::{DiffRouterSessionStats, RetainedResult};
use crate::history::HistoryEntry;
use crate::parser::{QueryParser, TypeMask};
use crate::protocol::mysql::constants::{cmd_to_string, CommandCode};
use crate::protocol::mysql::reply::Reply;
use crate::session::ClientSession;

use hashbrown::HashMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Which backend a reply packet arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Main,
    Other(usize),
}

/// Per-client-session state of the comparison router: forks every request
/// to the main and the others, pairs the responses and drives reporting.
pub struct DiffRouterSession {
    session_id: u64,
    config: Arc<DiffConfig>,
    registry: Arc<Registry>,
    parser: Arc<dyn QueryParser>,
    main: DiffMainBackend,
    others: Vec<DiffOtherBackend>,
    /// Payloads of session-modifying requests whose main response has not
    /// completed yet; turned into history entries on completion.
    pending_history: HashMap<u64, Vec<u8>>,
}

impl DiffRouterSession {
    pub fn new(
        session_id: u64,
        config: Arc<DiffConfig>,
        registry: Arc<Registry>,
        parser: Arc<dyn QueryParser>,
        main: DiffMainBackend,
        others: Vec<DiffOtherBackend>,
    ) -> Self {
        DiffRouterSession {
            session_id,
            config,
            registry,
            parser,
            main,
            others,
            pending_history: HashMap::new(),
        }
    }

    pub fn main(&self) -> &DiffMainBackend {
        &self.main
    }

    pub fn others(&self) -> &[DiffOtherBackend] {
        &self.others
    }

    /// Dispatch one client request packet. Returns false when the request
    /// cannot be routed because the main backend is unusable.
    pub fn route_query(&mut self, session: &mut ClientSession, payload: &[u8]) -> bool {
        if !self.main.in_use() {
            return false;
        }

        let info = self.parser.classify(payload);
        let id = session.next_query_id();

        self.capture_session_effects(session, &info, id, payload);

        let expecting = if self.main.extraordinary_in_process() {
            false
        } else {
            info.will_respond()
        };
        let main_type = if expecting {
            ResponseType::ExpectResponse
        } else {
            ResponseType::NoResponse
        };

        let explainable = info.sql.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
        let main_result = if expecting {
            let canonical = info.canonical.clone().unwrap_or_default();
            Some(self.main.prepare(
                info.sql.clone().unwrap_or_default(),
                info.command,
                canonical.clone(),
                Registry::hash_for(&canonical),
            ))
        } else {
            None
        };

        let main_backlog = self.main.backlog();

        if !self.main.write(payload.to_vec(), main_type, id, explainable, false) {
            return false;
        }

        let other_type = if !expecting {
            ResponseType::NoResponse
        } else if info.type_mask.contains(TypeMask::WRITE) {
            ResponseType::IgnoreResponse
        } else {
            ResponseType::ExpectResponse
        };

        for other in &mut self.others {
            if !other.in_use() {
                continue;
            }

            if !other.extraordinary_in_process()
                && other.backlog() > main_backlog + self.config.max_request_lag
                && info.is_simple_select()
                && !info.relates_to_previous
            {
                // Lag shedding: drop read-only traffic until the replica
                // catches up.
                other.inc_requests_skipped();
                continue;
            }

            if let Some(main_result) = &main_result {
                other.prepare(main_result);
            }
            other.write(payload.to_vec(), other_type, id, explainable, false);
        }

        true
    }

    /// Session-level bookkeeping the client protocol would normally do:
    /// remember execute parameter types, prune closed statements and queue
    /// session-modifying requests for the history.
    fn capture_session_effects(
        &mut self,
        session: &mut ClientSession,
        info: &crate::parser::QueryInfo,
        id: u64,
        payload: &[u8],
    ) {
        match CommandCode::from_byte(info.command) {
            Some(CommandCode::ComStmtClose) if payload.len() >= 5 => {
                let ps_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                session.history.erase(ps_id as u64);
                session.exec_metadata.remove(&ps_id);
                session.ps_params.remove(&ps_id);
            }
            Some(CommandCode::ComStmtExecute) if payload.len() >= 10 => {
                let ps_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                if let Some(&n_params) = session.ps_params.get(&ps_id) {
                    if n_params > 0 {
                        let types_offset = 1 + 4 + 1 + 4 + (n_params as usize + 7) / 8;
                        let types_len = n_params as usize * 2;
                        if payload.get(types_offset) == Some(&1)
                            && payload.len() >= types_offset + 1 + types_len
                        {
                            let types =
                                payload[types_offset + 1..types_offset + 1 + types_len].to_vec();
                            session.exec_metadata.insert(ps_id, types);
                        }
                    }
                }
            }
            _ => {}
        }

        if info.session_modifying {
            self.pending_history.insert(id, payload.to_vec());
        }
    }

    /// Feed one reply packet from a backend. The return value says whether
    /// the packet belongs to the client (only ever true for the main).
    pub fn client_reply(
        &mut self,
        session: &mut ClientSession,
        target: Target,
        payload: &[u8],
        reply: &Reply,
    ) -> Routing {
        match target {
            Target::Main => {
                self.main.process_result(payload);
                // packets of an internal result never reach the client
                let mut routing = if self.main.front_is_internal() {
                    Routing::Stop
                } else {
                    Routing::Continue
                };
                if reply.is_complete() {
                    if let Some((finish_routing, finish)) = self.main.finish_result(reply) {
                        routing = finish_routing;
                        self.handle_main_finish(session, finish, reply);
                    }
                }
                routing
            }
            Target::Other(index) => {
                let finish = match self.others.get_mut(index) {
                    Some(other) => {
                        other.process_result(payload);
                        if reply.is_complete() {
                            other.finish_result(reply)
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                if let Some((_, finish)) = finish {
                    self.handle_other_finish(session, finish);
                    if let Some(other) = self.others.get_mut(index) {
                        other.execute_pending_explains();
                    }
                }
                Routing::Stop
            }
        }
    }

    fn handle_main_finish(&mut self, session: &mut ClientSession, finish: MainFinish, reply: &Reply) {
        match finish {
            MainFinish::Query {
                result,
                ready_others,
            } => {
                if let Some(payload) = self.pending_history.remove(&result.id()) {
                    let error_code = reply.error.as_ref().map(|e| e.code).unwrap_or(0);
                    session.history.add(HistoryEntry {
                        id: result.id(),
                        payload,
                        ok: reply.is_ok,
                        error_code,
                    });
                }
                if reply.command == CommandCode::ComStmtPrepare as u8 && reply.is_ok {
                    session.ps_params.insert(reply.generated_id, reply.param_count);
                }
                for other_result in ready_others {
                    self.other_ready(other_result);
                }
            }
            MainFinish::Explain {
                result: _,
                ready_others,
            } => {
                for explain_result in ready_others {
                    self.explain_ready(explain_result);
                }
            }
        }
        self.main.execute_pending_explains();
    }

    fn handle_other_finish(&mut self, _session: &mut ClientSession, finish: OtherFinish) {
        match finish {
            OtherFinish::Query { result, ready } => {
                if ready {
                    self.other_ready(result);
                }
            }
            OtherFinish::Explain { result, ready } => {
                if ready {
                    self.explain_ready(result);
                }
            }
        }
    }

    fn other_index(&self, target: &str) -> Option<usize> {
        self.others.iter().position(|o| o.name() == target)
    }

    /// Both sides of one comparison are complete: update the verdict stats,
    /// apply the discrepancy rule and either report now or schedule the
    /// EXPLAIN round first.
    fn other_ready(&mut self, other_result: Arc<OtherResult>) {
        let Some(index) = self.other_index(other_result.target()) else {
            return;
        };

        let main_result = other_result.main_result().clone();
        let main_duration = main_result.duration();
        let other_duration = other_result.duration();

        if self.should_report(&other_result) {
            let gate_explain = self.config.explain != Explain::None
                && self.config.entries > 0
                && other_result.is_explainable();

            if gate_explain {
                let decision = self.registry.is_explained(
                    Instant::now(),
                    other_result.canonical_hash(),
                    other_result.id(),
                );
                match decision {
                    Some(prior) => {
                        // Sufficiently explained already; the report points
                        // at the earlier explainers instead.
                        other_result.set_explainers(prior);
                        self.generate_report(&other_result, None, None);
                    }
                    None => {
                        let explain_main = if self.config.explain == Explain::Both {
                            let explain_main = ExplainMainResult::new(main_result.clone());
                            self.main.schedule_explain(explain_main.clone());
                            Some(explain_main)
                        } else {
                            None
                        };
                        let explain_other =
                            ExplainOtherResult::new(other_result.clone(), explain_main);
                        self.others[index].schedule_explain(explain_other);
                        self.main.execute_pending_explains();
                        self.others[index].execute_pending_explains();
                    }
                }
            } else {
                self.generate_report(&other_result, None, None);
            }
        }

        let retained = RetainedResult {
            permille: 0,
            sql: other_result.sql().to_string(),
            id: other_result.id(),
            explained_by: other_result.explainers().iter().map(|e| e.id).collect(),
        };
        self.others[index].stats_mut().add_result(
            other_duration,
            main_duration,
            retained,
            &self.config,
        );
    }

    fn explain_ready(&mut self, explain_result: Arc<ExplainOtherResult>) {
        if let Some(error) = explain_result.error() {
            if !error.is_empty() {
                let sql = explain_result.sql().to_string();
                warn!("EXPLAIN of '{sql}' failed: {error}");
                self.generate_report(explain_result.origin_result(), None, None);
                return;
            }
        }

        let explain_other = load_json(&explain_result.json());
        let explain_main = explain_result
            .explain_main_result()
            .map(|main| main.json())
            .filter(|json| !json.is_empty())
            .map(|json| load_json(&json));

        self.generate_report(explain_result.origin_result(), Some(explain_other), explain_main);
    }

    fn should_report(&self, other_result: &OtherResult) -> bool {
        if self.config.report == Report::Always {
            return true;
        }

        let main_result = other_result.main_result();
        if other_result.checksum() != main_result.checksum() {
            return true;
        }

        let main_duration = main_result.duration().as_nanos() as i64;
        let other_duration = other_result.duration().as_nanos() as i64;
        let delta = main_duration * self.config.max_execution_time_difference / 100;
        (other_duration - main_duration).abs() > delta
    }

    fn generate_report(
        &self,
        other_result: &Arc<OtherResult>,
        explain_other: Option<Value>,
        explain_main: Option<Value>,
    ) {
        let main_result = other_result.main_result();

        let main_json = result_json(
            main_result.target(),
            main_result.checksum_hex(),
            &main_result.reply(),
            main_result.duration().as_nanos() as u64,
            explain_main,
        );
        let mut other_json = result_json(
            other_result.target(),
            other_result.checksum_hex(),
            &other_result.reply(),
            other_result.duration().as_nanos() as u64,
            explain_other,
        );

        let explainers = other_result.explainers();
        if !explainers.is_empty() {
            other_json["explained_by"] =
                Value::Array(explainers.iter().map(|e| json!(e.id)).collect());
        }

        let report = json!({
            "id": main_result.id(),
            "session": self.session_id,
            "command": cmd_to_string(main_result.command()),
            "query": main_result.sql(),
            "results": [main_json, other_json],
        });

        if let Some(index) = self.other_index(other_result.target()) {
            self.others[index].exporter().ship(&report);
        }
    }

    /// A backend connection failed. Returns whether the session can keep
    /// going: only when the policy is `ignore` and the main still lives.
    pub fn handle_error(&mut self, target: Target) -> bool {
        match target {
            Target::Main => {
                self.main.close();
                false
            }
            Target::Other(index) => {
                if let Some(other) = self.others.get_mut(index) {
                    warn!("closing comparison target '{}' after an error", other.name());
                    other.close();
                }
                self.config.on_error == OnError::Ignore && self.main.in_use()
            }
        }
    }

    /// Collect the per-session stats for the router-wide aggregate. Called
    /// once when the session closes.
    pub fn close(&mut self) -> DiffRouterSessionStats {
        let (main_stats, main_qps) = self.main.take_stats();
        let mut others = BTreeMap::new();
        for other in &mut self.others {
            let name = other.name();
            others.insert(name, other.take_stats());
        }
        DiffRouterSessionStats {
            main_name: self.main.name(),
            main_stats,
            main_qps,
            others,
        }
    }
}

fn result_json(
    target: &str,
    checksum: String,
    reply: &Reply,
    duration_ns: u64,
    explain: Option<Value>,
) -> Value {
    let reply_type = if reply.error.is_some() {
        "error"
    } else if reply.is_resultset() {
        "resultset"
    } else {
        "ok"
    };

    let mut value = json!({
        "target": target,
        "checksum": checksum,
        "rows": reply.rows_read,
        "warnings": reply.warnings,
        "duration": duration_ns,
        "type": reply_type,
    });
    if let Some(explain) = explain {
        value["explain"] = explain;
    } else {
        value["explain"] = Value::Null;
    }
    value
}

/// EXPLAIN output should be JSON; if the server returned something else,
/// keep it as a string.
fn load_json(raw: &str) -> Value {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("could not parse EXPLAIN result returned by server, storing as string: {e}");
            Value::String(raw.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::backend::test_support::RecordingEndpoint;
    use crate::diff::exporter::test_support::CollectingExporter;
    use crate::parser::DefaultParser;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        session: DiffRouterSession,
        client: ClientSession,
        exporter: Arc<CollectingExporter>,
        main_writes: Arc<Mutex<Vec<(Vec<u8>, ResponseType)>>>,
        other_writes: Arc<Mutex<Vec<(Vec<u8>, ResponseType)>>>,
    }

    fn fixture(config: DiffConfig) -> Fixture {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(config.entries, config.period));
        let (main_endpoint, main_writes) = RecordingEndpoint::new("main1");
        let (other_endpoint, other_writes) = RecordingEndpoint::new("other1");
        let exporter = Arc::new(CollectingExporter::default());

        let main = DiffMainBackend::new(Box::new(main_endpoint), Duration::from_secs(60));
        let other = DiffOtherBackend::new(
            Box::new(other_endpoint),
            exporter.clone(),
            Duration::from_secs(60),
        );

        Fixture {
            session: DiffRouterSession::new(
                7,
                config,
                registry,
                Arc::new(DefaultParser),
                main,
                vec![other],
            ),
            client: ClientSession::new(7, "app", "10.0.0.9"),
            exporter,
            main_writes,
            other_writes,
        }
    }

    fn ok_reply() -> Reply {
        Reply {
            command: CommandCode::ComQuery as u8,
            is_ok: true,
            ..Default::default()
        }
    }

    fn resultset_reply(rows: u64) -> Reply {
        Reply {
            command: CommandCode::ComQuery as u8,
            field_counts: vec![1],
            rows_read: rows,
            ..Default::default()
        }
    }

    fn query(sql: &str) -> Vec<u8> {
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend_from_slice(sql.as_bytes());
        payload
    }

    fn complete_roundtrip(f: &mut Fixture, payload: &[u8], main_data: &[u8], other_data: &[u8]) {
        assert!(f.session.route_query(&mut f.client, payload));
        let reply = ok_reply();
        let routing = f
            .session
            .client_reply(&mut f.client, Target::Main, main_data, &reply);
        assert_eq!(routing, Routing::Continue);
        f.session
            .client_reply(&mut f.client, Target::Other(0), other_data, &reply);
    }

    #[test]
    fn test_request_fans_out_to_all_backends() {
        let mut f = fixture(DiffConfig::default());
        assert!(f.session.route_query(&mut f.client, &query("SELECT 1")));
        assert_eq!(f.main_writes.lock().unwrap().len(), 1);
        assert_eq!(f.other_writes.lock().unwrap().len(), 1);
        assert_eq!(
            f.other_writes.lock().unwrap()[0].1,
            ResponseType::ExpectResponse
        );
    }

    #[test]
    fn test_write_commands_ignore_other_responses() {
        let mut f = fixture(DiffConfig::default());
        assert!(f
            .session
            .route_query(&mut f.client, &query("UPDATE t SET x = 1")));
        assert_eq!(
            f.other_writes.lock().unwrap()[0].1,
            ResponseType::IgnoreResponse
        );
    }

    #[test]
    fn test_matching_responses_produce_no_report() {
        let mut config = DiffConfig::default();
        // wall-clock jitter between the two completions must not count as
        // a duration discrepancy here
        config.max_execution_time_difference = 1_000_000;
        let mut f = fixture(config);
        complete_roundtrip(&mut f, &query("UPDATE t SET x=1"), b"\x00same", b"\x00same");
        assert!(f.exporter.take().is_empty());
    }

    #[test]
    fn test_duration_discrepancy_is_reported() {
        let mut config = DiffConfig::default();
        config.explain = Explain::None;
        let mut f = fixture(config);

        assert!(f.session.route_query(&mut f.client, &query("SELECT 1")));
        let reply = ok_reply();
        f.session
            .client_reply(&mut f.client, Target::Main, b"\x00same", &reply);
        // the other takes visibly longer than the main did
        std::thread::sleep(std::time::Duration::from_millis(25));
        f.session
            .client_reply(&mut f.client, Target::Other(0), b"\x00same", &reply);

        let reports = f.exporter.take();
        assert_eq!(reports.len(), 1);
        let results = reports[0]["results"].as_array().unwrap();
        // same checksum: it was the duration rule that fired
        assert_eq!(results[0]["checksum"], results[1]["checksum"]);
    }

    #[test]
    fn test_checksum_discrepancy_is_reported() {
        let mut config = DiffConfig::default();
        config.explain = Explain::None;
        let mut f = fixture(config);

        complete_roundtrip(&mut f, &query("SELECT * FROM big"), b"rows-a", b"rows-b");
        let reports = f.exporter.take();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report["session"], 7);
        assert_eq!(report["command"], "COM_QUERY");
        assert_eq!(report["query"], "SELECT * FROM big");
        let results = report["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["target"], "main1");
        assert_eq!(results[1]["target"], "other1");
        assert_ne!(results[0]["checksum"], results[1]["checksum"]);
    }

    #[test]
    fn test_report_always_reports_matches_too() {
        let mut config = DiffConfig::default();
        config.report = Report::Always;
        config.explain = Explain::None;
        let mut f = fixture(config);

        complete_roundtrip(&mut f, &query("SELECT 1"), b"\x00same", b"\x00same");
        assert_eq!(f.exporter.take().len(), 1);
    }

    #[test]
    fn test_discrepancy_schedules_explain_then_reports_with_it() {
        let mut config = DiffConfig::default();
        config.explain = Explain::Other;
        config.entries = 1;
        let mut f = fixture(config);

        complete_roundtrip(&mut f, &query("SELECT * FROM big"), b"rows-a", b"rows-b");
        // no report yet: the EXPLAIN is in flight on the other backend
        assert!(f.exporter.take().is_empty());
        {
            let writes = f.other_writes.lock().unwrap();
            assert_eq!(writes.len(), 2);
            assert!(writes[1].0.starts_with(b"\x03EXPLAIN FORMAT=JSON SELECT * FROM big"));
        }

        let mut explain_reply = resultset_reply(1);
        explain_reply.row_data = vec![vec!["{\"query_block\": {\"cost\": 1}}".to_string()]];
        f.session
            .client_reply(&mut f.client, Target::Other(0), b"explain", &explain_reply);

        let reports = f.exporter.take();
        assert_eq!(reports.len(), 1);
        let other_json = &reports[0]["results"][1];
        assert_eq!(other_json["explain"]["query_block"]["cost"], 1);

        // the second identical query reports straight away with the
        // earlier explainer
        complete_roundtrip(&mut f, &query("SELECT * FROM big"), b"rows-a", b"rows-b");
        let reports = f.exporter.take();
        assert_eq!(reports.len(), 1);
        let other_json = &reports[0]["results"][1];
        assert!(other_json["explain"].is_null());
        let explained_by = other_json["explained_by"].as_array().unwrap();
        assert_eq!(explained_by.len(), 1);
    }

    #[test]
    fn test_lag_shedding_skips_plain_selects() {
        let mut config = DiffConfig::default();
        config.max_request_lag = 2;
        config.explain = Explain::None;
        let mut f = fixture(config);

        // O answers nothing; its FIFO keeps growing
        for _ in 0..10 {
            assert!(f.session.route_query(&mut f.client, &query("SELECT 1")));
            // main always answers straight away
            let reply = ok_reply();
            f.session
                .client_reply(&mut f.client, Target::Main, b"\x00ok", &reply);
        }

        let skipped = f.session.others()[0].stats().requests_skipped();
        assert!(skipped > 0, "expected lag shedding to kick in");
        let other_writes = f.other_writes.lock().unwrap().len();
        assert_eq!(other_writes as i64 + skipped, 10);
    }

    #[test]
    fn test_writes_are_never_lag_shed() {
        let mut config = DiffConfig::default();
        config.max_request_lag = 1;
        config.explain = Explain::None;
        let mut f = fixture(config);

        for _ in 0..5 {
            f.session.route_query(&mut f.client, &query("SELECT 1"));
            let reply = ok_reply();
            f.session
                .client_reply(&mut f.client, Target::Main, b"\x00ok", &reply);
        }
        let writes_before = f.other_writes.lock().unwrap().len();

        f.session
            .route_query(&mut f.client, &query("UPDATE t SET x=2"));
        f.session
            .route_query(&mut f.client, &query("SELECT * FROM t FOR UPDATE"));
        let writes_after = f.other_writes.lock().unwrap().len();
        assert_eq!(writes_after, writes_before + 2);
    }

    #[test]
    fn test_fifo_command_sequences_stay_aligned() {
        let mut config = DiffConfig::default();
        config.explain = Explain::None;
        let mut f = fixture(config);

        let statements = [
            query("SELECT 1"),
            query("UPDATE t SET x=1"),
            query("SELECT 2"),
        ];
        for payload in &statements {
            assert!(f.session.route_query(&mut f.client, payload));
        }
        let main_writes: Vec<u8> = f.main_writes.lock().unwrap().iter().map(|w| w.0[0]).collect();
        let other_writes: Vec<u8> =
            f.other_writes.lock().unwrap().iter().map(|w| w.0[0]).collect();
        assert_eq!(main_writes, other_writes);
    }

    #[test]
    fn test_session_modifying_request_lands_in_history() {
        let mut config = DiffConfig::default();
        config.explain = Explain::None;
        let mut f = fixture(config);

        complete_roundtrip(&mut f, &query("SET autocommit=0"), b"\x00ok", b"\x00ok");
        assert_eq!(f.client.history.len(), 1);
        let entry = &f.client.history.entries()[0];
        assert!(entry.ok);
        assert_eq!(entry.payload, query("SET autocommit=0"));

        // plain selects stay out of the history
        complete_roundtrip(&mut f, &query("SELECT 1"), b"\x00ok", b"\x00ok");
        assert_eq!(f.client.history.len(), 1);
    }

    #[test]
    fn test_execute_type_capture_and_close_pruning() {
        let mut config = DiffConfig::default();
        config.explain = Explain::None;
        let mut f = fixture(config);
        f.client.ps_params.insert(1, 2);

        // typed execute: flag 1 + two type pairs
        let mut execute = vec![CommandCode::ComStmtExecute as u8];
        execute.extend_from_slice(&1u32.to_le_bytes());
        execute.push(0);
        execute.extend_from_slice(&1u32.to_le_bytes());
        execute.push(0x00); // null bitmap
        execute.push(0x01); // new-params-bound
        execute.extend_from_slice(&[0x08, 0x00, 0x08, 0x00]);
        f.session.route_query(&mut f.client, &execute);
        assert_eq!(
            f.client.exec_metadata.get(&1).unwrap(),
            &vec![0x08, 0x00, 0x08, 0x00]
        );

        let mut close = vec![CommandCode::ComStmtClose as u8];
        close.extend_from_slice(&1u32.to_le_bytes());
        f.session.route_query(&mut f.client, &close);
        assert!(f.client.exec_metadata.is_empty());
        assert!(f.client.ps_params.is_empty());
    }

    #[test]
    fn test_on_error_policy() {
        let mut f = fixture(DiffConfig::default());
        // an other failing is survivable under the default ignore policy
        assert!(f.session.handle_error(Target::Other(0)));
        assert!(!f.session.others()[0].in_use());
        // further requests only go to the main
        assert!(f.session.route_query(&mut f.client, &query("SELECT 1")));
        assert_eq!(f.other_writes.lock().unwrap().len(), 0);

        // the main failing ends the session
        assert!(!f.session.handle_error(Target::Main));
        assert!(!f.session.route_query(&mut f.client, &query("SELECT 1")));
    }

    #[test]
    fn test_on_error_close_policy_ends_the_session() {
        let mut config = DiffConfig::default();
        config.on_error = OnError::Close;
        let mut f = fixture(config);
        assert!(!f.session.handle_error(Target::Other(0)));
    }

    #[test]
    fn test_close_collects_stats() {
        let mut config = DiffConfig::default();
        config.explain = Explain::None;
        let mut f = fixture(config);
        complete_roundtrip(&mut f, &query("SELECT 1"), b"\x00ok", b"\x00ok");

        let stats = f.session.close();
        assert_eq!(stats.main_name, "main1");
        assert_eq!(stats.main_stats.responses(), 1);
        assert!(stats.others.contains_key("other1"));
    }
}
