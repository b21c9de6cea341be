use crate::diff::exporter::Exporter;
use crate::diff::qps::{unix_now_secs, DiffQps};
use crate::diff::result::{ExplainMainResult, ExplainOtherResult, MainResult, OtherResult};
use crate::diff::stats::{DiffOtherStats, DiffStats};
use crate::protocol::mysql::packet::writers::build_com_query;
use crate::protocol::mysql::reply::Reply;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    ExpectResponse,
    IgnoreResponse,
    NoResponse,
}

/// Whether the response that just completed should continue to the client
/// or stay internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Continue,
    Stop,
}

/// Write side of the actual backend connection, as seen by the diff layer.
pub trait Endpoint: Send {
    fn name(&self) -> &str;
    fn in_use(&self) -> bool;
    fn extraordinary_in_process(&self) -> bool;
    fn write(&mut self, payload: Vec<u8>, response: ResponseType, id: u64, collect_rows: bool)
        -> bool;
    fn close(&mut self);
}

enum MainFifoItem {
    Query(Arc<MainResult>),
    Explain(Arc<ExplainMainResult>),
}

enum OtherFifoItem {
    Query(Arc<OtherResult>),
    Explain(Arc<ExplainOtherResult>),
}

/// Completion events handed back to the router session.
pub enum MainFinish {
    Query {
        result: Arc<MainResult>,
        ready_others: Vec<Arc<OtherResult>>,
    },
    Explain {
        result: Arc<ExplainMainResult>,
        ready_others: Vec<Arc<ExplainOtherResult>>,
    },
}

pub enum OtherFinish {
    Query {
        result: Arc<OtherResult>,
        ready: bool,
    },
    Explain {
        result: Arc<ExplainOtherResult>,
        ready: bool,
    },
}

fn book_write(
    stats: &mut DiffStats,
    response: ResponseType,
    explainable: bool,
    extraordinary: bool,
) {
    stats.inc_request_packets();
    if !extraordinary {
        stats.inc_requests();
        if response != ResponseType::NoResponse {
            stats.inc_requests_responding();
            if explainable {
                stats.inc_requests_explainable();
            }
        }
    }
}

/// Counters tuned after an internal EXPLAIN write: the general request
/// counters must not include it.
fn book_explain(stats: &mut DiffStats) {
    stats.inc_explain_requests();
    stats.dec_request_packets();
    stats.dec_requests();
    stats.dec_requests_explainable();
    stats.dec_requests_responding();
}

/// The authoritative target: its replies go to the client.
pub struct DiffMainBackend {
    endpoint: Box<dyn Endpoint>,
    results: VecDeque<MainFifoItem>,
    pending_explains: VecDeque<Arc<ExplainMainResult>>,
    stats: DiffStats,
    qps: DiffQps,
}

impl DiffMainBackend {
    pub fn new(endpoint: Box<dyn Endpoint>, qps_window: Duration) -> Self {
        DiffMainBackend {
            endpoint,
            results: VecDeque::new(),
            pending_explains: VecDeque::new(),
            stats: DiffStats::default(),
            qps: DiffQps::new(qps_window.as_secs() as usize),
        }
    }

    pub fn name(&self) -> String {
        self.endpoint.name().to_string()
    }

    pub fn in_use(&self) -> bool {
        self.endpoint.in_use()
    }

    pub fn extraordinary_in_process(&self) -> bool {
        self.endpoint.extraordinary_in_process()
    }

    pub fn backlog(&self) -> usize {
        self.results.len()
    }

    /// The response currently at the head of the FIFO belongs to an
    /// internal EXPLAIN, not to the client.
    pub fn front_is_internal(&self) -> bool {
        matches!(self.results.front(), Some(MainFifoItem::Explain(_)))
    }

    pub fn stats(&self) -> &DiffStats {
        &self.stats
    }

    pub fn qps(&self) -> &DiffQps {
        &self.qps
    }

    pub fn take_stats(&mut self) -> (DiffStats, DiffQps) {
        let qps = self.qps.clone();
        self.qps.clear();
        (std::mem::take(&mut self.stats), qps)
    }

    /// Register the result for a client request about to be written.
    pub fn prepare(
        &mut self,
        sql: impl Into<String>,
        command: u8,
        canonical: impl Into<String>,
        canonical_hash: u64,
    ) -> Arc<MainResult> {
        let result = MainResult::new(self.name(), sql, command, canonical, canonical_hash);
        self.results.push_back(MainFifoItem::Query(result.clone()));
        result
    }

    pub fn write(
        &mut self,
        payload: Vec<u8>,
        response: ResponseType,
        id: u64,
        explainable: bool,
        collect_rows: bool,
    ) -> bool {
        book_write(
            &mut self.stats,
            response,
            explainable,
            self.endpoint.extraordinary_in_process(),
        );
        self.endpoint.write(payload, response, id, collect_rows)
    }

    /// CRC-accumulate one reply packet into the in-flight result.
    pub fn process_result(&mut self, buffer: &[u8]) {
        match self.results.front() {
            Some(MainFifoItem::Query(result)) => result.process(buffer),
            Some(MainFifoItem::Explain(result)) => result.process(buffer),
            None => {}
        }
    }

    /// Complete the in-flight result with its terminal reply.
    pub fn finish_result(&mut self, reply: &Reply) -> Option<(Routing, MainFinish)> {
        let item = self.results.pop_front()?;
        self.stats.inc_responses();
        self.qps.inc(unix_now_secs());

        match item {
            MainFifoItem::Query(result) => {
                let (duration, ready_others) = result.close(reply);
                self.stats
                    .add_canonical_result(Some(result.canonical()), duration);
                Some((
                    Routing::Continue,
                    MainFinish::Query {
                        result,
                        ready_others,
                    },
                ))
            }
            MainFifoItem::Explain(result) => {
                let ready_others = result.close(reply);
                self.stats.inc_explain_responses();
                self.stats.add_explain_duration(result.duration());
                Some((
                    Routing::Stop,
                    MainFinish::Explain {
                        result,
                        ready_others,
                    },
                ))
            }
        }
    }

    pub fn close(&mut self) {
        self.endpoint.close();
        self.results.clear();
        self.pending_explains.clear();
    }

    pub fn schedule_explain(&mut self, result: Arc<ExplainMainResult>) {
        self.pending_explains.push_back(result);
    }

    /// Execute queued EXPLAINs once nothing extraordinary is in process.
    pub fn execute_pending_explains(&mut self) {
        if self.endpoint.extraordinary_in_process() {
            return;
        }
        while let Some(result) = self.pending_explains.pop_front() {
            let sql = format!("EXPLAIN FORMAT=JSON {}", result.sql());
            let payload = build_com_query(&sql);
            self.results.push_back(MainFifoItem::Explain(result));
            let ok = self.write(payload, ResponseType::ExpectResponse, 0, true, true);
            book_explain(&mut self.stats);
            if !ok {
                break;
            }
        }
    }
}

/// A comparison target: its replies are consumed internally.
pub struct DiffOtherBackend {
    endpoint: Box<dyn Endpoint>,
    exporter: Arc<dyn Exporter>,
    results: VecDeque<OtherFifoItem>,
    pending_explains: VecDeque<Arc<ExplainOtherResult>>,
    stats: DiffOtherStats,
    qps: DiffQps,
}

impl DiffOtherBackend {
    pub fn new(
        endpoint: Box<dyn Endpoint>,
        exporter: Arc<dyn Exporter>,
        qps_window: Duration,
    ) -> Self {
        DiffOtherBackend {
            endpoint,
            exporter,
            results: VecDeque::new(),
            pending_explains: VecDeque::new(),
            stats: DiffOtherStats::default(),
            qps: DiffQps::new(qps_window.as_secs() as usize),
        }
    }

    pub fn name(&self) -> String {
        self.endpoint.name().to_string()
    }

    pub fn in_use(&self) -> bool {
        self.endpoint.in_use()
    }

    pub fn extraordinary_in_process(&self) -> bool {
        self.endpoint.extraordinary_in_process()
    }

    pub fn backlog(&self) -> usize {
        self.results.len()
    }

    pub fn exporter(&self) -> Arc<dyn Exporter> {
        self.exporter.clone()
    }

    pub fn stats(&self) -> &DiffOtherStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut DiffOtherStats {
        &mut self.stats
    }

    pub fn qps(&self) -> &DiffQps {
        &self.qps
    }

    pub fn take_stats(&mut self) -> (DiffOtherStats, DiffQps) {
        let qps = self.qps.clone();
        self.qps.clear();
        (std::mem::take(&mut self.stats), qps)
    }

    pub fn inc_requests_skipped(&mut self) {
        self.stats.inc_requests_skipped();
    }

    pub fn prepare(&mut self, main_result: &Arc<MainResult>) -> Arc<OtherResult> {
        let result = OtherResult::new(self.name(), main_result.clone());
        self.results.push_back(OtherFifoItem::Query(result.clone()));
        result
    }

    pub fn write(
        &mut self,
        payload: Vec<u8>,
        response: ResponseType,
        id: u64,
        explainable: bool,
        collect_rows: bool,
    ) -> bool {
        book_write(
            &mut self.stats,
            response,
            explainable,
            self.endpoint.extraordinary_in_process(),
        );
        self.endpoint.write(payload, response, id, collect_rows)
    }

    pub fn process_result(&mut self, buffer: &[u8]) {
        match self.results.front() {
            Some(OtherFifoItem::Query(result)) => result.process(buffer),
            Some(OtherFifoItem::Explain(result)) => result.process(buffer),
            None => {}
        }
    }

    pub fn finish_result(&mut self, reply: &Reply) -> Option<(Routing, OtherFinish)> {
        let item = self.results.pop_front()?;
        self.stats.inc_responses();
        self.qps.inc(unix_now_secs());

        match item {
            OtherFifoItem::Query(result) => {
                let ready = result.close(reply);
                let duration = result.duration();
                self.stats
                    .add_canonical_result(Some(result.canonical()), duration);
                Some((Routing::Stop, OtherFinish::Query { result, ready }))
            }
            OtherFifoItem::Explain(result) => {
                let ready = result.close(reply);
                self.stats.inc_explain_responses();
                self.stats.add_explain_duration(result.duration());
                Some((Routing::Stop, OtherFinish::Explain { result, ready }))
            }
        }
    }

    pub fn close(&mut self) {
        self.endpoint.close();
        self.results.clear();
        self.pending_explains.clear();
    }

    pub fn schedule_explain(&mut self, result: Arc<ExplainOtherResult>) {
        self.pending_explains.push_back(result);
    }

    pub fn execute_pending_explains(&mut self) {
        if self.endpoint.extraordinary_in_process() {
            return;
        }
        while let Some(result) = self.pending_explains.pop_front() {
            let sql = format!("EXPLAIN FORMAT=JSON {}", result.sql());
            let payload = build_com_query(&sql);
            self.results.push_back(OtherFifoItem::Explain(result));
            let ok = self.write(payload, ResponseType::ExpectResponse, 0, true, true);
            book_explain(&mut self.stats);
            if !ok {
                break;
            }
        }
    }
}

/// One request queued for a connection's driver task.
#[derive(Debug)]
pub struct OutboundPacket {
    pub payload: Vec<u8>,
    pub response: ResponseType,
    pub id: u64,
    pub collect_rows: bool,
}

/// `Endpoint` over a queue drained by the task that owns the actual
/// `BackendConnection`. The shared flags mirror the connection's liveness
/// and login/replay progress.
pub struct ChannelEndpoint {
    name: String,
    sender: tokio::sync::mpsc::UnboundedSender<OutboundPacket>,
    in_use: std::sync::Arc<std::sync::atomic::AtomicBool>,
    extraordinary: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl ChannelEndpoint {
    pub fn new(
        name: impl Into<String>,
    ) -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<OutboundPacket>,
        std::sync::Arc<std::sync::atomic::AtomicBool>,
        std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let in_use = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let extraordinary = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        (
            ChannelEndpoint {
                name: name.into(),
                sender,
                in_use: in_use.clone(),
                extraordinary: extraordinary.clone(),
            },
            receiver,
            in_use,
            extraordinary,
        )
    }
}

impl Endpoint for ChannelEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_use(&self) -> bool {
        self.in_use.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn extraordinary_in_process(&self) -> bool {
        self.extraordinary.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn write(
        &mut self,
        payload: Vec<u8>,
        response: ResponseType,
        id: u64,
        collect_rows: bool,
    ) -> bool {
        self.sender
            .send(OutboundPacket {
                payload,
                response,
                id,
                collect_rows,
            })
            .is_ok()
    }

    fn close(&mut self) {
        self.in_use
            .store(false, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc as StdArc, Mutex};

    /// Endpoint that records every write, for driving the diff layer
    /// without sockets.
    pub struct RecordingEndpoint {
        name: String,
        pub writes: StdArc<Mutex<Vec<(Vec<u8>, ResponseType)>>>,
        pub in_use: bool,
    }

    impl RecordingEndpoint {
        pub fn new(name: &str) -> (Self, StdArc<Mutex<Vec<(Vec<u8>, ResponseType)>>>) {
            let writes = StdArc::new(Mutex::new(Vec::new()));
            (
                RecordingEndpoint {
                    name: name.to_string(),
                    writes: writes.clone(),
                    in_use: true,
                },
                writes,
            )
        }
    }

    impl Endpoint for RecordingEndpoint {
        fn name(&self) -> &str {
            &self.name
        }

        fn in_use(&self) -> bool {
            self.in_use
        }

        fn extraordinary_in_process(&self) -> bool {
            false
        }

        fn write(
            &mut self,
            payload: Vec<u8>,
            response: ResponseType,
            _id: u64,
            _collect_rows: bool,
        ) -> bool {
            self.writes.lock().unwrap().push((payload, response));
            true
        }

        fn close(&mut self) {
            self.in_use = false;
        }
    }
}
