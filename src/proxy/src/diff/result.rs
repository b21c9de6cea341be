use crate::diff::registry::RegistryEntry;
use crate::protocol::mysql::reply::Reply;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Mutable part of every result: timing, the running checksum and the
/// terminal reply.
struct ResultCore {
    start: Instant,
    end: Option<Instant>,
    checksum: crc32fast::Hasher,
    reply: Option<Reply>,
    explainers: Vec<RegistryEntry>,
}

impl ResultCore {
    fn new() -> Self {
        ResultCore {
            start: Instant::now(),
            end: None,
            checksum: crc32fast::Hasher::new(),
            reply: None,
            explainers: Vec::new(),
        }
    }

    fn process(&mut self, buffer: &[u8]) {
        debug_assert!(self.end.is_none());
        self.checksum.update(buffer);
    }

    fn close(&mut self, reply: &Reply) -> Duration {
        debug_assert!(self.end.is_none());
        let end = Instant::now();
        self.end = Some(end);
        self.reply = Some(reply.clone());
        end.duration_since(self.start)
    }

    fn closed(&self) -> bool {
        self.end.is_some()
    }

    fn duration(&self) -> Duration {
        match self.end {
            Some(end) => end.duration_since(self.start),
            None => Duration::ZERO,
        }
    }

    fn checksum(&self) -> u32 {
        self.checksum.clone().finalize()
    }
}

macro_rules! core_accessors {
    () => {
        pub fn process(&self, buffer: &[u8]) {
            self.core.lock().unwrap().process(buffer);
        }

        pub fn closed(&self) -> bool {
            self.core.lock().unwrap().closed()
        }

        pub fn duration(&self) -> Duration {
            self.core.lock().unwrap().duration()
        }

        pub fn checksum(&self) -> u32 {
            self.core.lock().unwrap().checksum()
        }

        pub fn checksum_hex(&self) -> String {
            hex::encode(self.checksum().to_be_bytes())
        }

        pub fn reply(&self) -> Reply {
            self.core
                .lock()
                .unwrap()
                .reply
                .clone()
                .unwrap_or_default()
        }

        pub fn set_explainers(&self, explainers: Vec<RegistryEntry>) {
            self.core.lock().unwrap().explainers = explainers;
        }

        pub fn explainers(&self) -> Vec<RegistryEntry> {
            self.core.lock().unwrap().explainers.clone()
        }
    };
}

/// Result of a client request on the main backend. Shared by every
/// dependent other-result of the same request; completion wakes whichever
/// dependents already finished.
pub struct MainResult {
    id: u64,
    target: String,
    sql: String,
    command: u8,
    canonical: String,
    canonical_hash: u64,
    core: Mutex<ResultCore>,
    dependents: Mutex<Vec<Weak<OtherResult>>>,
}

impl MainResult {
    pub fn new(
        target: impl Into<String>,
        sql: impl Into<String>,
        command: u8,
        canonical: impl Into<String>,
        canonical_hash: u64,
    ) -> Arc<Self> {
        Arc::new(MainResult {
            id: next_id(),
            target: target.into(),
            sql: sql.into(),
            command,
            canonical: canonical.into(),
            canonical_hash,
            core: Mutex::new(ResultCore::new()),
            dependents: Mutex::new(Vec::new()),
        })
    }

    core_accessors!();

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn canonical_hash(&self) -> u64 {
        self.canonical_hash
    }

    pub fn is_explainable(&self) -> bool {
        !self.sql.is_empty()
    }

    fn add_dependent(&self, dependent: &Arc<OtherResult>) {
        self.dependents.lock().unwrap().push(Arc::downgrade(dependent));
    }

    fn remove_dependent(&self, dependent: &Arc<OtherResult>) {
        self.dependents
            .lock()
            .unwrap()
            .retain(|w| !w.ptr_eq(&Arc::downgrade(dependent)));
    }

    /// Close with the terminal reply. Returns the duration and the
    /// dependents that were already complete and are now ready.
    pub fn close(&self, reply: &Reply) -> (Duration, Vec<Arc<OtherResult>>) {
        let duration = self.core.lock().unwrap().close(reply);

        // Iterate a snapshot: ready dependents unregister themselves.
        let snapshot: Vec<_> = self.dependents.lock().unwrap().clone();
        let mut ready = Vec::new();
        for weak in snapshot {
            if let Some(dependent) = weak.upgrade() {
                if dependent.closed() {
                    dependent.deregister_from_main();
                    ready.push(dependent);
                }
            }
        }
        (duration, ready)
    }
}

/// Result of the same request on a comparison target. Holds a strong
/// reference to its main result; the main only ever holds a weak one back.
pub struct OtherResult {
    target: String,
    main: Arc<MainResult>,
    core: Mutex<ResultCore>,
    registered: Mutex<bool>,
}

impl OtherResult {
    pub fn new(target: impl Into<String>, main: Arc<MainResult>) -> Arc<Self> {
        let result = Arc::new(OtherResult {
            target: target.into(),
            main,
            core: Mutex::new(ResultCore::new()),
            registered: Mutex::new(false),
        });
        result.register_at_main();
        result
    }

    core_accessors!();

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn main_result(&self) -> &Arc<MainResult> {
        &self.main
    }

    pub fn id(&self) -> u64 {
        self.main.id()
    }

    pub fn sql(&self) -> &str {
        self.main.sql()
    }

    pub fn command(&self) -> u8 {
        self.main.command()
    }

    pub fn canonical(&self) -> &str {
        self.main.canonical()
    }

    pub fn canonical_hash(&self) -> u64 {
        self.main.canonical_hash()
    }

    pub fn is_explainable(&self) -> bool {
        self.main.is_explainable()
    }

    fn register_at_main(self: &Arc<Self>) {
        let mut registered = self.registered.lock().unwrap();
        debug_assert!(!*registered);
        self.main.add_dependent(self);
        *registered = true;
    }

    fn deregister_from_main(self: &Arc<Self>) {
        let mut registered = self.registered.lock().unwrap();
        if *registered {
            self.main.remove_dependent(self);
            *registered = false;
        }
    }

    /// Close with the terminal reply; `true` when the main already closed,
    /// i.e. this completion makes the pair ready.
    pub fn close(self: &Arc<Self>, reply: &Reply) -> bool {
        self.core.lock().unwrap().close(reply);
        if self.main.closed() {
            self.deregister_from_main();
            true
        } else {
            false
        }
    }
}

/// EXPLAIN of the main's execution of a reported statement.
pub struct ExplainMainResult {
    main: Arc<MainResult>,
    core: Mutex<ResultCore>,
    json: Mutex<String>,
    dependents: Mutex<Vec<Weak<ExplainOtherResult>>>,
}

impl ExplainMainResult {
    pub fn new(main: Arc<MainResult>) -> Arc<Self> {
        Arc::new(ExplainMainResult {
            main,
            core: Mutex::new(ResultCore::new()),
            json: Mutex::new(String::new()),
            dependents: Mutex::new(Vec::new()),
        })
    }

    core_accessors!();

    pub fn sql(&self) -> &str {
        self.main.sql()
    }

    pub fn json(&self) -> String {
        self.json.lock().unwrap().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.reply().error.map(|e| e.message)
    }

    fn add_dependent(&self, dependent: &Arc<ExplainOtherResult>) {
        self.dependents.lock().unwrap().push(Arc::downgrade(dependent));
    }

    /// Close; the EXPLAIN's own duration never counts into the totals.
    pub fn close(&self, reply: &Reply) -> Vec<Arc<ExplainOtherResult>> {
        self.core.lock().unwrap().close(reply);
        if let Some(row) = reply.row_data.first() {
            if let Some(value) = row.first() {
                *self.json.lock().unwrap() = value.clone();
            }
        }

        let snapshot: Vec<_> = self.dependents.lock().unwrap().clone();
        let mut ready = Vec::new();
        for weak in snapshot {
            if let Some(dependent) = weak.upgrade() {
                if dependent.closed() {
                    ready.push(dependent);
                }
            }
        }
        self.dependents.lock().unwrap().clear();
        ready
    }
}

/// EXPLAIN of an other's execution; optionally waits for the corresponding
/// EXPLAIN on the main.
pub struct ExplainOtherResult {
    other: Arc<OtherResult>,
    explain_main: Option<Arc<ExplainMainResult>>,
    core: Mutex<ResultCore>,
    json: Mutex<String>,
}

impl ExplainOtherResult {
    pub fn new(
        other: Arc<OtherResult>,
        explain_main: Option<Arc<ExplainMainResult>>,
    ) -> Arc<Self> {
        let result = Arc::new(ExplainOtherResult {
            other,
            explain_main,
            core: Mutex::new(ResultCore::new()),
            json: Mutex::new(String::new()),
        });
        if let Some(main) = &result.explain_main {
            main.add_dependent(&result);
        }
        result
    }

    core_accessors!();

    pub fn sql(&self) -> &str {
        self.other.sql()
    }

    pub fn origin_result(&self) -> &Arc<OtherResult> {
        &self.other
    }

    pub fn explain_main_result(&self) -> Option<&Arc<ExplainMainResult>> {
        self.explain_main.as_ref()
    }

    pub fn json(&self) -> String {
        self.json.lock().unwrap().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.reply().error.map(|e| e.message)
    }

    /// Close; `true` when there is no EXPLAIN-main to wait for or it
    /// already closed.
    pub fn close(self: &Arc<Self>, reply: &Reply) -> bool {
        self.core.lock().unwrap().close(reply);
        if let Some(row) = reply.row_data.first() {
            if let Some(value) = row.first() {
                *self.json.lock().unwrap() = value.clone();
            }
        }
        match &self.explain_main {
            Some(main) => main.closed(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_reply() -> Reply {
        Reply {
            is_ok: true,
            ..Default::default()
        }
    }

    fn main_result() -> Arc<MainResult> {
        MainResult::new("main1", "SELECT 1", 3, "SELECT ?", 42)
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = main_result();
        let b = main_result();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_other_completing_last_is_ready_at_its_close() {
        let main = main_result();
        let other = OtherResult::new("other1", main.clone());

        main.process(b"\x01\x02");
        other.process(b"\x01\x02");

        let (_, ready) = main.close(&ok_reply());
        assert!(ready.is_empty()); // other not complete yet

        assert!(other.close(&ok_reply()));
        assert_eq!(other.checksum(), main.checksum());
    }

    #[test]
    fn test_main_completing_last_wakes_dependents() {
        let main = main_result();
        let other = OtherResult::new("other1", main.clone());

        assert!(!other.close(&ok_reply())); // main still open

        let (_, ready) = main.close(&ok_reply());
        assert_eq!(ready.len(), 1);
        assert!(Arc::ptr_eq(&ready[0], &other));

        // the dependent unregistered itself; closing again cannot re-ready it
        assert!(main.dependents.lock().unwrap().is_empty());
    }

    #[test]
    fn test_checksum_differs_on_different_payloads() {
        let main = main_result();
        let other = OtherResult::new("other1", main.clone());
        main.process(b"row-a");
        other.process(b"row-b");
        main.close(&ok_reply());
        other.close(&ok_reply());
        assert_ne!(main.checksum(), other.checksum());
    }

    #[test]
    fn test_explain_pair_readiness() {
        let main = main_result();
        let other = OtherResult::new("other1", main.clone());
        main.close(&ok_reply());
        other.close(&ok_reply());

        let explain_main = ExplainMainResult::new(main.clone());
        let explain_other = ExplainOtherResult::new(other.clone(), Some(explain_main.clone()));

        let mut reply = ok_reply();
        reply.row_data = vec![vec!["{\"query_block\":{}}".to_string()]];

        assert!(!explain_other.close(&reply)); // waits for the main explain
        let ready = explain_main.close(&reply);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].json(), "{\"query_block\":{}}");
        assert_eq!(explain_main.json(), "{\"query_block\":{}}");
    }

    #[test]
    fn test_explain_other_without_main_is_ready_immediately() {
        let main = main_result();
        let other = OtherResult::new("other1", main.clone());
        main.close(&ok_reply());
        other.close(&ok_reply());

        let explain_other = ExplainOtherResult::new(other, None);
        assert!(explain_other.close(&ok_reply()));
    }
}
