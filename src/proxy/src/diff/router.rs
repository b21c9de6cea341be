use crate::backend::ServerInfo;
use crate::diff::backend::{DiffMainBackend, DiffOtherBackend, Endpoint};
use crate::diff::config::DiffConfig;
use crate::diff::exporter::{build_exporter, Exporter};
use crate::diff::registry::Registry;
use crate::diff::repl::{get_replication_status, ReplicaControl, ReplicationStatus};
use crate::diff::session::DiffRouterSession;
use crate::diff::stats::{DiffRouterSessionStats, DiffRouterStats};
use crate::error::{ProxyError, Result};
use crate::parser::{DefaultParser, QueryParser};
use crate::service::{ServiceControl, SessionResult};

use chrono::Local;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SETUP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffState {
    Prepared,
    Synchronizing,
    Comparing,
    Stopping,
}

impl DiffState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffState::Prepared => "prepared",
            DiffState::Synchronizing => "synchronizing",
            DiffState::Comparing => "comparing",
            DiffState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NotApplicable,
    SuspendingSessions,
    StoppingReplication,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NotApplicable => "not_applicable",
            SyncState::SuspendingSessions => "suspending_sessions",
            SyncState::StoppingReplication => "stopping_replication",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summary {
    Return,
    Save,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicationState {
    Ready,
    Lagging,
    Error,
}

/// The comparison router: owns configuration, the EXPLAIN registry, the
/// aggregated statistics and the start/stop lifecycle that moves the main
/// server out of the enclosing service and back.
pub struct DiffRouter {
    config: Arc<DiffConfig>,
    registry: Arc<Registry>,
    parser: Arc<dyn QueryParser>,
    stats: Mutex<DiffRouterStats>,
    exporters: DashMap<String, Arc<dyn Exporter>>,
    service: Arc<dyn ServiceControl>,
    repl: Arc<dyn ReplicaControl>,
    servers: Vec<ServerInfo>,
    state: Mutex<(DiffState, SyncState)>,
    stop_replication: Mutex<Vec<String>>,
    start_replication: Mutex<Vec<String>>,
    dcall: Mutex<Option<JoinHandle<()>>>,
    next_session_id: AtomicU64,
}

impl DiffRouter {
    pub fn new(
        config: DiffConfig,
        servers: Vec<ServerInfo>,
        service: Arc<dyn ServiceControl>,
        repl: Arc<dyn ReplicaControl>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(Registry::new(config.entries, config.period));
        let config = Arc::new(config);

        let router = Arc::new(DiffRouter {
            stats: Mutex::new(DiffRouterStats::new(config.main.as_str(), config.qps_window)),
            registry,
            parser: Arc::new(DefaultParser),
            exporters: DashMap::new(),
            service,
            repl,
            servers,
            state: Mutex::new((DiffState::Prepared, SyncState::NotApplicable)),
            stop_replication: Mutex::new(Vec::new()),
            start_replication: Mutex::new(Vec::new()),
            dcall: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
            config,
        });
        router.update_exporters()?;
        Ok(router)
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn state(&self) -> (DiffState, SyncState) {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, diff_state: DiffState, sync_state: SyncState) {
        *self.state.lock().unwrap() = (diff_state, sync_state);
    }

    /// One exporter per comparison target, rebuilt on reconfiguration.
    fn update_exporters(&self) -> Result<()> {
        for server in &self.servers {
            if server.name == self.config.main || self.exporters.contains_key(&server.name) {
                continue;
            }
            let exporter = build_exporter(
                &self.config.data_dir,
                &self.config.service,
                &self.config.main,
                &server.name,
            )?;
            self.exporters.insert(server.name.clone(), exporter);
        }
        Ok(())
    }

    pub fn exporter_for(&self, target: &str) -> Option<Arc<dyn Exporter>> {
        self.exporters.get(target).map(|e| e.clone())
    }

    /// Build the per-client router session over already-connected
    /// endpoints; the first one is the main.
    pub fn new_session(
        &self,
        main_endpoint: Box<dyn Endpoint>,
        other_endpoints: Vec<Box<dyn Endpoint>>,
    ) -> Result<DiffRouterSession> {
        if main_endpoint.name() != self.config.main {
            return Err(ProxyError::Lifecycle(format!(
                "main target '{}' is not listed in the targets",
                self.config.main
            )));
        }

        let main = DiffMainBackend::new(main_endpoint, self.config.qps_window);
        let mut others = Vec::with_capacity(other_endpoints.len());
        for endpoint in other_endpoints {
            let exporter = self.exporter_for(endpoint.name()).ok_or_else(|| {
                ProxyError::Lifecycle(format!("no exporter for target '{}'", endpoint.name()))
            })?;
            others.push(DiffOtherBackend::new(
                endpoint,
                exporter,
                self.config.qps_window,
            ));
        }

        Ok(DiffRouterSession::new(
            self.next_session_id.fetch_add(1, Ordering::Relaxed),
            self.config.clone(),
            self.registry.clone(),
            self.parser.clone(),
            main,
            others,
        ))
    }

    /// Merge the per-session stats at session close.
    pub fn collect(&self, session_stats: &DiffRouterSessionStats) {
        self.stats.lock().unwrap().add(session_stats, &self.config);
    }

    fn status_json(&self, sr: SessionResult) -> Value {
        let (diff_state, sync_state) = self.state();
        json!({
            "state": diff_state.as_str(),
            "sync_state": sync_state.as_str(),
            "sessions": { "total": sr.total, "suspended": sr.affected },
        })
    }

    pub async fn status(&self) -> Value {
        let sr = self.service.suspended_sessions().await;
        self.status_json(sr)
    }

    // ------------------------------------------------------------------
    // start
    // ------------------------------------------------------------------

    /// Begin the cutover: suspend sessions, wait for the replicas to catch
    /// up, stop their replication and rewire the service so traffic flows
    /// through this router. Legal only from PREPARED.
    pub async fn start(self: &Arc<Self>) -> Result<Value> {
        {
            let mut state = self.state.lock().unwrap();
            if state.0 != DiffState::Prepared {
                return Err(ProxyError::Lifecycle(format!(
                    "state is '{}', can be started only when '{}'",
                    state.0.as_str(),
                    DiffState::Prepared.as_str()
                )));
            }
            *state = (DiffState::Synchronizing, SyncState::SuspendingSessions);
        }

        if !self.collect_servers_to_be_stopped().await {
            self.service.resume_sessions().await;
            self.set_state(DiffState::Prepared, SyncState::NotApplicable);
            return Err(ProxyError::Lifecycle(
                "replica relationships do not allow a comparison".into(),
            ));
        }

        let sr = self.service.suspend_sessions().await;
        self.setup(&sr).await;

        if self.state().0 == DiffState::Synchronizing {
            self.spawn_dcall(DcallKind::Setup);
        }

        Ok(self.status_json(sr))
    }

    /// The only acceptable configurations: the other replicates from main
    /// and is doing so right now, or both replicate from the same third
    /// host in the same state.
    async fn collect_servers_to_be_stopped(&self) -> bool {
        let mut stop = Vec::new();
        let main_address = self
            .servers
            .iter()
            .find(|s| s.name == self.config.main)
            .map(|s| s.address.clone())
            .unwrap_or_default();

        for server in &self.servers {
            if server.name == self.config.main {
                continue;
            }
            let status = get_replication_status(
                self.repl.as_ref(),
                &self.config.main,
                &main_address,
                &server.name,
                &server.address,
            )
            .await;
            match status {
                ReplicationStatus::OtherReplicatesFromMain => stop.push(server.name.clone()),
                ReplicationStatus::BothReplicateFromThird => {}
                ReplicationStatus::MainReplicatesFromOther
                | ReplicationStatus::NoRelation
                | ReplicationStatus::Error => {
                    self.stop_replication.lock().unwrap().clear();
                    return false;
                }
            }
        }

        *self.stop_replication.lock().unwrap() = stop;
        self.start_replication.lock().unwrap().clear();
        true
    }

    async fn setup(self: &Arc<Self>, sr: &SessionResult) {
        if !sr.all_affected() {
            return;
        }

        match self.stop_replication().await {
            ReplicationState::Ready => {
                let service_name = self.service.name().to_string();
                if self.service.rewire(&self.config.main, &service_name).await {
                    self.restart_and_resume().await;
                    self.set_state(DiffState::Comparing, SyncState::NotApplicable);
                    info!("comparison started on service '{service_name}'");
                } else {
                    error!(
                        "could not rewire service '{service_name}' for comparison, \
                         restoring the original configuration"
                    );
                    self.service.resume_sessions().await;
                    self.set_state(DiffState::Prepared, SyncState::NotApplicable);
                }
            }
            ReplicationState::Lagging => {
                self.set_state(DiffState::Synchronizing, SyncState::StoppingReplication);
            }
            ReplicationState::Error => {
                error!("could not stop replication, resuming sessions as configured");
                self.start_replication(false).await;
                self.service.resume_sessions().await;
                self.set_state(DiffState::Prepared, SyncState::NotApplicable);
            }
        }
    }

    /// Stop replication on every classified replica whose GTID position has
    /// reached the main's across all of the main's domains.
    async fn stop_replication(&self) -> ReplicationState {
        let main_pos = match self.repl.gtid_position(&self.config.main).await {
            Ok(pos) => pos,
            Err(e) => {
                error!("could not get the gtid position of '{}': {e}", self.config.main);
                return ReplicationState::Error;
            }
        };

        let pending: Vec<String> = self.stop_replication.lock().unwrap().clone();
        let mut state = ReplicationState::Ready;

        for other in pending {
            let other_pos = match self.repl.gtid_position(&other).await {
                Ok(pos) => pos,
                Err(e) => {
                    error!("could not get the gtid position of '{other}': {e}");
                    return ReplicationState::Error;
                }
            };

            let behind = main_pos.iter().any(|(domain, position)| {
                match other_pos.get(domain) {
                    Some(other_position) => other_position < position,
                    None => true,
                }
            });

            if behind {
                info!("'{other}' is behind '{}', not breaking replication yet", self.config.main);
                state = ReplicationState::Lagging;
                continue;
            }

            match self.repl.stop_replication(&other).await {
                Ok(()) => {
                    self.stop_replication.lock().unwrap().retain(|s| s != &other);
                    self.start_replication.lock().unwrap().push(other);
                }
                Err(e) => {
                    error!("could not stop replication on '{other}': {e}");
                    return ReplicationState::Error;
                }
            }
        }

        state
    }

    async fn start_replication(&self, reset: bool) {
        let servers: Vec<String> = std::mem::take(&mut *self.start_replication.lock().unwrap());
        for server in servers {
            if let Err(e) = self.repl.start_replication(&server, reset).await {
                error!(
                    "could not {} replication of '{server}': {e}; manual intervention is needed",
                    if reset { "reset" } else { "start" }
                );
            }
        }
    }

    async fn restart_and_resume(&self) {
        let sr = self.service.restart_sessions().await;
        if !sr.all_affected() {
            warn!(
                "could only restart {} out of {} sessions of service '{}'",
                sr.affected,
                sr.total,
                self.service.name()
            );
        }
        let sr = self.service.resume_sessions().await;
        if !sr.all_affected() {
            warn!(
                "{} sessions of a total of {} were not suspended when resumed",
                sr.total - sr.affected,
                sr.total
            );
        }
    }

    // ------------------------------------------------------------------
    // stop
    // ------------------------------------------------------------------

    /// Cancel a synchronization in progress, or tear a running comparison
    /// down and restore the original topology.
    pub async fn stop(self: &Arc<Self>) -> Result<Value> {
        let current = self.state().0;
        match current {
            DiffState::Prepared => Err(ProxyError::Lifecycle(
                "the state is 'prepared', there is nothing to stop".into(),
            )),
            DiffState::Stopping => Err(ProxyError::Lifecycle(
                "the comparison is already being stopped".into(),
            )),
            DiffState::Synchronizing => {
                self.cancel_dcall();
                self.service.resume_sessions().await;
                self.set_state(DiffState::Prepared, SyncState::NotApplicable);
                let sr = self.service.suspended_sessions().await;
                Ok(self.status_json(sr))
            }
            DiffState::Comparing => {
                self.set_state(DiffState::Stopping, SyncState::SuspendingSessions);
                let sr = self.service.suspend_sessions().await;
                self.teardown(&sr).await;
                if self.state().0 == DiffState::Stopping {
                    self.spawn_dcall(DcallKind::Teardown);
                }
                Ok(self.status_json(sr))
            }
        }
    }

    async fn teardown(self: &Arc<Self>, sr: &SessionResult) {
        if !sr.all_affected() {
            return;
        }

        if self.config.reset_replication {
            self.start_replication(true).await;
        }

        let service_name = self.service.name().to_string();
        if self.service.rewire(&service_name, &self.config.main).await {
            self.restart_and_resume().await;
        } else {
            error!("could not rewire service '{service_name}' back; manual intervention is needed");
        }

        self.set_state(DiffState::Prepared, SyncState::NotApplicable);
        info!("comparison stopped on service '{service_name}'");
    }

    // ------------------------------------------------------------------
    // deferred retries
    // ------------------------------------------------------------------

    fn spawn_dcall(self: &Arc<Self>, kind: DcallKind) {
        let router = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SETUP_RETRY_INTERVAL);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let sr = router.service.suspend_sessions().await;
                match kind {
                    DcallKind::Setup => {
                        router.setup(&sr).await;
                        if router.state().0 != DiffState::Synchronizing {
                            break;
                        }
                    }
                    DcallKind::Teardown => {
                        router.teardown(&sr).await;
                        if router.state().0 != DiffState::Stopping {
                            break;
                        }
                    }
                }
            }
        });
        *self.dcall.lock().unwrap() = Some(handle);
    }

    fn cancel_dcall(&self) {
        if let Some(handle) = self.dcall.lock().unwrap().take() {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // summary
    // ------------------------------------------------------------------

    /// Render the accumulated statistics; optionally persist them as dated
    /// files under the data directory.
    pub fn summary(&self, kind: Summary) -> Result<Value> {
        let stats = self.stats.lock().unwrap().clone();
        let output = stats.to_json();

        if kind == Summary::Save || kind == Summary::Both {
            let dir = self
                .config
                .data_dir
                .join("diff")
                .join(&self.config.service);
            std::fs::create_dir_all(&dir)?;
            let timestamp = Local::now().format("%Y-%m-%dT%H-%M-%S");

            let path = dir.join(format!("Summary_{timestamp}.json"));
            std::fs::write(&path, format!("{:#}\n", output))?;

            for (target, data) in stats.data_by_target() {
                let path = dir.join(format!("{target}_{timestamp}.json"));
                std::fs::write(&path, format!("{:#}\n", data))?;
            }
        }

        Ok(output)
    }
}

impl Drop for DiffRouter {
    fn drop(&mut self) {
        if let Some(handle) = self.dcall.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DcallKind {
    Setup,
    Teardown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::repl::{GtidPosByDomain, ReplicationInfo};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicBool;

    struct MockService {
        name: String,
        suspended: AtomicBool,
        rewires: Mutex<Vec<(String, String)>>,
        restarts: Mutex<usize>,
    }

    impl MockService {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(MockService {
                name: name.to_string(),
                suspended: AtomicBool::new(false),
                rewires: Mutex::new(Vec::new()),
                restarts: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ServiceControl for MockService {
        fn name(&self) -> &str {
            &self.name
        }

        fn children(&self) -> Vec<String> {
            vec!["main1".to_string(), "other1".to_string()]
        }

        async fn suspend_sessions(&self) -> SessionResult {
            self.suspended.store(true, Ordering::Relaxed);
            SessionResult {
                total: 3,
                affected: 3,
            }
        }

        async fn resume_sessions(&self) -> SessionResult {
            self.suspended.store(false, Ordering::Relaxed);
            SessionResult {
                total: 3,
                affected: 3,
            }
        }

        async fn restart_sessions(&self) -> SessionResult {
            *self.restarts.lock().unwrap() += 1;
            SessionResult {
                total: 3,
                affected: 3,
            }
        }

        async fn suspended_sessions(&self) -> SessionResult {
            SessionResult {
                total: 3,
                affected: if self.suspended.load(Ordering::Relaxed) {
                    3
                } else {
                    0
                },
            }
        }

        async fn rewire(&self, from: &str, to: &str) -> bool {
            self.rewires
                .lock()
                .unwrap()
                .push((from.to_string(), to.to_string()));
            true
        }
    }

    struct MockRepl {
        gtids: Mutex<StdHashMap<String, GtidPosByDomain>>,
        stopped: Mutex<Vec<String>>,
        started: Mutex<Vec<(String, bool)>>,
    }

    impl MockRepl {
        fn new() -> Arc<Self> {
            Arc::new(MockRepl {
                gtids: Mutex::new(StdHashMap::new()),
                stopped: Mutex::new(Vec::new()),
                started: Mutex::new(Vec::new()),
            })
        }

        fn set_gtid(&self, server: &str, domain: u32, sequence: u64) {
            let mut gtids = self.gtids.lock().unwrap();
            gtids
                .entry(server.to_string())
                .or_default()
                .insert(domain, sequence);
        }
    }

    #[async_trait]
    impl ReplicaControl for MockRepl {
        async fn replication_info(&self, server: &str) -> crate::error::Result<ReplicationInfo> {
            Ok(if server == "other1" {
                ReplicationInfo {
                    master_host: "10.0.0.1".into(),
                    master_port: 3306,
                    slave_io_state: "Waiting for master to send event".into(),
                }
            } else {
                ReplicationInfo::default()
            })
        }

        async fn gtid_position(&self, server: &str) -> crate::error::Result<GtidPosByDomain> {
            Ok(self
                .gtids
                .lock()
                .unwrap()
                .get(server)
                .cloned()
                .unwrap_or_default())
        }

        async fn stop_replication(&self, server: &str) -> crate::error::Result<()> {
            self.stopped.lock().unwrap().push(server.to_string());
            Ok(())
        }

        async fn start_replication(&self, server: &str, reset: bool) -> crate::error::Result<()> {
            self.started.lock().unwrap().push((server.to_string(), reset));
            Ok(())
        }
    }

    fn servers() -> Vec<ServerInfo> {
        vec![
            ServerInfo::new("main1", "10.0.0.1:3306"),
            ServerInfo::new("other1", "10.0.0.2:3306"),
        ]
    }

    fn config(data_dir: &std::path::Path) -> DiffConfig {
        DiffConfig {
            main: "main1".to_string(),
            service: "MyService".to_string(),
            reset_replication: true,
            data_dir: data_dir.to_path_buf(),
            ..Default::default()
        }
    }

    async fn wait_for_state(router: &Arc<DiffRouter>, wanted: DiffState) {
        for _ in 0..100 {
            if router.state().0 == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        panic!("router never reached {wanted:?}, still {:?}", router.state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_replica_to_catch_up() {
        let dir = tempfile::tempdir().unwrap();
        let service = MockService::new("MyService");
        let repl = MockRepl::new();
        repl.set_gtid("main1", 0, 42);
        repl.set_gtid("other1", 0, 41); // one gtid behind

        let router = DiffRouter::new(
            config(dir.path()),
            servers(),
            service.clone(),
            repl.clone(),
        )
        .unwrap();

        let status = router.start().await.unwrap();
        assert_eq!(status["state"], "synchronizing");

        // lagging: the router must stay in STOPPING_REPLICATION
        tokio::time::sleep(Duration::from_secs(3)).await;
        let (state, sync) = router.state();
        assert_eq!(state, DiffState::Synchronizing);
        assert_eq!(sync, SyncState::StoppingReplication);
        assert!(repl.stopped.lock().unwrap().is_empty());

        // the replica catches up; the next probe breaks replication and
        // rewires the service
        repl.set_gtid("other1", 0, 42);
        wait_for_state(&router, DiffState::Comparing).await;

        assert_eq!(repl.stopped.lock().unwrap().as_slice(), &["other1".to_string()]);
        assert_eq!(
            service.rewires.lock().unwrap().as_slice(),
            &[("main1".to_string(), "MyService".to_string())]
        );
        assert!(*service.restarts.lock().unwrap() >= 1);

        // teardown resets replication and rewires back
        let status = router.stop().await.unwrap();
        assert_eq!(status["state"], "prepared");
        assert_eq!(
            repl.started.lock().unwrap().as_slice(),
            &[("other1".to_string(), true)]
        );
        assert_eq!(
            service.rewires.lock().unwrap().last().unwrap(),
            &("MyService".to_string(), "main1".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_only_legal_from_prepared() {
        let dir = tempfile::tempdir().unwrap();
        let repl = MockRepl::new();
        repl.set_gtid("main1", 0, 1);
        repl.set_gtid("other1", 0, 1);
        let router = DiffRouter::new(
            config(dir.path()),
            servers(),
            MockService::new("MyService"),
            repl,
        )
        .unwrap();

        router.start().await.unwrap();
        wait_for_state(&router, DiffState::Comparing).await;
        assert!(router.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_a_synchronization() {
        let dir = tempfile::tempdir().unwrap();
        let service = MockService::new("MyService");
        let repl = MockRepl::new();
        repl.set_gtid("main1", 0, 42);
        repl.set_gtid("other1", 0, 1); // far behind: never catches up

        let router = DiffRouter::new(config(dir.path()), servers(), service.clone(), repl).unwrap();
        router.start().await.unwrap();
        assert_eq!(router.state().0, DiffState::Synchronizing);

        let status = router.stop().await.unwrap();
        assert_eq!(status["state"], "prepared");
        assert!(!service.suspended.load(Ordering::Relaxed));
        // no rewiring happened
        assert!(service.rewires.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summary_writes_dated_files() {
        let dir = tempfile::tempdir().unwrap();
        let repl = MockRepl::new();
        let router = DiffRouter::new(
            config(dir.path()),
            servers(),
            MockService::new("MyService"),
            repl,
        )
        .unwrap();

        let output = router.summary(Summary::Both).unwrap();
        assert!(output["summary"]["main"]["main1"].is_object());

        let service_dir = dir.path().join("diff").join("MyService");
        let names: Vec<String> = std::fs::read_dir(&service_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("Summary_")));
        assert!(names.iter().any(|n| n.starts_with("main1_")));
        assert!(names.iter().any(|n| n.starts_with("other1_")));
    }
}
