use crate::backend::conn::{BackendConnection, BackendOptions, RouteResult};
use crate::backend::ServerInfo;
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::packet::writers::build_com_query;
use crate::protocol::mysql::reply::Reply;
use crate::session::ClientSession;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::net::TcpStream;
use tracing::{error, info};

/// Subset of SHOW SLAVE STATUS the lifecycle coordinator cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationInfo {
    pub master_host: String,
    pub master_port: u16,
    pub slave_io_state: String,
}

impl ReplicationInfo {
    pub fn is_configured(&self) -> bool {
        !self.master_host.is_empty()
    }

    pub fn is_currently_replicating(&self) -> bool {
        !self.slave_io_state.is_empty()
    }

    pub fn will_replicate_from(&self, address: &str) -> bool {
        match address.rsplit_once(':') {
            Some((host, port)) => {
                self.master_host == host && port.parse() == Ok(self.master_port)
            }
            None => self.master_host == address,
        }
    }

    pub fn has_same_master(&self, other: &ReplicationInfo) -> bool {
        self.is_configured()
            && self.master_host == other.master_host
            && self.master_port == other.master_port
    }
}

/// GTID position per replication domain.
pub type GtidPosByDomain = HashMap<u32, u64>;

/// Parse a gtid_current_pos list: comma-separated domain-server-sequence
/// triplets.
pub fn parse_gtid_list(value: &str) -> GtidPosByDomain {
    let mut positions = GtidPosByDomain::new();
    for triplet in value.split(',') {
        let mut parts = triplet.trim().split('-');
        let domain = parts.next().and_then(|p| p.parse().ok());
        let _server = parts.next();
        let sequence = parts.next().and_then(|p| p.parse().ok());
        if let (Some(domain), Some(sequence)) = (domain, sequence) {
            positions.insert(domain, sequence);
        }
    }
    positions
}

/// Administrative replication control, one operation per call. The real
/// implementation opens short-lived connections with the service
/// credentials; tests substitute a scripted one.
#[async_trait]
pub trait ReplicaControl: Send + Sync {
    async fn replication_info(&self, server: &str) -> Result<ReplicationInfo>;
    async fn gtid_position(&self, server: &str) -> Result<GtidPosByDomain>;
    async fn stop_replication(&self, server: &str) -> Result<()>;
    async fn start_replication(&self, server: &str, reset: bool) -> Result<()>;
}

/// Relationship between the main server and one comparison target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    OtherReplicatesFromMain,
    BothReplicateFromThird,
    MainReplicatesFromOther,
    NoRelation,
    Error,
}

/// Classify how `other` relates to `main`; only the first two outcomes
/// allow a comparison to start.
pub async fn get_replication_status(
    repl: &dyn ReplicaControl,
    main_name: &str,
    main_address: &str,
    other_name: &str,
    other_address: &str,
) -> ReplicationStatus {
    let ri_other = match repl.replication_info(other_name).await {
        Ok(info) => info,
        Err(e) => {
            error!("could not get replication info of '{other_name}': {e}");
            return ReplicationStatus::Error;
        }
    };

    if ri_other.will_replicate_from(main_address) {
        if ri_other.is_currently_replicating() {
            info!("other '{other_name}' replicates from main '{main_name}', a read-write setup");
            return ReplicationStatus::OtherReplicatesFromMain;
        }
        error!(
            "other '{other_name}' is configured to replicate from main '{main_name}' \
             but is currently not replicating"
        );
        return ReplicationStatus::Error;
    }

    let ri_main = match repl.replication_info(main_name).await {
        Ok(info) => info,
        Err(e) => {
            error!("could not get replication info of '{main_name}': {e}");
            return ReplicationStatus::Error;
        }
    };

    if ri_main.will_replicate_from(other_address) {
        error!("main '{main_name}' is configured to replicate from other '{other_name}'");
        return ReplicationStatus::MainReplicatesFromOther;
    }

    if ri_main.has_same_master(&ri_other) {
        if ri_main.is_currently_replicating() == ri_other.is_currently_replicating() {
            info!(
                "main '{main_name}' and other '{other_name}' replicate from {}:{}, \
                 a read-only setup",
                ri_other.master_host, ri_other.master_port
            );
            return ReplicationStatus::BothReplicateFromThird;
        }
        error!(
            "main '{main_name}' and other '{other_name}' replicate from the same server, \
             but one of them is replicating and the other one is not"
        );
        return ReplicationStatus::Error;
    }

    error!("no relation between main '{main_name}' and other '{other_name}'");
    ReplicationStatus::NoRelation
}

// SHOW SLAVE STATUS columns, by position. The admin connection collects
// rows without field names, so the classic column order is relied upon.
const SLAVE_IO_STATE_COLUMN: usize = 0;
const MASTER_HOST_COLUMN: usize = 1;
const MASTER_PORT_COLUMN: usize = 3;

/// Short-lived administrative connection speaking this crate's own
/// protocol stack.
pub struct AdminConn {
    conn: BackendConnection<TcpStream>,
    session: ClientSession,
}

impl AdminConn {
    pub async fn open(server: &ServerInfo, user: &str, password: &str) -> Result<Self> {
        let stream = TcpStream::connect(&server.address).await?;
        let mut conn = BackendConnection::new(
            server.clone(),
            BackendOptions::default(),
            stream,
            password.as_bytes().to_vec(),
        );
        let mut session = ClientSession::new(0, user, "admin");
        conn.login(&mut session).await?;
        Ok(AdminConn { conn, session })
    }

    /// Run one statement and return its completed reply with the rows
    /// collected as strings.
    pub async fn query(&mut self, sql: &str) -> Result<Reply> {
        let payload = build_com_query(sql);
        let route = self
            .conn
            .route_client_packet(&mut self.session, payload, 0, true)
            .await?;
        if route != RouteResult::Forwarded {
            return Err(ProxyError::Protocol(format!(
                "administrative statement was not routed: {sql}"
            )));
        }
        loop {
            let event = self.conn.read_response(&mut self.session).await?;
            if event.complete {
                return Ok(event.reply);
            }
        }
    }

    /// Run a statement that must succeed with an OK.
    pub async fn cmd(&mut self, sql: &str) -> Result<()> {
        let reply = self.query(sql).await?;
        if reply.is_ok {
            Ok(())
        } else {
            let message = reply
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unexpected response".into());
            Err(ProxyError::Lifecycle(format!("'{sql}' failed: {message}")))
        }
    }
}

/// `ReplicaControl` over real servers, opening one admin connection per
/// operation with the service credentials.
pub struct AdminReplicaControl {
    servers: HashMap<String, ServerInfo>,
    user: String,
    password: String,
}

impl AdminReplicaControl {
    pub fn new(servers: Vec<ServerInfo>, user: impl Into<String>, password: impl Into<String>) -> Self {
        AdminReplicaControl {
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
            user: user.into(),
            password: password.into(),
        }
    }

    async fn connect(&self, server: &str) -> Result<AdminConn> {
        let info = self.servers.get(server).ok_or_else(|| {
            ProxyError::Lifecycle(format!("unknown server '{server}'"))
        })?;
        AdminConn::open(info, &self.user, &self.password).await
    }
}

#[async_trait]
impl ReplicaControl for AdminReplicaControl {
    async fn replication_info(&self, server: &str) -> Result<ReplicationInfo> {
        let mut conn = self.connect(server).await?;
        let reply = conn.query("SHOW SLAVE STATUS").await?;

        let mut info = ReplicationInfo::default();
        if let Some(row) = reply.row_data.first() {
            info.slave_io_state = row.get(SLAVE_IO_STATE_COLUMN).cloned().unwrap_or_default();
            info.master_host = row.get(MASTER_HOST_COLUMN).cloned().unwrap_or_default();
            info.master_port = row
                .get(MASTER_PORT_COLUMN)
                .and_then(|p| p.parse().ok())
                .unwrap_or_default();
        }
        Ok(info)
    }

    async fn gtid_position(&self, server: &str) -> Result<GtidPosByDomain> {
        let mut conn = self.connect(server).await?;
        let reply = conn.query("SELECT @@gtid_current_pos").await?;
        let value = reply
            .row_data
            .first()
            .and_then(|row| row.first())
            .cloned()
            .unwrap_or_default();
        Ok(parse_gtid_list(&value))
    }

    async fn stop_replication(&self, server: &str) -> Result<()> {
        let mut conn = self.connect(server).await?;
        conn.cmd("STOP ALL SLAVES").await
    }

    async fn start_replication(&self, server: &str, reset: bool) -> Result<()> {
        let mut conn = self.connect(server).await?;
        if reset {
            conn.cmd("RESET SLAVE").await?;
        }
        conn.cmd("START SLAVE").await
    }
}
