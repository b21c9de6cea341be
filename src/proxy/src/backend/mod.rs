pub mod conn;
pub mod connect;
pub mod pool;

use crate::protocol::mysql::constants::{CommandCode, MAX_PAYLOAD_LEN, PS_ID_OFFSET, PS_ID_SIZE};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Static description of one backend server plus its shared runtime flags.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub name: String,
    pub address: String,
    pub proxy_protocol: bool,
    pub persistent_conns: bool,
    pub ssl: bool,
    /// Queries executed on every fresh or reset connection before any
    /// client traffic.
    pub init_queries: Vec<String>,
    maintenance: Arc<AtomicBool>,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        ServerInfo {
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn set_maintenance(&self) {
        self.maintenance.store(true, Ordering::Relaxed);
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Relaxed)
    }
}

/// Hook into the user-account cache; the cache itself lives outside this
/// crate.
pub trait UserAccountCache: Send + Sync {
    fn can_update_immediately(&self) -> bool;
    fn request_update(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Handshaking,
    Authenticating,
    ConnectionInit,
    SendHistory,
    ReadHistory,
    SendDelayq,
    Routing,
    PreparePs,
    SendChangeUser,
    ReadChangeUser,
    Pinging,
    ResetConnection,
    ResetConnectionFast,
    Pooled,
    Failed,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Handshaking => "Handshaking",
            BackendState::Authenticating => "Authenticating",
            BackendState::ConnectionInit => "Sending connection initialization queries",
            BackendState::SendHistory => "Sending session command history",
            BackendState::ReadHistory => "Reading session command history responses",
            BackendState::SendDelayq => "Sending delayed queries",
            BackendState::Routing => "Routing",
            BackendState::PreparePs => "Preparing a statement",
            BackendState::SendChangeUser => "Waiting to send COM_CHANGE_USER",
            BackendState::ReadChangeUser => "Reading COM_CHANGE_USER response",
            BackendState::Pinging => "Pinging",
            BackendState::ResetConnection => "Resetting connection",
            BackendState::ResetConnectionFast => "Resetting connection (fast path)",
            BackendState::Pooled => "Pooled",
            BackendState::Failed => "Failed",
        }
    }
}

/// Bookkeeping for one request written to the backend, matched against the
/// reply the tracker eventually completes.
#[derive(Debug, Clone)]
pub struct TrackedQuery {
    pub payload_len: usize,
    pub command: u8,
    pub collect_rows: bool,
    pub id: u64,
    pub opening_cursor: bool,
}

impl TrackedQuery {
    pub fn new(payload: &[u8], id: u64, collect_rows: bool) -> Self {
        let command = payload.first().copied().unwrap_or(0);
        let mut opening_cursor = false;
        if command == CommandCode::ComStmtExecute as u8 {
            // Any non-zero flag byte after the statement id opens a cursor.
            if let Some(&flags) = payload.get(PS_ID_OFFSET + PS_ID_SIZE) {
                opening_cursor = flags != 0;
            }
        }
        TrackedQuery {
            payload_len: payload.len(),
            command,
            collect_rows,
            id,
            opening_cursor,
        }
    }

    pub fn is_large(&self) -> bool {
        self.payload_len >= MAX_PAYLOAD_LEN
    }
}

/// Per-backend prepared statement bookkeeping. The client only ever sees
/// the external id; this maps it to what this particular server assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsInfo {
    pub real_id: u32,
    pub n_params: u16,
    pub exec_metadata_sent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_query_cursor_detection() {
        let mut payload = vec![CommandCode::ComStmtExecute as u8];
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.push(0x01); // CURSOR_TYPE_READ_ONLY
        payload.extend_from_slice(&1u32.to_le_bytes());
        let q = TrackedQuery::new(&payload, 1, false);
        assert!(q.opening_cursor);

        payload[5] = 0;
        let q = TrackedQuery::new(&payload, 2, false);
        assert!(!q.opening_cursor);
    }

    #[test]
    fn test_maintenance_flag_is_shared() {
        let server = ServerInfo::new("db1", "127.0.0.1:3306");
        let clone = server.clone();
        clone.set_maintenance();
        assert!(server.in_maintenance());
    }
}
