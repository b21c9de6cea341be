use crate::history::History;
use crate::protocol::mysql::constants::MariaDbCapabilities;

use hashbrown::HashMap;
use mysql_common::constants::CapabilityFlags;
use std::net::SocketAddr;

/// Client-visible state of one proxied session. Everything a backend needs
/// to impersonate the client lives here: identity, schema, negotiated
/// capabilities, tracked server variables, the prepared-statement metadata
/// and the session-command history.
pub struct ClientSession {
    pub id: u64,
    pub user: String,
    pub host: String,
    /// SHA1 of the account password, used to answer backend scrambles.
    pub backend_token: Vec<u8>,
    pub db: String,
    pub capabilities: CapabilityFlags,
    pub extra_capabilities: MariaDbCapabilities,
    pub collation: u8,
    /// Raw length-encoded connect-attributes blob, relayed verbatim.
    pub attributes: Option<Vec<u8>>,
    pub client_addr: Option<SocketAddr>,
    /// Per-statement server variable snapshot maintained from session
    /// trackers (autocommit, sql_mode, trx_characteristics, last_gtid).
    pub variables: HashMap<String, String>,
    /// External statement id -> parameter types blob from the last typed
    /// COM_STMT_EXECUTE, for metadata splicing on later executes.
    pub exec_metadata: HashMap<u32, Vec<u8>>,
    /// External statement id -> parameter count, learned from the main's
    /// COM_STMT_PREPARE response.
    pub ps_params: HashMap<u32, u16>,
    pub history: History,
    next_query_id: u64,
}

impl ClientSession {
    pub fn new(id: u64, user: impl Into<String>, host: impl Into<String>) -> Self {
        ClientSession {
            id,
            user: user.into(),
            host: host.into(),
            backend_token: Vec::new(),
            db: String::new(),
            capabilities: CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION,
            extra_capabilities: MariaDbCapabilities::empty(),
            collation: 45,
            attributes: None,
            client_addr: None,
            variables: HashMap::new(),
            exec_metadata: HashMap::new(),
            ps_params: HashMap::new(),
            history: History::new(),
            next_query_id: 1,
        }
    }

    pub fn user_and_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Session-global id for the next request; doubles as the external
    /// prepared-statement id for COM_STMT_PREPARE requests.
    pub fn next_query_id(&mut self) -> u64 {
        let id = self.next_query_id;
        self.next_query_id += 1;
        id
    }

    pub fn track_variables(&mut self, variables: &[(String, String)], schema: &Option<String>) {
        for (name, value) in variables {
            self.variables.insert(name.clone(), value.clone());
        }
        if let Some(schema) = schema {
            self.db = schema.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_ids_are_sequential() {
        let mut session = ClientSession::new(1, "app", "10.0.0.9");
        assert_eq!(session.next_query_id(), 1);
        assert_eq!(session.next_query_id(), 2);
    }

    #[test]
    fn test_variable_tracking_updates_schema() {
        let mut session = ClientSession::new(1, "app", "10.0.0.9");
        session.track_variables(
            &[("autocommit".to_string(), "OFF".to_string())],
            &Some("orders".to_string()),
        );
        assert_eq!(session.variables.get("autocommit").unwrap(), "OFF");
        assert_eq!(session.db, "orders");
    }

    #[test]
    fn test_user_and_host() {
        let session = ClientSession::new(1, "app", "10.0.0.9");
        assert_eq!(session.user_and_host(), "app@10.0.0.9");
    }
}
