use crate::protocol::mysql::constants::MariaDbCapabilities;
use crate::session::ClientSession;

use mysql_common::constants::CapabilityFlags;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseType {
    NotPossible,
    ResetConnection,
    ChangeUser,
}

/// What a pooled connection remembers about the session that released it.
#[derive(Debug, Clone)]
pub struct PooledSnapshot {
    capabilities: CapabilityFlags,
    extra_capabilities: MariaDbCapabilities,
    account: String,
    db: String,
    client_addr: Option<SocketAddr>,
}

fn relevant_caps() -> CapabilityFlags {
    // The bits that change how the protocol itself works; anything else can
    // be reset away.
    CapabilityFlags::CLIENT_DEPRECATE_EOF
        | CapabilityFlags::CLIENT_MULTI_RESULTS
        | CapabilityFlags::CLIENT_MULTI_STATEMENTS
        | CapabilityFlags::CLIENT_SESSION_TRACK
        | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
}

impl PooledSnapshot {
    pub fn take(
        capabilities: CapabilityFlags,
        extra_capabilities: MariaDbCapabilities,
        session: &ClientSession,
    ) -> Self {
        PooledSnapshot {
            capabilities,
            extra_capabilities,
            account: session.user_and_host(),
            db: session.db.clone(),
            client_addr: session.client_addr,
        }
    }

    pub fn classify(&self, session: &ClientSession, proxy_protocol: bool) -> ReuseType {
        let relevant = relevant_caps();
        let caps_ok = (self.capabilities & relevant) == (session.capabilities & relevant)
            && self.extra_capabilities == session.extra_capabilities;

        // With the PROXY protocol the server sees the client's address, so a
        // connection must never be shared across client hosts.
        let remote_ok = !proxy_protocol
            || match (self.client_addr, session.client_addr) {
                (Some(a), Some(b)) => a.ip() == b.ip(),
                (None, None) => true,
                _ => false,
            };

        if !caps_ok || !remote_ok {
            ReuseType::NotPossible
        } else if self.account == session.user_and_host() && self.db == session.db {
            ReuseType::ResetConnection
        } else {
            ReuseType::ChangeUser
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user: &str, db: &str) -> ClientSession {
        let mut s = ClientSession::new(1, user, "10.0.0.9");
        s.db = db.to_string();
        s.capabilities |= CapabilityFlags::CLIENT_DEPRECATE_EOF;
        s
    }

    fn snapshot_of(s: &ClientSession) -> PooledSnapshot {
        PooledSnapshot::take(s.capabilities, s.extra_capabilities, s)
    }

    #[test]
    fn test_same_user_same_db_is_reset() {
        let old = session("app", "orders");
        let snapshot = snapshot_of(&old);
        let new = session("app", "orders");
        assert_eq!(snapshot.classify(&new, false), ReuseType::ResetConnection);
    }

    #[test]
    fn test_different_user_is_change_user() {
        let old = session("app", "orders");
        let snapshot = snapshot_of(&old);
        let new = session("reporting", "orders");
        assert_eq!(snapshot.classify(&new, false), ReuseType::ChangeUser);
    }

    #[test]
    fn test_different_db_is_change_user() {
        let old = session("app", "orders");
        let snapshot = snapshot_of(&old);
        let new = session("app", "billing");
        assert_eq!(snapshot.classify(&new, false), ReuseType::ChangeUser);
    }

    #[test]
    fn test_capability_difference_is_not_possible() {
        let old = session("app", "orders");
        let snapshot = snapshot_of(&old);
        let mut new = session("app", "orders");
        new.capabilities.remove(CapabilityFlags::CLIENT_DEPRECATE_EOF);
        assert_eq!(snapshot.classify(&new, false), ReuseType::NotPossible);
    }

    #[test]
    fn test_extra_capability_difference_is_not_possible() {
        let old = session("app", "orders");
        let snapshot = snapshot_of(&old);
        let mut new = session("app", "orders");
        new.extra_capabilities = MariaDbCapabilities::MARIADB_CLIENT_CACHE_METADATA;
        assert_eq!(snapshot.classify(&new, false), ReuseType::NotPossible);
    }

    #[test]
    fn test_proxy_protocol_requires_same_client_ip() {
        let mut old = session("app", "orders");
        old.client_addr = Some("10.1.1.1:5000".parse().unwrap());
        let snapshot = snapshot_of(&old);

        let mut new = session("app", "orders");
        new.client_addr = Some("10.1.1.2:5000".parse().unwrap());
        assert_eq!(snapshot.classify(&new, true), ReuseType::NotPossible);
        // without the proxy protocol the remote address is irrelevant
        assert_eq!(snapshot.classify(&new, false), ReuseType::ResetConnection);

        new.client_addr = Some("10.1.1.1:6000".parse().unwrap());
        assert_eq!(snapshot.classify(&new, true), ReuseType::ResetConnection);
    }
}
