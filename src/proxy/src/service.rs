use async_trait::async_trait;

/// Outcome of a bulk session operation: how many sessions the service has
/// and how many the operation affected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionResult {
    pub total: usize,
    pub affected: usize,
}

impl SessionResult {
    pub fn all_affected(&self) -> bool {
        self.total == self.affected
    }
}

/// Control surface of the service this router is installed into. The real
/// implementation lives with the service runtime; the lifecycle coordinator
/// only needs these operations.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    fn name(&self) -> &str;

    /// Names of the service's current child targets.
    fn children(&self) -> Vec<String>;

    async fn suspend_sessions(&self) -> SessionResult;
    async fn resume_sessions(&self) -> SessionResult;
    /// Tear down and re-establish every suspended session so it attaches to
    /// the current topology.
    async fn restart_sessions(&self) -> SessionResult;
    async fn suspended_sessions(&self) -> SessionResult;

    /// Replace `from` with `to` in the service's child target set.
    async fn rewire(&self, from: &str, to: &str) -> bool;
}
