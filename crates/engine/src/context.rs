use tokio_util::sync::CancellationToken;

/// Cancellation scope handed to every engine operation, store call and action
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    token: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. one shared with a signal handler
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A context cancelled together with this one, but which can also be cancelled on its own
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = ExecutionContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_leaves_parent_running() {
        let parent = ExecutionContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
