use crate::state::ConnectionState;

/// Observer of client state changes.
///
/// Called synchronously on the task that caused the change; keep it short.
pub trait StateListener: Send + Sync + 'static {
    /// The client moved from `from` to `to`.
    fn on_state_change(&self, from: ConnectionState, to: ConnectionState);
}

impl<F> StateListener for F
where
    F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
{
    fn on_state_change(&self, from: ConnectionState, to: ConnectionState) {
        self(from, to)
    }
}

/// Logs every transition at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStateListener;

impl StateListener for LoggingStateListener {
    fn on_state_change(&self, from: ConnectionState, to: ConnectionState) {
        tracing::info!("client state {:?} -> {:?}", from, to);
    }
}
