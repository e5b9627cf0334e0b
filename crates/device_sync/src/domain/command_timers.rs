use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancellation tokens of the running command timeout tasks, keyed by command id
#[derive(Clone, Default)]
pub struct CommandTimers {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CommandTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer for `command_id`, cancelling any previous one
    pub async fn arm(&self, command_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tokens = self.tokens.lock().await;
        if let Some(previous) = tokens.insert(command_id.to_string(), token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel and forget the timer; returns false when none was running
    pub async fn cancel(&self, command_id: &str) -> bool {
        match self.tokens.lock().await.remove(command_id) {
            Some(token) => {
                token.cancel();
                debug!(command_id = %command_id, "command timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Forget a timer that finished on its own
    pub async fn disarm(&self, command_id: &str) {
        self.tokens.lock().await.remove(command_id);
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.lock().await.is_empty()
    }
}
