use std::sync::{Arc, RwLock};

use super::messages::Response;

type Handler = Arc<dyn Fn(&Response) + Send + Sync>;

/// Registry of response handlers
///
/// Cloning shares the registry, so handlers registered once survive every
/// reconnect of the command channel.
#[derive(Clone, Default)]
pub struct ResponseRouter {
    handlers: Arc<RwLock<Vec<Handler>>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_response<F>(&self, handler: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));
    }

    /// Invoke every handler once; returns how many ran
    pub fn dispatch(&self, response: &Response) -> usize {
        // Snapshot so a handler may register further handlers
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for handler in &handlers {
            handler(response);
        }
        handlers.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl std::fmt::Debug for ResponseRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRouter")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
