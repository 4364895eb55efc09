use crate::device::Device;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub device: Arc<Device>,
}

impl AppState {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}
