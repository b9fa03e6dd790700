//! Shared handler state.

use std::sync::Arc;

use livecap_core::PipelineSupervisor;

/// Injected into every handler via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<PipelineSupervisor>,
}
