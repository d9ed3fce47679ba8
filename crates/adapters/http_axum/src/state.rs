//! Shared application state for axum handlers.

use std::sync::Arc;

use sporekeeper_app::ports::{CommandLog, ConnectivityLog, Journal};
use sporekeeper_app::services::diagnostics::DiagnosticsService;

/// Application state shared across all axum handlers.
///
/// Generic over the journal, connectivity log and command log to avoid
/// dynamic dispatch. `Clone` is implemented manually so the underlying types
/// themselves do not need to be `Clone`.
pub struct AppState<J, L, C> {
    pub diagnostics: Arc<DiagnosticsService<J, L, C>>,
}

impl<J, L, C> Clone for AppState<J, L, C> {
    fn clone(&self) -> Self {
        Self {
            diagnostics: Arc::clone(&self.diagnostics),
        }
    }
}

impl<J, L, C> AppState<J, L, C>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    pub fn new(diagnostics: DiagnosticsService<J, L, C>) -> Self {
        Self {
            diagnostics: Arc::new(diagnostics),
        }
    }

    /// Use this when the service is shared with background tasks.
    pub fn from_arc(diagnostics: Arc<DiagnosticsService<J, L, C>>) -> Self {
        Self { diagnostics }
    }
}
