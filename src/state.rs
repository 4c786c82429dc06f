//! Application state management

use std::sync::Arc;

use crate::sync::{RecordStore, StrategyInfo, SyncEngine};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: SyncEngine<dyn RecordStore>,
}

impl AppState {
    pub fn new(engine: SyncEngine<dyn RecordStore>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { engine }),
        }
    }

    /// Get the sync engine
    pub fn engine(&self) -> &SyncEngine<dyn RecordStore> {
        &self.inner.engine
    }

    pub fn strategy(&self) -> StrategyInfo {
        self.inner.engine.strategy()
    }
}
