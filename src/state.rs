//! Shared state handed to every handler.

use crate::services::{cache_service::CacheService, gc_service::GcScheduler};

#[derive(Clone)]
pub struct AppState {
    pub cache: CacheService,
    pub gc: GcScheduler,
}

impl AppState {
    pub fn new(cache: CacheService, gc: GcScheduler) -> Self {
        Self { cache, gc }
    }
}
