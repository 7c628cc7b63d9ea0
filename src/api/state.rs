//! Application state for the API server

use crate::config::Config;
use crate::db::Database;
use crate::fetch::NzbFetcher;
use crate::pool::Pool;
use std::sync::Arc;

/// Shared state handed to every route handler
///
/// Cloned per request; everything inside is reference-counted.
#[derive(Clone)]
pub struct AppState {
    /// Segment access point
    pub pool: Pool,
    /// NZB record store
    pub db: Database,
    /// NZB blob fetcher/cache
    pub fetcher: Arc<NzbFetcher>,
    /// Configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Bundle the service dependencies
    pub fn new(pool: Pool, db: Database, fetcher: Arc<NzbFetcher>, config: Arc<Config>) -> Self {
        Self {
            pool,
            db,
            fetcher,
            config,
        }
    }
}
