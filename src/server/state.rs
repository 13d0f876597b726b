use crate::auth::AuthService;
use crate::config::Config;
use crate::db::Database;
use crate::download::DownloadService;
use crate::error::Result;
use crate::payment::PaymentService;
use crate::userdata::BundleStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Authentication service.
    pub auth: AuthService,
    /// Per-user bundle store.
    pub bundles: BundleStore,
    /// Download orchestrator.
    pub downloads: DownloadService,
    /// Payment orchestrator.
    pub payments: PaymentService,
}

impl AppState {
    /// Wire up every service from the loaded config. Services receive their
    /// dependencies here instead of reaching for globals.
    pub fn new(config: Config, db: Database) -> Result<Self> {
        let auth = AuthService::new(db.clone(), config.auth.clone());
        let bundles = BundleStore::new(config.userdata.dir.clone(), config.storage.clone())?;
        let downloads = DownloadService::new(config.storage.clone(), db.clone(), bundles.clone())?;
        let payments = PaymentService::new(db.clone(), config.payment.clone())?;

        Ok(Self {
            config: Arc::new(config),
            db,
            auth,
            bundles,
            downloads,
            payments,
        })
    }
}
