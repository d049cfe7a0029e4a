//! `gateway-core`: the DICOM routing/compliance gateway's subsystems
//! (spec.md §1) as a library, with the wire-level receiver/forwarder, the
//! anonymization engine, OCR, HTTP surface, authentication, and config-file
//! loading all referenced by interface only and left to an outer layer.
//!
//! `gatewayctl` (`src/bin/gatewayctl.rs`) exercises this API end to end in
//! place of that outer HTTP layer.

pub mod archive;
pub mod comparison;
pub mod config;
pub mod indexer;
pub mod metrics;
pub mod model;
pub mod reaper;
pub mod review;
pub mod store;
pub mod tracker;

pub use archive::Archive;
pub use comparison::ComparisonEngine;
pub use config::GatewayConfig;
pub use indexer::Indexer;
pub use metrics::MetricsAggregator;
pub use reaper::StorageReaper;
pub use review::ReviewCoordinator;
pub use store::Store;
pub use tracker::TransferTracker;

use std::sync::Arc;

/// Wires the five core subsystems plus StorageReaper against one `Store`
/// and one `GatewayConfig`, the way `gatewayctl` and any future HTTP layer
/// would construct them (spec.md §1's component list).
pub struct Gateway {
    pub config: GatewayConfig,
    pub store: Arc<Store>,
    pub metrics: Arc<MetricsAggregator>,
    pub tracker: Arc<TransferTracker>,
    pub review: Arc<ReviewCoordinator>,
    pub indexer: Arc<Indexer>,
    pub comparison: Arc<ComparisonEngine>,
    pub reaper: Arc<StorageReaper>,
}

impl Gateway {
    pub async fn new(config: GatewayConfig) -> Result<Self, store::StoreError> {
        let store = Arc::new(Store::open(&config.database_path).await?);
        let metrics = Arc::new(MetricsAggregator::new(store.clone()).await);
        let tracker = Arc::new(TransferTracker::new(config.clone(), Some(metrics.clone())));
        let review = Arc::new(ReviewCoordinator::new(config.clone(), None));
        let indexer = Arc::new(Indexer::new(config.clone(), store.clone()));
        let comparison = Arc::new(ComparisonEngine::new(config.clone(), None));
        let reaper = Arc::new(StorageReaper::new(config.clone()));

        Ok(Self {
            config,
            store,
            metrics,
            tracker,
            review,
            indexer,
            comparison,
            reaper,
        })
    }

    /// Spawns the supervised background tasks (metrics rollup, storage
    /// reaper) and returns a handle for triggering an immediate reaper
    /// sweep outside its daily cadence.
    pub fn spawn_background_tasks(&self) -> reaper::Handle {
        self.metrics.clone().spawn();
        let (_, handle) = self.reaper.clone().spawn();
        handle
    }
}
