use std::sync::Arc;
use tokio_rusqlite::Connection;

use crate::adapters::probe_backup_destination;
use crate::config::AppConfig;
use crate::core::{
    BatchMode, BatchOptions, ProgressTracker, RepartitionRequest, SizingParameters, UpgradeOptions,
};

/// Shared application state handed to whoever starts a batch.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub progress: ProgressTracker,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Self {
        Self {
            config: Arc::new(config),
            db,
            progress: ProgressTracker::new(),
        }
    }

    /// Sizing for a batch. Only installs carry an exchange partition request.
    pub fn sizing(&self, mode: BatchMode, system_size: u64) -> SizingParameters {
        SizingParameters {
            system_size,
            efi_size: self.config.efi_partition_size,
            exchange_size: match mode {
                BatchMode::Install => self.config.exchange_partition_size,
                BatchMode::Upgrade | BatchMode::Reset => None,
            },
            upgrade_margin_percent: self.config.upgrade_margin_percent,
            min_persistence_size: self.config.min_persistence_size,
        }
    }

    /// Build the explicit options for one batch, probing the backup
    /// destination if one is configured.
    pub fn batch_options(
        &self,
        mode: BatchMode,
        system_size: u64,
        repartition: RepartitionRequest,
    ) -> BatchOptions {
        BatchOptions {
            mode,
            sizing: self.sizing(mode, system_size),
            upgrade: UpgradeOptions {
                repartition,
                auto_backup: self.config.auto_backup,
                backup_destination: self
                    .config
                    .backup_destination
                    .as_deref()
                    .map(probe_backup_destination),
            },
            numbering: self.config.numbering.clone(),
        }
    }
}
