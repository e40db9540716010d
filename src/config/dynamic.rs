//! Dynamic Configuration Management
//!
//! Provides runtime configuration reloading with change notification

use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::info;

use super::loader::ConfigLoader;
use super::types::AppConfig;
use crate::error::Error;

/// Dynamic configuration manager
pub struct DynamicConfigManager {
    /// Current configuration
    current_config: RwLock<Arc<AppConfig>>,
    /// Configuration file path
    config_path: Option<String>,
    /// Configuration change notifier (carries the version counter)
    change_sender: watch::Sender<u64>,
}

impl DynamicConfigManager {
    /// Create a new dynamic configuration manager
    pub fn new(initial_config: AppConfig, config_path: Option<String>) -> Self {
        let (sender, _) = watch::channel(0);

        Self {
            current_config: RwLock::new(Arc::new(initial_config)),
            config_path,
            change_sender: sender,
        }
    }

    /// Get current configuration snapshot
    pub fn get_config(&self) -> Arc<AppConfig> {
        match self.current_config.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.change_sender.subscribe()
    }

    /// Current configuration version
    pub fn version(&self) -> u64 {
        *self.change_sender.borrow()
    }

    pub fn config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }

    /// Reload configuration from the current file (and environment)
    pub fn reload(&self) -> Result<u64, Error> {
        info!(
            "Reloading configuration from: {}",
            self.config_path.as_deref().unwrap_or("<default locations>")
        );

        let new_config = ConfigLoader::new()
            .load_from_file(self.config_path.as_deref())
            .load_from_env()
            .build()
            .map_err(|e| Error::Config(format!("{:#}", e)))?;

        Ok(self.update_config(new_config))
    }

    /// Replace configuration directly
    pub fn update_config(&self, new_config: AppConfig) -> u64 {
        {
            let mut config = match self.current_config.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *config = Arc::new(new_config);
        }

        self.notify_config_change()
    }

    fn notify_config_change(&self) -> u64 {
        let mut new_version = 0;
        self.change_sender.send_modify(|version| {
            *version += 1;
            new_version = *version;
        });

        info!(
            "Configuration updated to version {} ({} subscribers)",
            new_version,
            self.change_sender.receiver_count()
        );
        new_version
    }
}
