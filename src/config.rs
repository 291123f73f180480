//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, the TOML config file,
//! `LIVECOPY_*` environment variables, command-line arguments.

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::classifier::DEFAULT_MIN_PERSISTENCE_SIZE;
use crate::core::numbering::AutoNumbering;

const DEFAULT_CONFIG_FILE: &str = "livecopy.toml";
const CONFIG_ENV: &str = "LIVECOPY_CONFIG";
const ENV_PREFIX: &str = "LIVECOPY_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Size of the EFI partition created or required on targets.
    pub efi_partition_size: u64,
    /// Safety headroom on the system size for upgrade comparisons.
    pub upgrade_margin_percent: u32,
    /// Smallest surplus that is turned into a persistence partition.
    pub min_persistence_size: u64,
    /// Default exchange partition size for interactive installs.
    pub exchange_partition_size: Option<u64>,
    pub auto_backup: bool,
    pub backup_destination: Option<PathBuf>,
    pub numbering: AutoNumbering,
    /// Where the batch history database lives.
    pub data_dir: PathBuf,
    /// Delay between simulated execution phases, in milliseconds.
    pub step_delay_ms: u64,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            efi_partition_size: 256 * 1024 * 1024,
            upgrade_margin_percent: 10,
            min_persistence_size: DEFAULT_MIN_PERSISTENCE_SIZE,
            exchange_partition_size: None,
            auto_backup: false,
            backup_destination: None,
            numbering: AutoNumbering::default(),
            data_dir: PathBuf::from("."),
            step_delay_ms: 500,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load the configuration, letting `cli_args` override every other layer.
    /// Unset CLI options must be skipped during serialization.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        let config_file = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", config_file.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.efi_partition_size == 0 {
            bail!("efi_partition_size must be greater than zero");
        }
        if self.upgrade_margin_percent > 100 {
            bail!(
                "upgrade_margin_percent must be at most 100, got {}",
                self.upgrade_margin_percent
            );
        }
        if self.numbering.enabled && self.numbering.increment == 0 {
            bail!("numbering.increment must be greater than zero");
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("livecopy.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Args {
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_backup: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upgrade_margin_percent: Option<u32>,
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.database_path(), PathBuf::from("./livecopy.db"));
    }

    #[test]
    fn test_layers_override_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "livecopy.toml",
                r#"
                    upgrade_margin_percent = 20
                    efi_partition_size = 1000

                    [numbering]
                    enabled = true
                    start = 7
                "#,
            )?;
            jail.set_env("LIVECOPY_EFI_PARTITION_SIZE", "2000");

            let args = Args {
                auto_backup: Some(true),
                upgrade_margin_percent: None,
            };
            let config = AppConfig::new(Some(&args)).map_err(|e| e.to_string())?;

            assert_eq!(config.upgrade_margin_percent, 20);
            assert_eq!(config.efi_partition_size, 2000);
            assert!(config.auto_backup);
            assert!(config.numbering.enabled);
            assert_eq!(config.numbering.start, 7);
            assert_eq!(config.numbering.increment, 1);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_margin_is_rejected() {
        Jail::expect_with(|_jail| {
            let args = Args {
                auto_backup: None,
                upgrade_margin_percent: Some(150),
            };
            let err = AppConfig::new(Some(&args)).unwrap_err();
            assert!(err.to_string().contains("upgrade_margin_percent"));
            Ok(())
        });
    }
}
