//! Driver configuration management

use crate::driver::{
    DEFAULT_BUFFER_SIZE, DEFAULT_INITIAL_DELAY, DEFAULT_PERIOD, DEFAULT_PRODUCT_ID,
    DEFAULT_VENDOR_ID, DriverSettings, per_device_charge,
};
use anyhow::{Context, Result, anyhow};
use common::{DeviceIdTable, DeviceIdentity, IdFilter, LimitedPool, MemoryPool, SystemPool};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub driver: DriverSection,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Simulated bus used by the binary
    #[serde(default)]
    pub simulation: SimulationSettings,
}

/// Core driver parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSection {
    #[serde(default = "DriverSection::default_name")]
    pub name: String,
    /// Trigger period in milliseconds
    #[serde(default = "DriverSection::default_period_ms")]
    pub period_ms: u64,
    /// Delay from attach to the first firing, in milliseconds
    #[serde(default = "DriverSection::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Data buffer capacity per device in bytes
    #[serde(default = "DriverSection::default_buffer_size")]
    pub buffer_size: usize,
    /// Byte budget shared by all device records and buffers (None = unlimited)
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,
    /// Id table, `VID:PID` filters (e.g. "0x1234:0x5678", "0x1234:*")
    #[serde(default = "DriverSection::default_id_table")]
    pub id_table: Vec<String>,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            period_ms: Self::default_period_ms(),
            initial_delay_ms: Self::default_initial_delay_ms(),
            buffer_size: Self::default_buffer_size(),
            memory_limit_bytes: None,
            id_table: Self::default_id_table(),
        }
    }
}

impl DriverSection {
    fn default_name() -> String {
        "usb_timer_driver".to_string()
    }

    fn default_period_ms() -> u64 {
        u64::try_from(DEFAULT_PERIOD.as_millis()).unwrap_or(u64::MAX)
    }

    fn default_initial_delay_ms() -> u64 {
        u64::try_from(DEFAULT_INITIAL_DELAY.as_millis()).unwrap_or(u64::MAX)
    }

    fn default_buffer_size() -> usize {
        DEFAULT_BUFFER_SIZE
    }

    fn default_id_table() -> Vec<String> {
        vec![IdFilter::exact(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).to_string()]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Identities plugged in at startup (`0xVID:0xPID`)
    #[serde(default = "SimulationSettings::default_devices")]
    pub devices: Vec<String>,
    /// Run time in seconds before unloading (0 = until Ctrl-C)
    #[serde(default)]
    pub run_secs: u64,
    /// Unplug each device this long after it was plugged (None = keep until unload)
    #[serde(default)]
    pub unplug_after_ms: Option<u64>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            devices: Self::default_devices(),
            run_secs: 0,
            unplug_after_ms: None,
        }
    }
}

impl SimulationSettings {
    fn default_devices() -> Vec<String> {
        vec![IdFilter::exact(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).to_string()]
    }

    /// Parsed device identities
    pub fn identities(&self) -> Result<Vec<DeviceIdentity>> {
        self.devices
            .iter()
            .map(|d| {
                d.parse::<DeviceIdentity>()
                    .with_context(|| format!("Invalid simulated device '{}'", d))
            })
            .collect()
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver: DriverSection::default(),
            logging: LoggingSettings::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-timer-driver/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-timer-driver").join("driver.toml")
        } else {
            PathBuf::from(".config/usb-timer-driver/driver.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.driver.period_ms == 0 {
            return Err(anyhow!("period_ms must be greater than zero"));
        }
        if self.driver.initial_delay_ms == 0 {
            return Err(anyhow!(
                "initial_delay_ms must be greater than zero (first firing must be in the future)"
            ));
        }
        if self.driver.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than zero"));
        }
        let device_bytes = per_device_charge(self.driver.buffer_size);
        if let Some(limit) = self.driver.memory_limit_bytes
            && limit < device_bytes
        {
            return Err(anyhow!(
                "memory_limit_bytes ({}) is smaller than one device record plus buffer ({})",
                limit,
                device_bytes
            ));
        }

        DeviceIdTable::parse(&self.driver.id_table).context("Invalid id_table")?;
        self.simulation.identities()?;

        Ok(())
    }

    /// Driver settings described by this configuration
    pub fn driver_settings(&self) -> Result<DriverSettings> {
        Ok(DriverSettings {
            name: self.driver.name.clone(),
            period: Duration::from_millis(self.driver.period_ms),
            initial_delay: Duration::from_millis(self.driver.initial_delay_ms),
            buffer_size: self.driver.buffer_size,
            id_table: DeviceIdTable::parse(&self.driver.id_table).context("Invalid id_table")?,
        })
    }

    /// Memory pool honouring `memory_limit_bytes`
    pub fn memory_pool(&self) -> Arc<dyn MemoryPool> {
        match self.driver.memory_limit_bytes {
            Some(limit) => Arc::new(LimitedPool::new(limit)),
            None => Arc::new(SystemPool),
        }
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<DriverConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DriverConfig::load(Some(path_buf))
}
