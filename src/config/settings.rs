use clap::ArgMatches;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::devices::{DeviceAddr, GatewayAddr, TableAddr};
use crate::modbus::RegisterKind;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,

    #[serde(default)]
    pub tables: Vec<TableConfig>,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub default_interval_ms: u64,       // Polling interval for every table
    pub instruction_poll_ms: u64,       // Cadence of the instruction drain
    pub max_consecutive_faults: u32,    // Faults before the scheduler reports itself degraded
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 500,
            instruction_poll_ms: 500,
            max_consecutive_faults: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }

    pub fn instruction_poll(&self) -> Duration {
        Duration::from_millis(self.instruction_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub connect_timeout_ms: u64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub register_kind: RegisterKind,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            timeout_ms: 1000,
            max_retries: 2,
            retry_delay_ms: 200,
            register_kind: RegisterKind::Input,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl GatewayConfig {
    pub fn addr(&self) -> GatewayAddr {
        GatewayAddr::new(self.host.clone(), self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub unit: u8,                       // Modbus unit id behind the gateway
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub tables: Vec<u32>,               // Table ids polled on this device
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub registers: Vec<RegisterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub address: u16,                   // Named (1-indexed) register address
    #[serde(default = "default_width")]
    pub width: u16,                     // Width in 16-bit words
    #[serde(default)]
    pub description: String,
}

fn default_width() -> u16 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: String,
    pub file_path: Option<String>,
    pub console: bool,
    pub database: Option<DatabaseOutputConfig>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            file_path: None,
            console: true,
            database: Some(DatabaseOutputConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOutputConfig {
    pub enabled: bool,
    pub database_path: String,
    pub busy_timeout_ms: u64,
    pub enable_wal: bool,
    pub batch_size: usize,
    pub retention_hours: u64,           // 0 keeps readings forever
}

impl Default for DatabaseOutputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database_path: "data/readings.db".to_string(),
            busy_timeout_ms: 30000,
            enable_wal: true,
            batch_size: 100,
            retention_hours: 0,
        }
    }
}

impl Config {
    /// Sample setup: one gateway, one device, two meter tables.
    pub fn sample() -> Self {
        let wide = |addresses: &[u16]| -> Vec<RegisterConfig> {
            addresses
                .iter()
                .map(|&address| RegisterConfig {
                    address,
                    width: 2,
                    description: String::new(),
                })
                .collect()
        };

        Self {
            gateways: vec![GatewayConfig {
                host: "127.0.0.1".to_string(),
                port: 5020,
                label: "Site gateway".to_string(),
                devices: vec![DeviceConfig {
                    unit: 1,
                    label: "Main meter".to_string(),
                    tables: vec![1, 2],
                }],
            }],
            tables: vec![
                TableConfig {
                    id: 1,
                    name: "Hour meter and frequency".to_string(),
                    registers: wide(&[0xC550, 0xC552, 0xC554, 0xC556, 0xC558, 0xC55A, 0xC55C, 0xC55E]),
                },
                TableConfig {
                    id: 2,
                    name: "Currents".to_string(),
                    registers: wide(&[0xC560, 0xC562, 0xC564, 0xC566]),
                },
            ],
            ..Self::default()
        }
    }

    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ModbusError> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) if Path::new(path).exists() => Self::from_file(path)?,
            Some(path) => {
                warn!("Config file {} not found, using sample configuration", path);
                Self::sample()
            }
            None => Self::sample(),
        };

        // Override with command line arguments
        if let Some(interval) = matches.get_one::<String>("interval") {
            config.scheduler.default_interval_ms = interval.parse().map_err(|e| {
                ModbusError::ConfigError(format!("Invalid interval '{}': {}", interval, e))
            })?;
        }

        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        info!("📋 Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.scheduler.default_interval_ms == 0 || self.scheduler.instruction_poll_ms == 0 {
            return Err(ModbusError::ConfigError(
                "Scheduler intervals must be greater than zero".to_string(),
            ));
        }

        let known_tables: HashSet<u32> = self.tables.iter().map(|t| t.id).collect();
        let mut seen_gateways = HashSet::new();

        for gateway in &self.gateways {
            if gateway.host.trim().is_empty() {
                return Err(ModbusError::ConfigError("Gateway host must not be empty".to_string()));
            }
            if gateway.port == 0 {
                return Err(ModbusError::ConfigError(format!(
                    "Gateway {} has an invalid port",
                    gateway.host
                )));
            }
            if !seen_gateways.insert(gateway.addr()) {
                return Err(ModbusError::ConfigError(format!(
                    "Gateway {} listed more than once",
                    gateway.addr()
                )));
            }

            for device in &gateway.devices {
                if device.unit == 0 {
                    warn!(
                        "⚠️  Unit 0 on gateway {} is the broadcast address, most gateways will not answer it",
                        gateway.addr()
                    );
                }
                if let Some(missing) = device.tables.iter().find(|t| !known_tables.contains(t)) {
                    return Err(ModbusError::ConfigError(format!(
                        "Unit {} on gateway {} references undefined table {}",
                        device.unit,
                        gateway.addr(),
                        missing
                    )));
                }
            }
        }

        // Register layouts are checked by building the catalog.
        crate::devices::TableCatalog::from_configs(&self.tables)?;

        Ok(())
    }

    pub fn gateway_addrs(&self) -> Vec<GatewayAddr> {
        self.gateways.iter().map(|g| g.addr()).collect()
    }

    /// Every configured table, expanded from gateways through devices.
    pub fn table_addrs(&self) -> HashSet<TableAddr> {
        let mut tables = HashSet::new();
        for gateway in &self.gateways {
            let gateway_addr = gateway.addr();
            for device in &gateway.devices {
                let device_addr = DeviceAddr::new(gateway_addr.clone(), device.unit);
                for &table_id in &device.tables {
                    tables.insert(TableAddr::new(device_addr.clone(), table_id));
                }
            }
        }
        tables
    }
}
