//! Gateway table polling library
//!
//! Periodically requests register tables from devices behind Modbus TCP
//! gateways, decodes multi-word registers into single values and hands the
//! readings to formatters, senders and optional SQLite storage. Polling is
//! driven by a single time-ordered scheduler controlled through an
//! instruction channel (reset, stop, resume).

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
#[cfg(feature = "sqlite")]
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::{DeviceAddr, GatewayAddr, TableAddr, TableCatalog};
pub use modbus::{read_registers, RegisterMap, RegisterResponse, RegisterTransport, TcpModbusClient};
pub use output::{ConsoleFormatter, CsvFormatter, DataFormatter, DataSender, JsonFormatter};
pub use services::{
    Instruction, ReadTableMsg, SchedulerHandle, SystemControlService, TableReader, TableReading,
};
#[cfg(feature = "sqlite")]
pub use storage::{ReadingRow, ReadingStats, SqliteManager};
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
