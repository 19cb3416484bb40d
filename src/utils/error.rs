use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Device exception: function 0x{function:02X}, code 0x{code:02X}")]
    Exception { function: u8, code: u8 },

    #[error("Unable to create request of such a large range: {span} registers (max {max})")]
    RequestTooLarge { span: u32, max: u32 },

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Service not available: {0}")]
    ServiceNotAvailable(String),
}

impl ModbusError {
    /// Faults after which the transport connection should be dropped and re-established.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            ModbusError::ConnectionError(_)
                | ModbusError::CommunicationError(_)
                | ModbusError::InvalidResponse(_)
                | ModbusError::Timeout
        )
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for ModbusError {
    fn from(err: sqlx::Error) -> Self {
        ModbusError::StorageError(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        ModbusError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::SerializationError(format!("TOML error: {}", err))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::Timeout
    }
}
