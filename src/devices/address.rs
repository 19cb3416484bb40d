use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::error::ModbusError;

/// A network-reachable gateway multiplexing access to the devices behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GatewayAddr {
    pub host: String,
    pub port: u16,
}

impl GatewayAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for GatewayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for GatewayAddr {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            ModbusError::ConfigError(format!("Gateway address '{}' must be host:port", s))
        })?;

        if host.is_empty() {
            return Err(ModbusError::ConfigError(format!("Gateway address '{}' has no host", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| ModbusError::ConfigError(format!("Invalid gateway port '{}': {}", port, e)))?;

        Ok(Self::new(host, port))
    }
}

/// A device behind a gateway, identified by its unit (slave) id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddr {
    pub gateway_addr: GatewayAddr,
    pub unit: u8,
}

impl DeviceAddr {
    pub fn new(gateway_addr: GatewayAddr, unit: u8) -> Self {
        Self { gateway_addr, unit }
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/unit {}", self.gateway_addr, self.unit)
    }
}

/// One logical table of registers on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableAddr {
    pub device_addr: DeviceAddr,
    pub table_id: u32,
}

impl TableAddr {
    pub fn new(device_addr: DeviceAddr, table_id: u32) -> Self {
        Self {
            device_addr,
            table_id,
        }
    }

    pub fn gateway_addr(&self) -> &GatewayAddr {
        &self.device_addr.gateway_addr
    }

    pub fn unit(&self) -> u8 {
        self.device_addr.unit
    }
}

impl fmt::Display for TableAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/table {}", self.device_addr, self.table_id)
    }
}
