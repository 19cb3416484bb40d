pub mod address;
pub mod tables;

pub use address::{DeviceAddr, GatewayAddr, TableAddr};
pub use tables::{TableCatalog, TableLayout};
