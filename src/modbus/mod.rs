pub mod client;
pub mod protocol;
pub mod registers;

pub use client::{RegisterTransport, TcpModbusClient};
pub use protocol::{ModbusRequest, ModbusResponse, RegisterKind};
pub use registers::{read_registers, RegisterMap, RegisterResponse, MAX_REGISTERS_PER_REQUEST};
