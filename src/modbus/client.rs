use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::protocol::{
    decode_response, frame_length, ModbusRequest, ModbusResponse, RegisterKind, MBAP_HEADER_LEN,
};
use crate::devices::GatewayAddr;
use crate::utils::error::ModbusError;

/// Executes a register read against a device. Addresses are 0-indexed wire addresses.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    async fn read_registers(
        &self,
        unit: u8,
        start_addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;
}

/// Modbus TCP client for one gateway. One request is in flight at a time.
pub struct TcpModbusClient {
    gateway: GatewayAddr,
    kind: RegisterKind,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    transaction_id: AtomicU16,
}

impl TcpModbusClient {
    pub fn new(gateway: GatewayAddr, kind: RegisterKind) -> Self {
        Self {
            gateway,
            kind,
            connect_timeout: Duration::from_secs(3),
            io_timeout: Duration::from_secs(1),
            stream: Mutex::new(None),
            transaction_id: AtomicU16::new(1),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn gateway(&self) -> &GatewayAddr {
        &self.gateway
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    async fn connect(&self) -> Result<TcpStream, ModbusError> {
        let addr = self.gateway.socket_addr();
        debug!("TCP connecting: {}", addr);

        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("🔌 Connected to gateway {}", addr);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ModbusError::ConnectionError(format!(
                "Failed to connect to {}: {}",
                addr, e
            ))),
            Err(_) => Err(ModbusError::ConnectionError(format!(
                "Connection to {} timed out",
                addr
            ))),
        }
    }

    async fn exchange(
        stream: &mut TcpStream,
        request: &ModbusRequest,
    ) -> Result<ModbusResponse, ModbusError> {
        let frame = request.encode();
        debug!("TX {}", hex::encode(&frame));
        stream.write_all(&frame).await?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let remaining = frame_length(&header)?;

        let mut response = Vec::with_capacity(MBAP_HEADER_LEN + remaining);
        response.extend_from_slice(&header);
        response.resize(MBAP_HEADER_LEN + remaining, 0);
        stream.read_exact(&mut response[MBAP_HEADER_LEN..]).await?;
        debug!("RX {}", hex::encode(&response));

        decode_response(request, &response)
    }

    fn next_transaction_id(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl RegisterTransport for TcpModbusClient {
    async fn read_registers(
        &self,
        unit: u8,
        start_addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }

        let request = ModbusRequest {
            transaction_id: self.next_transaction_id(),
            unit,
            kind: self.kind,
            start_addr,
            count,
        };

        let result = match guard.as_mut() {
            Some(stream) => match timeout(self.io_timeout, Self::exchange(stream, &request)).await {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            },
            None => Err(ModbusError::ConnectionError(format!(
                "No connection to {}",
                self.gateway
            ))),
        };

        match result {
            Ok(ModbusResponse::Registers(words)) => Ok(words),
            Ok(ModbusResponse::Exception(code)) => Err(ModbusError::Exception {
                function: self.kind.function_code(),
                code,
            }),
            Err(e) => {
                if e.is_connection_fault() {
                    warn!("⚠️  Dropping connection to {} after: {}", self.gateway, e);
                    *guard = None;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answers `requests` reads, register n holding the value n, then closes the connection.
    async fn fake_gateway(requests: usize, exception: Option<u8>) -> (GatewayAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for _ in 0..requests {
                let mut request = [0u8; 12];
                if socket.read_exact(&mut request).await.is_err() {
                    return;
                }
                let start = u16::from_be_bytes([request[8], request[9]]);
                let count = u16::from_be_bytes([request[10], request[11]]);

                let mut pdu = Vec::new();
                match exception {
                    Some(code) => {
                        pdu.push(request[7] | 0x80);
                        pdu.push(code);
                    }
                    None => {
                        pdu.push(request[7]);
                        pdu.push((count * 2) as u8);
                        for i in 0..count {
                            pdu.extend_from_slice(&(start + i).to_be_bytes());
                        }
                    }
                }

                let mut frame = Vec::new();
                frame.extend_from_slice(&request[0..4]);
                frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
                frame.push(request[6]);
                frame.extend_from_slice(&pdu);
                socket.write_all(&frame).await.unwrap();
            }
        });

        (GatewayAddr::new("127.0.0.1", port), handle)
    }

    #[tokio::test]
    async fn test_read_input_registers_over_tcp() {
        let (gateway, server) = fake_gateway(2, None).await;
        let client = TcpModbusClient::new(gateway, RegisterKind::Input);

        let words = client.read_registers(1, 100, 3).await.unwrap();
        assert_eq!(words, vec![100, 101, 102]);

        let words = client.read_registers(1, 0, 1).await.unwrap();
        assert_eq!(words, vec![0]);
        assert!(client.is_connected().await);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exception_response_keeps_connection() {
        let (gateway, server) = fake_gateway(1, Some(0x02)).await;
        let client = TcpModbusClient::new(gateway, RegisterKind::Holding);

        let result = client.read_registers(1, 100, 3).await;
        assert!(matches!(
            result,
            Err(ModbusError::Exception { function: 0x03, code: 0x02 })
        ));
        assert!(client.is_connected().await);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_is_dropped() {
        let (gateway, server) = fake_gateway(0, None).await;
        let client = TcpModbusClient::new(gateway, RegisterKind::Input)
            .with_io_timeout(Duration::from_millis(500));

        let result = client.read_registers(1, 100, 3).await;
        assert!(result.is_err());
        assert!(!client.is_connected().await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_gateway() {
        // Bind and release a port so nothing listens on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TcpModbusClient::new(GatewayAddr::new("127.0.0.1", port), RegisterKind::Input);
        let result = client.read_registers(1, 0, 1).await;
        assert!(matches!(result, Err(ModbusError::ConnectionError(_))));
    }
}
