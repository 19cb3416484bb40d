use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::messages::{ReadTableMsg, TableReading};
use super::table_request_manager::RequestReceiver;
use crate::config::ReaderConfig;
use crate::devices::{GatewayAddr, TableAddr, TableCatalog};
use crate::modbus::{read_registers, RegisterMap, RegisterResponse, RegisterTransport, MAX_REGISTERS_PER_REQUEST};
use crate::utils::error::ModbusError;

pub type ReadingSender = mpsc::UnboundedSender<TableReading>;
pub type ReadingReceiver = mpsc::UnboundedReceiver<TableReading>;

pub fn reading_channel() -> (ReadingSender, ReadingReceiver) {
    mpsc::unbounded_channel()
}

/// Serves read requests for the tables of one gateway.
pub struct TableReader {
    gateway: GatewayAddr,
    transport: Arc<dyn RegisterTransport>,
    catalog: Arc<TableCatalog>,
    max_retries: u32,
    retry_delay: Duration,
}

impl TableReader {
    pub fn new(
        gateway: GatewayAddr,
        transport: Arc<dyn RegisterTransport>,
        catalog: Arc<TableCatalog>,
        config: &ReaderConfig,
    ) -> Self {
        Self {
            gateway,
            transport,
            catalog,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    pub fn gateway(&self) -> &GatewayAddr {
        &self.gateway
    }

    /// Reads every register of a table, one request per chunk that fits a
    /// single read. Each chunk becomes its own reading.
    pub async fn read_table(
        &self,
        table: &TableAddr,
        recording_id: &str,
    ) -> Result<Vec<TableReading>, ModbusError> {
        if table.gateway_addr() != &self.gateway {
            return Err(ModbusError::ConfigError(format!(
                "Table {} does not belong to gateway {}",
                table, self.gateway
            )));
        }

        let layout = self.catalog.get(table.table_id).ok_or_else(|| {
            ModbusError::ConfigError(format!("Unknown table id {}", table.table_id))
        })?;

        let chunks = layout.registers.chunks(MAX_REGISTERS_PER_REQUEST);
        let mut readings = Vec::with_capacity(chunks.len());

        for chunk in &chunks {
            let response = self.read_chunk(table.unit(), chunk).await?;
            readings.push(TableReading {
                table_addr: table.clone(),
                recording_id: recording_id.to_string(),
                timestamp: Utc::now(),
                values: response.values(),
            });
        }

        debug!("Read {} in {} request(s)", table, chunks.len());
        Ok(readings)
    }

    async fn read_chunk(&self, unit: u8, chunk: &RegisterMap) -> Result<RegisterResponse, ModbusError> {
        let mut attempt = 0;
        loop {
            match read_registers(self.transport.as_ref(), unit, chunk).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connection_fault() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "⚠️  Read from {} unit {} failed (attempt {}/{}): {}",
                        self.gateway,
                        unit,
                        attempt,
                        self.max_retries + 1,
                        e
                    );
                    sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consumes requests until the request queue closes or nobody listens for readings.
    ///
    /// Requests that queue up while a read is running are folded together:
    /// at most one pending request per table, and only for the newest recording.
    pub async fn run(self, mut requests: RequestReceiver, readings: ReadingSender) {
        info!("📡 Table reader started for gateway {}", self.gateway);

        let mut pending = VecDeque::new();

        loop {
            if pending.is_empty() {
                match requests.recv().await {
                    Some(msg) => pending.push_back(msg),
                    None => break,
                }
            }

            while let Ok(msg) = requests.try_recv() {
                absorb_request(&mut pending, msg);
            }

            let Some(ReadTableMsg {
                table_addr,
                recording_id,
            }) = pending.pop_front()
            else {
                continue;
            };

            match self.read_table(&table_addr, &recording_id).await {
                Ok(batch) => {
                    for reading in batch {
                        if readings.send(reading).is_err() {
                            warn!("Reading channel closed, stopping reader for {}", self.gateway);
                            return;
                        }
                    }
                }
                Err(e) => error!("❌ Failed to read {}: {}", table_addr, e),
            }
        }

        info!("🛑 Table reader for gateway {} stopped", self.gateway);
    }

    pub fn spawn(self, requests: RequestReceiver, readings: ReadingSender) -> JoinHandle<()> {
        tokio::spawn(self.run(requests, readings))
    }
}

fn absorb_request(pending: &mut VecDeque<ReadTableMsg>, msg: ReadTableMsg) {
    // A newer recording supersedes everything queued for an older one.
    let queued = pending.len();
    pending.retain(|p| p.recording_id == msg.recording_id);
    if pending.len() < queued {
        debug!(
            "Dropped {} queued request(s) superseded by recording {}",
            queued - pending.len(),
            msg.recording_id
        );
    }

    if !pending.iter().any(|p| p.table_addr == msg.table_addr) {
        pending.push_back(msg);
    }
}
