use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::reading_writer::ReadingWriter;
use super::table_reader::{reading_channel, TableReader};
use super::table_request_manager::{
    request_channel, start_manager, SchedulerHandle, SchedulerSettings, SchedulerStatus,
};
use crate::config::Config;
use crate::devices::{GatewayAddr, TableCatalog};
use crate::modbus::{RegisterTransport, TcpModbusClient};
use crate::utils::error::ModbusError;

/// Owns the running pipeline (readers, writer, scheduler) and exposes the
/// recording controls.
pub struct SystemControlService {
    config: Config,
    scheduler: SchedulerHandle,
    readers: Vec<JoinHandle<()>>,
    writer: JoinHandle<u64>,
    current_recording: Option<String>,
}

impl SystemControlService {
    /// Starts the pipeline against the configured gateways over Modbus TCP.
    pub async fn start(config: Config) -> Result<Self, ModbusError> {
        config.validate()?;

        let transports = config
            .gateways
            .iter()
            .map(|gateway| {
                let client = TcpModbusClient::new(gateway.addr(), config.reader.register_kind)
                    .with_connect_timeout(Duration::from_millis(config.reader.connect_timeout_ms))
                    .with_io_timeout(Duration::from_millis(config.reader.timeout_ms));
                (gateway.addr(), Arc::new(client) as Arc<dyn RegisterTransport>)
            })
            .collect();

        let writer = ReadingWriter::from_config(&config.output).await?;
        Self::with_transports(config, transports, writer)
    }

    /// Starts the pipeline with caller-provided transports, one per configured gateway.
    pub fn with_transports(
        config: Config,
        mut transports: HashMap<GatewayAddr, Arc<dyn RegisterTransport>>,
        writer: ReadingWriter,
    ) -> Result<Self, ModbusError> {
        config.validate()?;
        let catalog = Arc::new(TableCatalog::from_configs(&config.tables)?);

        info!(
            "🚀 Starting table poller: {} gateway(s), {} table layout(s)",
            config.gateways.len(),
            catalog.len()
        );

        let (readings_tx, readings_rx) = reading_channel();
        let mut queues = HashMap::new();
        let mut readers = Vec::new();

        for gateway in config.gateway_addrs() {
            let transport = transports.remove(&gateway).ok_or_else(|| {
                ModbusError::ConfigError(format!("No transport for gateway {}", gateway))
            })?;

            let (requests_tx, requests_rx) = request_channel();
            let reader = TableReader::new(gateway.clone(), transport, catalog.clone(), &config.reader);
            readers.push(reader.spawn(requests_rx, readings_tx.clone()));
            queues.insert(gateway, requests_tx);
        }
        // Readers hold the only senders, so the writer ends once they do.
        drop(readings_tx);

        let writer = writer.spawn(readings_rx);
        let scheduler = start_manager(queues, SchedulerSettings::from(&config.scheduler));

        Ok(Self {
            config,
            scheduler,
            readers,
            writer,
            current_recording: None,
        })
    }

    /// Polls every configured table under a new recording id and returns it.
    pub fn start_recording(&mut self, recording_id: Option<String>) -> Result<String, ModbusError> {
        let recording_id = recording_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let tables = self.config.table_addrs();

        if tables.is_empty() {
            warn!("⚠️  No tables configured, recording {} will be empty", recording_id);
        }

        info!("⏺️  Starting recording {} over {} table(s)", recording_id, tables.len());
        self.scheduler.reset_requests(tables, recording_id.clone())?;
        self.current_recording = Some(recording_id.clone());
        Ok(recording_id)
    }

    pub fn stop(&self) -> Result<(), ModbusError> {
        self.scheduler.stop_requests()
    }

    pub fn resume(&self) -> Result<(), ModbusError> {
        self.scheduler.resume_requests()
    }

    pub fn current_recording(&self) -> Option<&str> {
        self.current_recording.as_deref()
    }

    pub fn attached_gateways(&self) -> Vec<GatewayAddr> {
        let mut gateways: Vec<GatewayAddr> = self.scheduler.known_gateways().iter().cloned().collect();
        gateways.sort();
        gateways
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Stops the scheduler, then waits for readers and the writer to drain.
    /// Returns how many readings the writer handled.
    pub async fn shutdown(self) -> Result<u64, ModbusError> {
        info!("🛑 Shutting down table poller");
        self.scheduler.shutdown().await?;

        for reader in self.readers {
            if let Err(e) = reader.await {
                error!("❌ Reader task failed: {}", e);
            }
        }

        self.writer.await.map_err(|e| {
            ModbusError::ServiceNotAvailable(format!("Reading writer task failed: {}", e))
        })
    }
}
