use log::{debug, error, info};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::messages::TableReading;
use super::table_reader::ReadingReceiver;
use crate::config::OutputConfig;
use crate::output::{formatter_for, ConsoleSender, DataFormatter, DataSender, FileSender};
use crate::utils::error::ModbusError;

#[cfg(feature = "sqlite")]
use crate::storage::{ReadingRow, SqliteManager};

#[cfg(feature = "sqlite")]
struct ReadingStore {
    manager: SqliteManager,
    buffer: Vec<ReadingRow>,
    batch_size: usize,
    retention_hours: u64,
}

#[cfg(feature = "sqlite")]
impl ReadingStore {
    async fn add(&mut self, reading: &TableReading) -> Result<(), ModbusError> {
        self.buffer.extend(ReadingRow::from_reading(reading));
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<usize, ModbusError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::take(&mut self.buffer);
        debug!("🔄 Flushing {} register values to database", rows.len());
        self.manager.batch_insert_readings(rows).await
    }

    async fn cleanup(&self) -> Result<u64, ModbusError> {
        if self.retention_hours == 0 {
            return Ok(0);
        }
        self.manager.cleanup_old_data(self.retention_hours).await
    }
}

/// How often stored readings are checked against the retention window.
pub const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Terminal consumer of table readings: formats them for every sender and
/// optionally persists them.
pub struct ReadingWriter {
    formatter: Box<dyn DataFormatter>,
    senders: Vec<Box<dyn DataSender>>,
    #[cfg(feature = "sqlite")]
    store: Option<ReadingStore>,
    written: u64,
}

impl ReadingWriter {
    pub fn new(formatter: Box<dyn DataFormatter>) -> Self {
        Self {
            formatter,
            senders: Vec::new(),
            #[cfg(feature = "sqlite")]
            store: None,
            written: 0,
        }
    }

    pub async fn from_config(config: &OutputConfig) -> Result<Self, ModbusError> {
        let mut writer = Self::new(formatter_for(&config.format)?);

        if config.console {
            writer.add_sender(Box::new(ConsoleSender));
        }
        if let Some(path) = &config.file_path {
            writer.add_sender(Box::new(FileSender::new(path, true)));
        }

        #[cfg(feature = "sqlite")]
        {
            if let Some(database) = config.database.as_ref().filter(|db| db.enabled) {
                let manager = SqliteManager::new(database).await?;
                writer = writer
                    .with_storage(manager, database.batch_size)
                    .with_retention(database.retention_hours);
            }
        }

        #[cfg(not(feature = "sqlite"))]
        {
            if config.database.as_ref().map(|db| db.enabled).unwrap_or(false) {
                log::warn!("📝 Database output requested but built without the sqlite feature");
            }
        }

        Ok(writer)
    }

    #[cfg(feature = "sqlite")]
    pub fn with_storage(mut self, manager: SqliteManager, batch_size: usize) -> Self {
        info!("💾 Database storage enabled (batch size {})", batch_size.max(1));
        self.store = Some(ReadingStore {
            manager,
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
            retention_hours: 0,
        });
        self
    }

    /// Drops stored readings older than `hours` on start and then hourly.
    /// No-op without storage or with `hours == 0`.
    #[cfg(feature = "sqlite")]
    pub fn with_retention(mut self, hours: u64) -> Self {
        if let Some(store) = self.store.as_mut() {
            if hours > 0 {
                info!("🧹 Keeping stored readings for {} hour(s)", hours);
            }
            store.retention_hours = hours;
        }
        self
    }

    pub fn add_sender(&mut self, sender: Box<dyn DataSender>) {
        info!("📤 Added {} sender to {}", sender.sender_type(), sender.destination());
        self.senders.push(sender);
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, reading: &TableReading) {
        let output = self.formatter.format_reading(reading);

        for sender in &self.senders {
            if let Err(e) = sender.send(&output).await {
                error!(
                    "❌ Failed to send reading via {} to {}: {}",
                    sender.sender_type(),
                    sender.destination(),
                    e
                );
            }
        }

        #[cfg(feature = "sqlite")]
        {
            if let Some(store) = self.store.as_mut() {
                if let Err(e) = store.add(reading).await {
                    error!("❌ Failed to store reading of {}: {}", reading.table_addr, e);
                }
            }
        }

        self.written += 1;
    }

    /// Writes out whatever is still buffered for the database.
    pub async fn flush(&mut self) -> Result<usize, ModbusError> {
        #[cfg(feature = "sqlite")]
        {
            if let Some(store) = self.store.as_mut() {
                return store.flush().await;
            }
        }
        Ok(0)
    }

    /// Applies the retention window to stored readings.
    pub async fn cleanup(&mut self) -> Result<u64, ModbusError> {
        #[cfg(feature = "sqlite")]
        {
            if let Some(store) = self.store.as_ref() {
                return store.cleanup().await;
            }
        }
        Ok(0)
    }

    /// Consumes readings until every producer is gone, then flushes.
    pub async fn run(mut self, mut readings: ReadingReceiver) -> u64 {
        info!(
            "🚀 Reading writer started ({} format, {} sender(s))",
            self.formatter.name(),
            self.senders.len()
        );

        // First tick fires at once.
        let mut retention_timer = interval(RETENTION_CHECK_INTERVAL);
        retention_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = retention_timer.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!("❌ Retention cleanup failed: {}", e);
                    }
                }
                reading = readings.recv() => match reading {
                    Some(reading) => self.write(&reading).await,
                    None => break,
                },
            }
        }

        if let Err(e) = self.flush().await {
            error!("❌ Final flush failed: {}", e);
        }

        info!("🛑 Reading writer stopped after {} reading(s)", self.written);
        self.written
    }

    pub fn spawn(self, readings: ReadingReceiver) -> JoinHandle<u64> {
        tokio::spawn(self.run(readings))
    }
}
