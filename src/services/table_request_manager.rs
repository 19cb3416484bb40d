//! Time-ordered table polling.
//!
//! The manager owns the live polling configuration and runs a single loop
//! over a min-heap of tasks keyed by wake time. Two kinds of task exist:
//! pushing a read request for one table onto its gateway's queue, and
//! draining the instruction channel. The instruction task always re-enqueues
//! itself, so the heap is never empty while the loop runs. A table's chain of
//! push tasks ends the first time it finds the table missing from the
//! configuration.

use log::{debug, error, info, warn};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::messages::{Instruction, ReadTableMsg};
use crate::config::SchedulerConfig;
use crate::devices::{GatewayAddr, TableAddr};
use crate::utils::error::ModbusError;

pub type RequestSender = mpsc::UnboundedSender<ReadTableMsg>;
pub type RequestReceiver = mpsc::UnboundedReceiver<ReadTableMsg>;
pub type InstructionSender = mpsc::UnboundedSender<Instruction>;

/// Creates the queue a gateway's reader consumes read requests from.
pub fn request_channel() -> (RequestSender, RequestReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub default_interval: Duration,
    pub instruction_poll: Duration,
    pub max_consecutive_faults: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            default_interval: config.default_interval(),
            instruction_poll: config.instruction_poll(),
            max_consecutive_faults: config.max_consecutive_faults.max(1),
        }
    }
}

/// Snapshot of the live configuration, published after every task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub sending_enabled: bool,
    pub recording_id: Option<String>,
    pub table_count: usize,
    pub consecutive_faults: u32,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Task {
    // `generation` ties the chain to the reset that started it.
    PushTableRequest { table: TableAddr, generation: u64 },
    ReadInstructions,
}

#[derive(Debug)]
struct ScheduledTask {
    wake_at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // Reversed: BinaryHeap is a max-heap and the earliest task must come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct TableRequestManager {
    queues: HashMap<GatewayAddr, RequestSender>,
    instructions: mpsc::UnboundedReceiver<Instruction>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<SchedulerStatus>,
    settings: SchedulerSettings,

    // Live configuration
    config: HashMap<TableAddr, Duration>,
    recording_id: Option<String>,
    sending_requests: bool,
    generation: u64,

    tasks: BinaryHeap<ScheduledTask>,
    next_seq: u64,
    instructions_closed: bool,
    consecutive_faults: u32,
    degraded: bool,
}

impl TableRequestManager {
    fn new(
        queues: HashMap<GatewayAddr, RequestSender>,
        instructions: mpsc::UnboundedReceiver<Instruction>,
        shutdown: watch::Receiver<bool>,
        status: watch::Sender<SchedulerStatus>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            queues,
            instructions,
            shutdown,
            status,
            settings,
            config: HashMap::new(),
            recording_id: None,
            sending_requests: false,
            generation: 0,
            tasks: BinaryHeap::new(),
            next_seq: 0,
            instructions_closed: false,
            consecutive_faults: 0,
            degraded: false,
        }
    }

    /// Runs until the shutdown signal fires or every handle is dropped.
    pub async fn run(mut self) {
        info!(
            "🗓️  Table request manager started for {} gateway(s)",
            self.queues.len()
        );

        self.enqueue_read_instructions_task(Duration::ZERO, Instant::now());

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let wake_at = match self.tasks.peek() {
                Some(next) => next.wake_at,
                None => {
                    // Unreachable while the instruction task re-enqueues itself.
                    warn!("Task queue unexpectedly empty, re-seeding instruction task");
                    self.enqueue_read_instructions_task(Duration::ZERO, Instant::now());
                    continue;
                }
            };

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = sleep_until(wake_at) => {}
            }

            if let Some(scheduled) = self.tasks.pop() {
                self.fire(scheduled.task);
            }
        }

        info!("🛑 Table request manager stopped");
    }

    fn fire(&mut self, task: Task) {
        let is_push = matches!(task, Task::PushTableRequest { .. });

        match self.run_task(task) {
            Ok(()) => {
                if is_push {
                    if self.degraded {
                        info!(
                            "✅ Table request manager recovered after {} consecutive faults",
                            self.consecutive_faults
                        );
                    }
                    self.consecutive_faults = 0;
                    self.degraded = false;
                }
            }
            Err(e) => {
                self.consecutive_faults += 1;
                warn!(
                    "⚠️  Task failed ({} consecutive): {}",
                    self.consecutive_faults, e
                );
                if !self.degraded && self.consecutive_faults >= self.settings.max_consecutive_faults {
                    self.degraded = true;
                    error!(
                        "❌ Table request manager degraded: {} consecutive task faults",
                        self.consecutive_faults
                    );
                }
            }
        }

        self.publish_status();
    }

    fn run_task(&mut self, task: Task) -> Result<(), ModbusError> {
        match task {
            Task::PushTableRequest { table, generation } => {
                self.run_push_table_request_task(table, generation)
            }
            Task::ReadInstructions => {
                self.run_read_instructions_task();
                Ok(())
            }
        }
    }

    fn run_push_table_request_task(
        &mut self,
        table: TableAddr,
        generation: u64,
    ) -> Result<(), ModbusError> {
        if generation != self.generation {
            debug!("Dropping request chain for {} from an earlier reset", table);
            return Ok(());
        }

        let interval = match self.config.get(&table) {
            Some(interval) => *interval,
            None => {
                debug!("Dropping request chain for removed table {}", table);
                return Ok(());
            }
        };

        // The chain keeps ticking while paused, and survives a failed send.
        self.enqueue_push_table_request_task(table.clone(), interval, Instant::now());

        if !self.sending_requests {
            return Ok(());
        }

        let recording_id = self.recording_id.clone().ok_or_else(|| {
            ModbusError::ConfigError(format!("No recording id for table {}", table))
        })?;

        let queue = self.queues.get(table.gateway_addr()).ok_or_else(|| {
            ModbusError::ConfigError(format!("No queue for gateway {}", table.gateway_addr()))
        })?;

        debug!("Making request to {}", table);
        queue
            .send(ReadTableMsg {
                table_addr: table.clone(),
                recording_id,
            })
            .map_err(|_| {
                ModbusError::ChannelClosed(format!(
                    "Reader queue for gateway {} is closed",
                    table.gateway_addr()
                ))
            })
    }

    fn run_read_instructions_task(&mut self) {
        loop {
            match self.instructions.try_recv() {
                Ok(instruction) => {
                    let name = instruction.name();
                    if let Err(e) = self.run_instruction(instruction) {
                        error!("❌ Refused {} instruction: {}", name, e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.instructions_closed {
                        warn!("Instruction channel closed, keeping current configuration");
                        self.instructions_closed = true;
                    }
                    break;
                }
            }
        }

        self.enqueue_read_instructions_task(self.settings.instruction_poll, Instant::now());
    }

    fn run_instruction(&mut self, instruction: Instruction) -> Result<(), ModbusError> {
        match instruction {
            Instruction::Stop => {
                info!("⏸️  Stopping table requests");
                self.sending_requests = false;
            }
            Instruction::Resume => {
                info!("▶️  Resuming table requests");
                self.sending_requests = true;
            }
            Instruction::ResetRequests {
                tables,
                recording_id,
            } => self.run_reset_instruction(tables, recording_id)?,
        }
        Ok(())
    }

    fn run_reset_instruction(
        &mut self,
        tables: HashSet<TableAddr>,
        recording_id: String,
    ) -> Result<(), ModbusError> {
        check_gateways(&tables, |gateway| self.queues.contains_key(gateway))?;

        info!(
            "🔄 Resetting requests: {} table(s) for recording {}",
            tables.len(),
            recording_id
        );

        let interval = self.settings.default_interval;
        self.config = tables.into_iter().map(|t| (t, interval)).collect();
        self.recording_id = Some(recording_id);
        self.generation += 1;

        let now = Instant::now();
        let tables: Vec<TableAddr> = self.config.keys().cloned().collect();
        for table in tables {
            self.enqueue_push_table_request_task(table, Duration::ZERO, now);
        }

        self.sending_requests = true;
        Ok(())
    }

    fn enqueue_push_table_request_task(&mut self, table: TableAddr, delay: Duration, now: Instant) {
        let generation = self.generation;
        self.enqueue_task(Task::PushTableRequest { table, generation }, delay, now);
    }

    fn enqueue_read_instructions_task(&mut self, delay: Duration, now: Instant) {
        self.enqueue_task(Task::ReadInstructions, delay, now);
    }

    fn enqueue_task(&mut self, task: Task, delay: Duration, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(ScheduledTask {
            wake_at: now + delay,
            seq,
            task,
        });
    }

    fn publish_status(&self) {
        let current = SchedulerStatus {
            sending_enabled: self.sending_requests,
            recording_id: self.recording_id.clone(),
            table_count: self.config.len(),
            consecutive_faults: self.consecutive_faults,
            degraded: self.degraded,
        };

        self.status.send_if_modified(|status| {
            if *status != current {
                *status = current;
                true
            } else {
                false
            }
        });
    }
}

fn check_gateways<F>(tables: &HashSet<TableAddr>, known: F) -> Result<(), ModbusError>
where
    F: Fn(&GatewayAddr) -> bool,
{
    let gateways: HashSet<&GatewayAddr> = tables.iter().map(|t| t.gateway_addr()).collect();
    match gateways.into_iter().find(|gateway| !known(gateway)) {
        Some(gateway) => Err(ModbusError::ConfigError(format!(
            "No queue for gateway: {}",
            gateway
        ))),
        None => Ok(()),
    }
}

/// Control handle of a running table request manager.
pub struct SchedulerHandle {
    instructions: InstructionSender,
    known_gateways: HashSet<GatewayAddr>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<SchedulerStatus>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Queues an instruction for the manager without waiting for it to be applied.
    pub fn submit(&self, instruction: Instruction) -> Result<(), ModbusError> {
        self.instructions.send(instruction).map_err(|_| {
            ModbusError::ServiceNotAvailable("Table request manager is not running".to_string())
        })
    }

    /// Resets the polled tables, refusing gateways the manager has no queue for.
    pub fn reset_requests(
        &self,
        tables: HashSet<TableAddr>,
        recording_id: impl Into<String>,
    ) -> Result<(), ModbusError> {
        check_gateways(&tables, |gateway| self.known_gateways.contains(gateway))?;
        self.submit(Instruction::ResetRequests {
            tables,
            recording_id: recording_id.into(),
        })
    }

    pub fn stop_requests(&self) -> Result<(), ModbusError> {
        self.submit(Instruction::Stop)
    }

    pub fn resume_requests(&self) -> Result<(), ModbusError> {
        self.submit(Instruction::Resume)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    pub fn known_gateways(&self) -> &HashSet<GatewayAddr> {
        &self.known_gateways
    }

    pub async fn shutdown(self) -> Result<(), ModbusError> {
        // The loop also stops when the sender is dropped, so a send error is fine.
        let _ = self.shutdown.send(true);
        self.join.await.map_err(|e| {
            ModbusError::ServiceNotAvailable(format!("Table request manager task failed: {}", e))
        })
    }
}

/// Spawns a table request manager writing to the given per-gateway queues.
///
/// Must be called from within a tokio runtime.
pub fn start_manager(
    queues: HashMap<GatewayAddr, RequestSender>,
    settings: SchedulerSettings,
) -> SchedulerHandle {
    let (instructions_tx, instructions_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
    let known_gateways = queues.keys().cloned().collect();

    let manager = TableRequestManager::new(queues, instructions_rx, shutdown_rx, status_tx, settings);
    let join = tokio::spawn(manager.run());

    SchedulerHandle {
        instructions: instructions_tx,
        known_gateways,
        shutdown: shutdown_tx,
        status: status_rx,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceAddr;
    use tokio::time::{sleep, timeout};

    const INTERVAL: Duration = Duration::from_millis(500);

    fn gateway(port: u16) -> GatewayAddr {
        GatewayAddr::new("127.0.0.1", port)
    }

    fn table(port: u16, unit: u8, id: u32) -> TableAddr {
        TableAddr::new(DeviceAddr::new(gateway(port), unit), id)
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            default_interval: INTERVAL,
            instruction_poll: INTERVAL,
            max_consecutive_faults: 3,
        }
    }

    fn tables(list: &[TableAddr]) -> HashSet<TableAddr> {
        list.iter().cloned().collect()
    }

    fn drain(rx: &mut RequestReceiver) -> Vec<ReadTableMsg> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    async fn recv(rx: &mut RequestReceiver) -> ReadTableMsg {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no request within 5s")
            .expect("request queue closed")
    }

    fn idle_manager(
        queues: HashMap<GatewayAddr, RequestSender>,
    ) -> (TableRequestManager, InstructionSender) {
        let (instructions_tx, instructions_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, _status_rx) = watch::channel(SchedulerStatus::default());
        let manager = TableRequestManager::new(queues, instructions_rx, shutdown_rx, status_tx, settings());
        (manager, instructions_tx)
    }

    #[test]
    fn test_tasks_pop_in_wake_time_order() {
        let (mut manager, _tx) = idle_manager(HashMap::new());
        let now = Instant::now();

        manager.enqueue_push_table_request_task(table(502, 1, 3), Duration::from_millis(30), now);
        manager.enqueue_push_table_request_task(table(502, 1, 1), Duration::from_millis(10), now);
        manager.enqueue_read_instructions_task(Duration::from_millis(20), now);
        manager.enqueue_push_table_request_task(table(502, 1, 2), Duration::from_millis(10), now);

        let order: Vec<Task> = std::iter::from_fn(|| manager.tasks.pop().map(|t| t.task)).collect();
        assert_eq!(
            order,
            vec![
                Task::PushTableRequest { table: table(502, 1, 1), generation: 0 },
                Task::PushTableRequest { table: table(502, 1, 2), generation: 0 },
                Task::ReadInstructions,
                Task::PushTableRequest { table: table(502, 1, 3), generation: 0 },
            ]
        );
    }

    #[test]
    fn test_instructions_apply_in_arrival_order() {
        let (tx, _rx) = request_channel();
        let (mut manager, instructions) = idle_manager(HashMap::from([(gateway(502), tx)]));

        instructions
            .send(Instruction::ResetRequests {
                tables: tables(&[table(502, 1, 1), table(502, 1, 2)]),
                recording_id: "R1".to_string(),
            })
            .unwrap();
        instructions.send(Instruction::Stop).unwrap();
        instructions.send(Instruction::Resume).unwrap();
        instructions.send(Instruction::Stop).unwrap();

        manager.run_read_instructions_task();

        assert!(!manager.sending_requests);
        assert_eq!(manager.recording_id.as_deref(), Some("R1"));
        assert_eq!(manager.config.len(), 2);
        assert!(manager.config.values().all(|interval| *interval == INTERVAL));
        // Two immediate push tasks plus the next instruction drain.
        assert_eq!(manager.tasks.len(), 3);
    }

    #[test]
    fn test_empty_drain_still_reschedules() {
        let (mut manager, _instructions) = idle_manager(HashMap::new());
        manager.run_read_instructions_task();
        manager.run_read_instructions_task();

        assert_eq!(manager.tasks.len(), 2);
        assert!(manager.tasks.iter().all(|t| t.task == Task::ReadInstructions));
        assert!(!manager.sending_requests);
        assert!(manager.config.is_empty());
    }

    #[test]
    fn test_reset_with_unknown_gateway_keeps_prior_configuration() {
        let (tx, _rx) = request_channel();
        let (mut manager, _instructions) = idle_manager(HashMap::from([(gateway(502), tx)]));

        manager
            .run_instruction(Instruction::ResetRequests {
                tables: tables(&[table(502, 1, 1)]),
                recording_id: "A".to_string(),
            })
            .unwrap();
        manager.run_instruction(Instruction::Stop).unwrap();

        let result = manager.run_instruction(Instruction::ResetRequests {
            tables: tables(&[table(502, 1, 2), table(9999, 1, 1)]),
            recording_id: "B".to_string(),
        });

        assert!(matches!(result, Err(ModbusError::ConfigError(_))));
        assert_eq!(manager.recording_id.as_deref(), Some("A"));
        assert!(manager.config.contains_key(&table(502, 1, 1)));
        assert!(!manager.sending_requests);
        assert_eq!(manager.generation, 1);
    }

    #[test]
    fn test_removed_table_chain_ends() {
        let (tx, mut rx) = request_channel();
        let (mut manager, _instructions) = idle_manager(HashMap::from([(gateway(502), tx)]));

        manager
            .run_instruction(Instruction::ResetRequests {
                tables: tables(&[table(502, 1, 1)]),
                recording_id: "A".to_string(),
            })
            .unwrap();
        manager.config.clear();

        let generation = manager.generation;
        manager.tasks.clear();
        manager
            .run_push_table_request_task(table(502, 1, 1), generation)
            .unwrap();

        assert!(manager.tasks.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_paused_chain_keeps_ticking() {
        let (tx, mut rx) = request_channel();
        let (mut manager, _instructions) = idle_manager(HashMap::from([(gateway(502), tx)]));

        manager
            .run_instruction(Instruction::ResetRequests {
                tables: tables(&[table(502, 1, 1)]),
                recording_id: "A".to_string(),
            })
            .unwrap();
        manager.run_instruction(Instruction::Stop).unwrap();

        let generation = manager.generation;
        manager.tasks.clear();
        manager
            .run_push_table_request_task(table(502, 1, 1), generation)
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(manager.tasks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_emits_immediately_and_every_interval() {
        let (tx, mut rx) = request_channel();
        let handle = start_manager(HashMap::from([(gateway(502), tx)]), settings());
        let t = table(502, 1, 1);

        let start = Instant::now();
        handle.reset_requests(tables(&[t.clone()]), "X").unwrap();

        let first = recv(&mut rx).await;
        let first_at = Instant::now();
        assert_eq!(first, ReadTableMsg { table_addr: t.clone(), recording_id: "X".to_string() });
        assert!(first_at - start < Duration::from_millis(50));

        let second = recv(&mut rx).await;
        let second_at = Instant::now();
        assert_eq!(second, first);
        assert!(second_at - first_at >= INTERVAL);
        assert!(second_at - first_at < INTERVAL + Duration::from_millis(100));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_table_is_requested_with_recording_id() {
        let (tx, mut rx) = request_channel();
        let handle = start_manager(HashMap::from([(gateway(502), tx)]), settings());
        let t1 = table(502, 1, 1);
        let t2 = table(502, 2, 1);

        handle.reset_requests(tables(&[t1.clone(), t2.clone()]), "R1").unwrap();
        handle.resume_requests().unwrap();

        let mut first_seen = HashMap::new();
        let mut second_seen = HashMap::new();
        while second_seen.len() < 2 {
            let msg = recv(&mut rx).await;
            assert_eq!(msg.recording_id, "R1");
            let now = Instant::now();
            if let Some(first) = first_seen.get(&msg.table_addr) {
                assert!(now - *first >= INTERVAL);
                second_seen.insert(msg.table_addr.clone(), now);
            } else {
                first_seen.insert(msg.table_addr.clone(), now);
            }
        }

        assert!(first_seen.contains_key(&t1) && first_seen.contains_key(&t2));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_silences_and_resume_restarts() {
        let (tx, mut rx) = request_channel();
        let handle = start_manager(HashMap::from([(gateway(502), tx)]), settings());
        let t = table(502, 1, 1);

        handle.reset_requests(tables(&[t.clone()]), "R").unwrap();
        recv(&mut rx).await;

        handle.stop_requests().unwrap();
        sleep(INTERVAL * 6).await;
        assert!(drain(&mut rx).len() <= 1);

        sleep(INTERVAL * 6).await;
        assert!(drain(&mut rx).is_empty());
        assert!(!handle.status().sending_enabled);

        handle.resume_requests().unwrap();
        let msg = timeout(INTERVAL * 3, rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg, ReadTableMsg { table_addr: t, recording_id: "R".to_string() });

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disjoint_reset_switches_tables() {
        let (tx, mut rx) = request_channel();
        let handle = start_manager(HashMap::from([(gateway(502), tx)]), settings());
        let old = table(502, 1, 1);
        let new = table(502, 1, 2);

        handle.reset_requests(tables(&[old.clone()]), "A").unwrap();
        assert_eq!(recv(&mut rx).await.table_addr, old);

        handle.reset_requests(tables(&[new.clone()]), "B").unwrap();
        sleep(INTERVAL * 2).await;
        drain(&mut rx);

        sleep(INTERVAL * 4).await;
        let msgs = drain(&mut rx);
        assert!(msgs.len() >= 3);
        assert!(msgs
            .iter()
            .all(|m| m.table_addr == new && m.recording_id == "B"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_never_mixes_recordings_or_duplicates_chains() {
        let (tx, mut rx) = request_channel();
        let handle = start_manager(HashMap::from([(gateway(502), tx)]), settings());
        let kept = table(502, 1, 1);
        let added = table(502, 1, 2);

        handle.reset_requests(tables(&[kept.clone()]), "A").unwrap();
        recv(&mut rx).await;

        handle.reset_requests(tables(&[kept.clone(), added.clone()]), "B").unwrap();
        let mut msg = recv(&mut rx).await;
        while msg.recording_id != "B" {
            msg = recv(&mut rx).await;
        }

        sleep(INTERVAL * 4).await;
        let msgs = drain(&mut rx);
        assert!(msgs.iter().all(|m| m.recording_id == "B"));

        let kept_count = msgs.iter().filter(|m| m.table_addr == kept).count();
        assert!((3..=5).contains(&kept_count), "kept table requested {} times", kept_count);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_gateway_is_refused() {
        let (tx, mut rx) = request_channel();
        let handle = start_manager(HashMap::from([(gateway(502), tx)]), settings());
        let t = table(502, 1, 1);

        let result = handle.reset_requests(tables(&[table(9999, 1, 1)]), "bad");
        assert!(matches!(result, Err(ModbusError::ConfigError(_))));

        handle.reset_requests(tables(&[t.clone()]), "A").unwrap();
        recv(&mut rx).await;

        // Bypass the handle's own check; the loop refuses it and keeps polling.
        handle
            .submit(Instruction::ResetRequests {
                tables: tables(&[table(9999, 1, 1)]),
                recording_id: "B".to_string(),
            })
            .unwrap();

        sleep(INTERVAL * 4).await;
        let msgs = drain(&mut rx);
        assert!(!msgs.is_empty());
        assert!(msgs.iter().all(|m| m.table_addr == t && m.recording_id == "A"));
        assert_eq!(handle.status().recording_id.as_deref(), Some("A"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_does_not_stop_other_gateways() {
        let (tx1, rx1) = request_channel();
        let (tx2, mut rx2) = request_channel();
        drop(rx1);

        let handle = start_manager(
            HashMap::from([(gateway(502), tx1), (gateway(503), tx2)]),
            settings(),
        );

        handle
            .reset_requests(tables(&[table(502, 1, 1), table(503, 1, 1)]), "R")
            .unwrap();

        sleep(INTERVAL * 4).await;
        assert!(drain(&mut rx2).len() >= 4);
        assert!(!handle.status().degraded);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_faults_mark_degraded() {
        let (tx, rx) = request_channel();
        drop(rx);
        let handle = start_manager(HashMap::from([(gateway(502), tx)]), settings());

        handle.reset_requests(tables(&[table(502, 1, 1)]), "R").unwrap();
        sleep(INTERVAL * 3 + Duration::from_millis(100)).await;

        let status = handle.status();
        assert!(status.degraded);
        assert!(status.consecutive_faults >= 3);
        // Still running and accepting instructions.
        handle.stop_requests().unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_queues() {
        let (tx, mut rx) = request_channel();
        let handle = start_manager(HashMap::from([(gateway(502), tx)]), settings());

        handle.shutdown().await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
