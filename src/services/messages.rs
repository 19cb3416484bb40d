use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::devices::TableAddr;

/// Request for a reader to read one table, tagged with the recording that asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadTableMsg {
    pub table_addr: TableAddr,
    pub recording_id: String,
}

/// Control-plane commands consumed by the table request manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Replace the polled table set and the recording id, and start sending.
    ResetRequests {
        tables: HashSet<TableAddr>,
        recording_id: String,
    },
    Stop,
    Resume,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::ResetRequests { .. } => "ResetRequests",
            Instruction::Stop => "Stop",
            Instruction::Resume => "Resume",
        }
    }
}

/// Decoded values of (part of) one table read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableReading {
    pub table_addr: TableAddr,
    pub recording_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<u16, u64>,
}

impl TableReading {
    pub fn unix_timestamp(&self) -> i64 {
        self.timestamp.timestamp()
    }
}
