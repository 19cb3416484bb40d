use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::services::messages::TableReading;

// One register value of one table reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ReadingRow {
    pub id: Option<i64>,
    pub recording_id: String,
    pub gateway_host: String,
    pub gateway_port: i64,
    pub unit: i64,
    pub table_id: i64,
    pub register_addr: i64,
    pub value: i64,             // u64 bit pattern, see `value()`
    pub unix_timestamp: i64,
}

impl ReadingRow {
    pub fn from_reading(reading: &TableReading) -> Vec<Self> {
        let table = &reading.table_addr;
        reading
            .values
            .iter()
            .map(|(&register, &value)| Self {
                id: None,
                recording_id: reading.recording_id.clone(),
                gateway_host: table.gateway_addr().host.clone(),
                gateway_port: i64::from(table.gateway_addr().port),
                unit: i64::from(table.unit()),
                table_id: i64::from(table.table_id),
                register_addr: i64::from(register),
                value: value as i64,
                unix_timestamp: reading.unix_timestamp(),
            })
            .collect()
    }

    pub fn value(&self) -> u64 {
        self.value as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReadingStats {
    pub total_readings: i64,
    pub recordings: i64,
    pub tables: i64,
    pub latest_timestamp: Option<i64>,
    pub earliest_timestamp: Option<i64>,
}
