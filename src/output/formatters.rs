use chrono::Utc;
use serde_json::Value;

use crate::services::messages::TableReading;
use crate::utils::error::ModbusError;

pub trait DataFormatter: Send + Sync {
    fn format_reading(&self, reading: &TableReading) -> String;
    fn format_header(&self) -> String;

    fn format_readings(&self, readings: &[TableReading]) -> String {
        readings
            .iter()
            .map(|reading| self.format_reading(reading))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn name(&self) -> &str;
}

/// Picks a formatter by its configured name.
pub fn formatter_for(format: &str) -> Result<Box<dyn DataFormatter>, ModbusError> {
    match format.to_ascii_lowercase().as_str() {
        "json" => Ok(Box::new(JsonFormatter)),
        "csv" => Ok(Box::new(CsvFormatter)),
        "console" | "text" => Ok(Box::new(ConsoleFormatter)),
        other => Err(ModbusError::ConfigError(format!("Unknown output format '{}'", other))),
    }
}

pub struct ConsoleFormatter;

impl DataFormatter for ConsoleFormatter {
    fn format_reading(&self, reading: &TableReading) -> String {
        let mut output = format!(
            "🔹 {} [{}] @ {}\n",
            reading.table_addr,
            reading.recording_id,
            reading.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")
        );

        for (register, value) in &reading.values {
            output.push_str(&format!("  0x{:04X}: {} (0x{:X})\n", register, value, value));
        }
        output
    }

    fn format_header(&self) -> String {
        format!("🚀 Table readings - {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }

    fn name(&self) -> &str {
        "console"
    }
}

pub struct JsonFormatter;

impl JsonFormatter {
    fn to_value(reading: &TableReading) -> Value {
        let values: serde_json::Map<String, Value> = reading
            .values
            .iter()
            .map(|(register, value)| (register.to_string(), Value::from(*value)))
            .collect();

        serde_json::json!({
            "gateway": reading.table_addr.gateway_addr().to_string(),
            "unit": reading.table_addr.unit(),
            "table_id": reading.table_addr.table_id,
            "recording_id": reading.recording_id,
            "timestamp": reading.unix_timestamp(),
            "values": values,
        })
    }
}

impl DataFormatter for JsonFormatter {
    fn format_reading(&self, reading: &TableReading) -> String {
        serde_json::to_string(&Self::to_value(reading)).unwrap_or_default()
    }

    fn format_readings(&self, readings: &[TableReading]) -> String {
        let readings: Vec<Value> = readings.iter().map(Self::to_value).collect();
        serde_json::to_string_pretty(&readings).unwrap_or_default()
    }

    fn format_header(&self) -> String {
        String::new() // JSON doesn't need headers
    }

    fn name(&self) -> &str {
        "json"
    }
}

pub struct CsvFormatter;

impl DataFormatter for CsvFormatter {
    // One row per register
    fn format_reading(&self, reading: &TableReading) -> String {
        let timestamp = reading.timestamp.to_rfc3339();
        reading
            .values
            .iter()
            .map(|(register, value)| {
                format!(
                    "{},{},{},{},{},{},{}",
                    reading.table_addr.gateway_addr(),
                    reading.table_addr.unit(),
                    reading.table_addr.table_id,
                    reading.recording_id,
                    register,
                    value,
                    timestamp
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn format_header(&self) -> String {
        "gateway,unit,table_id,recording_id,register,value,timestamp\n".to_string()
    }

    fn name(&self) -> &str {
        "csv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceAddr, GatewayAddr, TableAddr};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn reading() -> TableReading {
        TableReading {
            table_addr: TableAddr::new(DeviceAddr::new(GatewayAddr::new("10.0.0.2", 502), 3), 7),
            recording_id: "rec-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            values: BTreeMap::from([(0xC550, 0x0001_0002), (0xC552, 7)]),
        }
    }

    #[test]
    fn test_json_reading() {
        let text = JsonFormatter.format_reading(&reading());
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["gateway"], "10.0.0.2:502");
        assert_eq!(value["unit"], 3);
        assert_eq!(value["table_id"], 7);
        assert_eq!(value["recording_id"], "rec-1");
        assert_eq!(value["timestamp"], 1714564800);
        assert_eq!(value["values"]["50512"], 0x0001_0002);
    }

    #[test]
    fn test_csv_has_row_per_register() {
        let text = CsvFormatter.format_reading(&reading());
        let rows: Vec<&str> = text.lines().collect();

        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("10.0.0.2:502,3,7,rec-1,50512,65538,"));
        assert_eq!(CsvFormatter.format_header().trim().split(',').count(), 7);
    }

    #[test]
    fn test_console_shows_registers_in_hex() {
        let text = ConsoleFormatter.format_reading(&reading());
        assert!(text.contains("0xC550: 65538 (0x10002)"));
        assert!(text.contains("rec-1"));
    }

    #[test]
    fn test_formatter_for() {
        assert_eq!(formatter_for("JSON").unwrap().name(), "json");
        assert_eq!(formatter_for("csv").unwrap().name(), "csv");
        assert_eq!(formatter_for("console").unwrap().name(), "console");
        assert!(formatter_for("xml").is_err());
    }
}
