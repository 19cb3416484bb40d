use std::collections::HashMap;

use crate::config::settings::TableConfig;
use crate::modbus::RegisterMap;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone)]
pub struct TableLayout {
    pub id: u32,
    pub name: String,
    pub registers: RegisterMap,
}

/// Register layouts of every known table, keyed by table id.
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    layouts: HashMap<u32, TableLayout>,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(tables: &[TableConfig]) -> Result<Self, ModbusError> {
        let mut catalog = Self::new();

        for table in tables {
            let registers = RegisterMap::new(
                table.registers.iter().map(|r| (r.address, r.width)),
            )
            .map_err(|e| ModbusError::ConfigError(format!("Table {}: {}", table.id, e)))?;

            catalog.insert(TableLayout {
                id: table.id,
                name: table.name.clone(),
                registers,
            })?;
        }

        Ok(catalog)
    }

    pub fn insert(&mut self, layout: TableLayout) -> Result<(), ModbusError> {
        if self.layouts.contains_key(&layout.id) {
            return Err(ModbusError::ConfigError(format!(
                "Table {} defined more than once",
                layout.id
            )));
        }
        self.layouts.insert(layout.id, layout);
        Ok(())
    }

    pub fn get(&self, table_id: u32) -> Option<&TableLayout> {
        self.layouts.get(&table_id)
    }

    pub fn contains(&self, table_id: u32) -> bool {
        self.layouts.contains_key(&table_id)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}
