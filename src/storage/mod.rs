pub mod models;
pub mod sqlite_manager;

pub use models::{ReadingRow, ReadingStats};
pub use sqlite_manager::SqliteManager;
