pub mod messages;
pub mod reading_writer;
pub mod system_control;
pub mod table_reader;
pub mod table_request_manager;

pub use messages::{Instruction, ReadTableMsg, TableReading};
pub use reading_writer::ReadingWriter;
pub use system_control::SystemControlService;
pub use table_reader::{reading_channel, ReadingReceiver, ReadingSender, TableReader};
pub use table_request_manager::{
    request_channel, start_manager, RequestReceiver, RequestSender, SchedulerHandle,
    SchedulerSettings, SchedulerStatus,
};
