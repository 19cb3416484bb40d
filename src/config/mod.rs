pub mod settings;

pub use settings::{
    Config,
    DatabaseOutputConfig,
    DeviceConfig,
    GatewayConfig,
    OutputConfig,
    ReaderConfig,
    RegisterConfig,
    SchedulerConfig,
    TableConfig,
};
