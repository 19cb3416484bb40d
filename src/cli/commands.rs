use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::devices::{DeviceAddr, GatewayAddr, TableAddr, TableCatalog};
use crate::modbus::TcpModbusClient;
use crate::output::formatter_for;
use crate::services::{SystemControlService, TableReader};
#[cfg(feature = "sqlite")]
use crate::storage::SqliteManager;
use crate::utils::error::ModbusError;

pub fn build_cli() -> Command {
    let cli = Command::new("table_poller")
        .version(crate::VERSION)
        .about("Polls register tables from Modbus TCP gateways")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .default_value("config/table_poller.toml")
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .global(true)
                .help("Polling interval per table in milliseconds"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .subcommand(
            Command::new("run")
                .about("Poll every configured table until Ctrl+C")
                .arg(
                    Arg::new("recording-id")
                        .long("recording-id")
                        .help("Recording id to tag readings with (default: random UUID)"),
                ),
        )
        .subcommand(
            Command::new("read-table")
                .about("Read one table once and print it")
                .arg(
                    Arg::new("gateway")
                        .long("gateway")
                        .required(true)
                        .value_parser(value_parser!(GatewayAddr))
                        .help("Gateway address as host:port"),
                )
                .arg(
                    Arg::new("unit")
                        .long("unit")
                        .required(true)
                        .value_parser(value_parser!(u8))
                        .help("Unit id behind the gateway"),
                )
                .arg(
                    Arg::new("table")
                        .long("table")
                        .required(true)
                        .value_parser(value_parser!(u32))
                        .help("Configured table id"),
                ),
        )
        .subcommand(Command::new("show-config").about("Print the effective configuration"))
        .subcommand(
            Command::new("init-config")
                .about("Write a sample configuration file")
                .arg(Arg::new("path").required(true).help("Destination path")),
        );

    #[cfg(feature = "sqlite")]
    let cli = cli.subcommand(
        Command::new("history")
            .about("Show stored readings from the database")
            .arg(
                Arg::new("recording-id")
                    .long("recording-id")
                    .help("Only readings of this recording, oldest first"),
            )
            .arg(
                Arg::new("limit")
                    .short('n')
                    .long("limit")
                    .default_value("20")
                    .value_parser(value_parser!(i64).range(1..))
                    .help("Maximum number of rows to print"),
            ),
    );

    cli
}

/// Runs one-shot subcommands. Returns `false` when the caller should start polling.
pub async fn handle_subcommands(matches: &ArgMatches, config: &Config) -> Result<bool, ModbusError> {
    if let Some(matches) = matches.subcommand_matches("read-table") {
        info!("🔍 Executing read-table command...");
        read_table_once(matches, config).await?;
        return Ok(true);
    }

    #[cfg(feature = "sqlite")]
    {
        if let Some(matches) = matches.subcommand_matches("history") {
            show_history(matches, config).await?;
            return Ok(true);
        }
    }

    if matches.subcommand_matches("show-config").is_some() {
        println!("{}", toml::to_string_pretty(config)?);
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("init-config") {
        let path = matches
            .get_one::<String>("path")
            .ok_or_else(|| ModbusError::ConfigError("Missing config path".to_string()))?;
        Config::sample().save_to_file(path)?;
        println!("✅ Sample configuration written to {}", path);
        return Ok(true);
    }

    Ok(false)
}

async fn read_table_once(matches: &ArgMatches, config: &Config) -> Result<(), ModbusError> {
    let (gateway, unit, table_id) = match (
        matches.get_one::<GatewayAddr>("gateway"),
        matches.get_one::<u8>("unit"),
        matches.get_one::<u32>("table"),
    ) {
        (Some(gateway), Some(unit), Some(table)) => (gateway.clone(), *unit, *table),
        _ => {
            return Err(ModbusError::ConfigError(
                "read-table needs --gateway, --unit and --table".to_string(),
            ))
        }
    };

    let catalog = Arc::new(TableCatalog::from_configs(&config.tables)?);
    let client = TcpModbusClient::new(gateway.clone(), config.reader.register_kind)
        .with_connect_timeout(Duration::from_millis(config.reader.connect_timeout_ms))
        .with_io_timeout(Duration::from_millis(config.reader.timeout_ms));
    let reader = TableReader::new(gateway.clone(), Arc::new(client), catalog, &config.reader);

    let table = TableAddr::new(DeviceAddr::new(gateway, unit), table_id);
    let readings = reader.read_table(&table, "one-shot").await?;

    let formatter = formatter_for(&config.output.format)?;
    print!("{}", formatter.format_header());
    println!("{}", formatter.format_readings(&readings));
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn show_history(matches: &ArgMatches, config: &Config) -> Result<(), ModbusError> {
    let database = config.output.database.clone().unwrap_or_default();
    let limit = matches.get_one::<i64>("limit").copied().unwrap_or(20);
    let recording_id = matches.get_one::<String>("recording-id").map(String::as_str);

    let manager = SqliteManager::new(&database).await?;
    let rows = match recording_id {
        Some(id) => manager.get_recording_readings(id, Some(limit)).await?,
        None => manager.get_recent_readings(limit, 0).await?,
    };
    let stats = manager.get_stats(recording_id).await?;
    manager.close().await;

    println!(
        "📊 {} stored value(s) across {} recording(s) and {} table(s)",
        stats.total_readings, stats.recordings, stats.tables
    );
    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}

/// Polls every configured table under one recording until Ctrl+C.
/// Returns how many readings were written.
pub async fn run_recording(config: Config, recording_id: Option<String>) -> Result<u64, ModbusError> {
    let mut service = SystemControlService::start(config).await?;
    let recording_id = service.start_recording(recording_id)?;
    info!("▶️  Recording {} running, press Ctrl+C to stop", recording_id);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut status_timer = tokio::time::interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                info!("🛑 Ctrl+C received");
                break;
            }
            _ = status_timer.tick() => {
                let status = service.status();
                info!(
                    "📊 Status: {} table(s), sending {}, degraded {}",
                    status.table_count, status.sending_enabled, status.degraded
                );
            }
        }
    }

    let written = service.shutdown().await?;
    info!("👋 Recording {} finished with {} reading(s)", recording_id, written);
    Ok(written)
}
