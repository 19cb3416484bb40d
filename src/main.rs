use anyhow::{Context, Result};
use log::{error, info};

use table_poller::cli::{build_cli, handle_subcommands, run_recording};
use table_poller::Config;

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    init_logging(matches.get_flag("verbose"));

    info!("🖥️  Table poller v{}", table_poller::VERSION);

    let config = Config::from_matches(&matches).context("Failed to load configuration")?;
    if let Err(e) = config.validate() {
        error!("❌ Invalid configuration: {}", e);
        return Err(e.into());
    }

    if handle_subcommands(&matches, &config).await? {
        return Ok(());
    }

    // `run`, or no subcommand at all
    let recording_id = matches
        .subcommand_matches("run")
        .and_then(|m| m.get_one::<String>("recording-id").cloned());

    run_recording(config, recording_id)
        .await
        .context("Polling stopped with an error")?;

    Ok(())
}
