mod command_line_arguments;
mod config;
mod cors;
mod reverse_proxy;

use crate::command_line_arguments::CorspxArguments;
use crate::config::{Config, Environment};
use anyhow::Result;
use clap::Parser;
use log::{LevelFilter, info, trace};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CorspxArguments::parse();
    pretty_env_logger::env_logger::builder()
        .format_timestamp(None)
        .filter_level(if args.verbose { LevelFilter::Trace } else { LevelFilter::Info })
        .init();

    // Handle command line arguments
    args.handle_arguments().await?;

    info!("Starting corspx");
    trace!("Arguments: {:#?}", args);

    let config_path = args.config_path.clone().unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());
    let config = Config::try_load(&config_path).await?;
    Config::apply_overrides(args.port, args.upstream.clone()).await;
    if args.watch_config {
        config.watch_config_file();
    }

    Environment::set_active(Environment::resolve(args.environment));

    reverse_proxy::start_rp_server().await?;

    Ok(())
}
