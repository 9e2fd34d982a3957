use crate::config::{Config, Environment};
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

#[derive(Parser, Debug, Clone)]
#[command(name = "corspx", about, version, long_about = None, propagate_version = true)]
pub struct CorspxArguments {
    #[arg(short = 'c', long = "config", help = "Path to the configuration file")]
    pub(crate) config_path: Option<String>,
    #[arg(short = 'v', long = "verbose", help = "Enable verbose logging")]
    pub(crate) verbose: bool,
    #[arg(short = 'w', long = "watch", help = "Watch the configuration file for changes")]
    pub(crate) watch_config: bool,
    #[arg(short = 'p', long = "port", help = "Listen port (overrides the configured value, not persisted)")]
    pub(crate) port: Option<u16>,
    #[arg(short = 'u', long = "upstream", help = "Upstream base URL (overrides the configured value, not persisted)")]
    pub(crate) upstream: Option<String>,
    #[arg(short = 'e', long = "env", value_enum, help = "Environment selecting the CORS policy (overrides CORSPX_ENV)")]
    pub(crate) environment: Option<Environment>,
    #[command(subcommand)]
    pub(crate) command: Option<CorspxCommands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CorspxCommands {
    #[clap(name = "config", about = "Manage the configuration file")]
    Config {
        #[clap(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    #[clap(name = "show", about = "Show the current configuration")]
    Show,
    #[clap(name = "show-path", about = "Show the path to the configuration file")]
    ShowPath,
    #[clap(name = "upstream", about = "Set the upstream base URL requests are forwarded to")]
    Upstream { url: String },
    #[clap(name = "port", about = "Set the listen port")]
    Port { port: u16 },
    #[clap(name = "policy", about = "Show a named CORS policy, or list policy names")]
    Policy { name: Option<String> },
}

impl CorspxArguments {
    pub async fn handle_arguments(&self) -> Result<()> {
        if let Some(command) = &self.command {
            let config_path =
                self.config_path.clone().unwrap_or_else(|| crate::config::DEFAULT_CONFIG_PATH.to_string());
            let mut config = Config::try_load(&config_path).await?;
            match command {
                CorspxCommands::Config { command } => match command {
                    ConfigCommands::Show => {
                        println!("{}", config);
                    }
                    ConfigCommands::ShowPath => {
                        println!("{}", config.get_path().to_string_lossy())
                    }
                    ConfigCommands::Upstream { url } => {
                        config.set_upstream(url.clone());
                        config.save().await?;
                        info!("Updated upstream: {}", url);
                    }
                    ConfigCommands::Port { port } => {
                        config.set_listen_port(*port);
                        config.save().await?;
                        info!("Updated listen port: {}", port);
                    }
                    ConfigCommands::Policy { name: Some(name) } => {
                        if let Some(policy) = config.lookup_policy(name) {
                            println!("{}", serde_json::to_string_pretty(policy)?);
                        } else {
                            error!("Policy not found: {}", name);
                        }
                    }
                    ConfigCommands::Policy { name: None } => {
                        for name in config.get_policies().keys() {
                            println!("{}", name);
                        }
                    }
                },
            }
            // Exit after the command has been executed
            std::process::exit(0);
        }
        Ok(())
    }
}
