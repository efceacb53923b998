use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::info;

use crate::agent::metrics::SystemMetricsCollector;
use crate::agent::AgentRuntime;
use crate::config::{Config, LoggingConfig, CONFIG};
use crate::error::DocSweepError;
use crate::relay::auth::TokenAuthenticator;
use crate::relay::hub::RelayHub;
use crate::server::{shutdown_signal, ControllerServer};

const LOG_FILE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 7;

#[derive(Parser)]
#[command(
    name = "docsweep",
    version,
    about = "docsweep: relay hub, desktop agent and document collection controller"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start the controller: HTTP API, scans and schedules (default if no command specified)
    Serve,
    /// Run the relay hub that agents and the controller connect to
    Hub,
    /// Run the desktop agent on this machine
    Agent,
}

impl Command {
    fn name(self) -> &'static str {
        match self {
            Command::Serve => "serve",
            Command::Hub => "hub",
            Command::Agent => "agent",
        }
    }
}

impl Cli {
    pub fn handle_command_line() -> Result<(), DocSweepError> {
        let args = Cli::parse();

        // Default to Serve if no command specified
        let command = args.command.unwrap_or(Command::Serve);

        let project_dirs = ProjectDirs::from("", "", "docsweep")
            .ok_or_else(|| DocSweepError::Error("Could not determine the data directory".to_string()))?;
        let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));
        let data_dir = project_dirs.data_local_dir();

        // Keeps the file writer alive until the command returns
        let _logger = Self::setup_logging(&config.logging, data_dir, command)?;
        info!("docsweep {} starting ({})", env!("CARGO_PKG_VERSION"), command.name());

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| DocSweepError::Error(format!("Failed to create runtime: {}", e)))?;

        match command {
            Command::Serve => rt.block_on(ControllerServer::new(config.clone(), data_dir.to_path_buf()).start()),
            Command::Hub => rt.block_on(Self::run_hub(config)),
            Command::Agent => rt.block_on(Self::run_agent(config)),
        }
    }

    fn setup_logging(
        logging: &LoggingConfig,
        data_dir: &Path,
        command: Command,
    ) -> Result<LoggerHandle, DocSweepError> {
        Logger::try_with_str(logging.spec())
            .and_then(|logger| {
                logger
                    .log_to_file(
                        FileSpec::default()
                            .directory(data_dir.join("logs"))
                            .basename("docsweep")
                            .discriminant(command.name()),
                    )
                    .duplicate_to_stderr(Duplicate::Info)
                    .rotate(
                        Criterion::Size(LOG_FILE_BYTES),
                        Naming::Timestamps,
                        Cleanup::KeepLogFiles(LOG_FILES_KEPT),
                    )
                    .format_for_files(flexi_logger::detailed_format)
                    .start()
            })
            .map_err(|e| DocSweepError::Error(format!("Failed to start logging: {}", e)))
    }

    async fn run_hub(config: &Config) -> Result<(), DocSweepError> {
        let hub_config = &config.hub;
        let addr: SocketAddr = format!("{}:{}", hub_config.host, hub_config.port)
            .parse()
            .map_err(|e| DocSweepError::Error(format!("Invalid address: {}", e)))?;

        let hub = RelayHub::new(
            TokenAuthenticator::new(hub_config.agent_token.clone(), hub_config.controller_token.clone()),
            Duration::from_secs(hub_config.registration_timeout_secs),
        );
        println!("docsweep hub listening on ws://{}/ws", addr);
        hub.serve(addr, shutdown_signal()).await?;
        info!("Hub stopped");
        Ok(())
    }

    async fn run_agent(config: &Config) -> Result<(), DocSweepError> {
        let agent = AgentRuntime::new(config.agent.clone(), Box::new(SystemMetricsCollector::for_host()));
        info!("[AGENT] Running as '{}' against {}", agent.hostname(), config.agent.hub_url);

        let token = agent.shutdown_token();
        tokio::spawn(async move {
            shutdown_signal().await;
            token.cancel();
        });

        agent.run().await;
        info!("[AGENT] Stopped");
        Ok(())
    }
}
