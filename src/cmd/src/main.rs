use anyhow::Context;
use clap::{Parser, Subcommand};
use proxy::backend::ServerInfo;
use proxy::diff::config::DiffConfig;
use proxy::diff::repl::AdminReplicaControl;
use proxy::diff::router::{DiffRouter, Summary};
use proxy::service::{ServiceControl, SessionResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "diff-proxy", about = "MariaDB comparison router control")]
struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: PathBuf,

    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Subcommand, Debug, Clone)]
enum AdminCommand {
    /// Suspend sessions, verify replication and start comparing.
    Start,
    /// Stop a running or starting comparison.
    Stop,
    /// Show the lifecycle state and session counts.
    Status,
    /// Render the accumulated statistics.
    Summary {
        /// Also persist the summary files under the data directory.
        #[arg(long)]
        save: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct ServerEntry {
    name: String,
    address: String,
    #[serde(default)]
    proxy_protocol: bool,
}

/// On-disk configuration: the router options plus the server inventory and
/// the administrative credentials.
#[derive(Debug, Clone, Deserialize)]
struct ProxyConfig {
    #[serde(flatten)]
    diff: DiffConfig,
    servers: Vec<ServerEntry>,
    user: String,
    #[serde(default)]
    password: String,
}

/// The surrounding service is managed elsewhere; session suspension and
/// target rewiring are reported for the operator to act on.
struct UnmanagedService {
    name: String,
    children: Vec<String>,
}

#[async_trait::async_trait]
impl ServiceControl for UnmanagedService {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<String> {
        self.children.clone()
    }

    async fn suspend_sessions(&self) -> SessionResult {
        SessionResult::default()
    }

    async fn resume_sessions(&self) -> SessionResult {
        SessionResult::default()
    }

    async fn restart_sessions(&self) -> SessionResult {
        SessionResult::default()
    }

    async fn suspended_sessions(&self) -> SessionResult {
        SessionResult::default()
    }

    async fn rewire(&self, from: &str, to: &str) -> bool {
        warn!("service '{}' must be rewired from '{from}' to '{to}'", self.name);
        true
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let log_level_string = args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("DIFF_PROXY")
        .build()?;

    runtime.block_on(async move {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("could not read '{}'", args.config.display()))?;
        let config: ProxyConfig = serde_json::from_str(&raw)
            .with_context(|| format!("could not parse '{}'", args.config.display()))?;

        let servers: Vec<ServerInfo> = config
            .servers
            .iter()
            .map(|entry| {
                let mut server = ServerInfo::new(entry.name.clone(), entry.address.clone());
                server.proxy_protocol = entry.proxy_protocol;
                server
            })
            .collect();

        let service = Arc::new(UnmanagedService {
            name: config.diff.service.clone(),
            children: servers.iter().map(|s| s.name.clone()).collect(),
        });
        let repl = Arc::new(AdminReplicaControl::new(
            servers.clone(),
            config.user.clone(),
            config.password.clone(),
        ));

        let router = DiffRouter::new(config.diff, servers, service, repl)
            .context("could not set up the comparison router")?;

        info!("running {:?} against service '{}'", args.command, router.config().service);
        let output = match args.command {
            AdminCommand::Start => router.start().await?,
            AdminCommand::Stop => router.stop().await?,
            AdminCommand::Status => router.status().await,
            AdminCommand::Summary { save } => {
                router.summary(if save { Summary::Both } else { Summary::Return })?
            }
        };
        println!("{output:#}");
        Ok(())
    })
}
