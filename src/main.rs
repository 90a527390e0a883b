//! Scriptbox runner
//!
//! Reads one execution request as JSON, runs it, and prints the response
//! as JSON on stdout. Logs go to stderr.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use scriptbox::{ExecutionRequest, Sandbox, SandboxConfig};

/// Run a chat script in the sandbox
#[derive(Debug, Parser)]
#[command(name = "scriptbox", version, about)]
struct Args {
    /// Request JSON file; reads stdin when absent or "-"
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Script file, replacing the request's own script
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Sandbox config JSON file
    #[arg(short, long, env = "SCRIPTBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Script deadline in milliseconds
    #[arg(long, env = "SCRIPTBOX_DEADLINE_MS")]
    deadline_ms: Option<u64>,

    /// Do not register get/post
    #[arg(long)]
    no_network: bool,
}

impl Args {
    fn sandbox_config(&self) -> anyhow::Result<SandboxConfig> {
        let mut config = match &self.config {
            Some(path) => SandboxConfig::from_json_file(path)?,
            None => SandboxConfig::default(),
        };
        if let Some(deadline_ms) = self.deadline_ms {
            config.deadline_ms = deadline_ms;
        }
        if self.no_network {
            config.allow_network = false;
        }
        Ok(config)
    }

    fn execution_request(&self) -> anyhow::Result<ExecutionRequest> {
        let text = match self.request.as_deref() {
            Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
                .with_context(|| format!("could not read request {}", path.display()))?,
            _ => {
                let mut text = String::new();
                std::io::stdin()
                    .read_to_string(&mut text)
                    .context("could not read request from stdin")?;
                text
            }
        };
        let mut request: ExecutionRequest =
            serde_json::from_str(&text).context("invalid request JSON")?;

        if let Some(path) = &self.script {
            request.script = std::fs::read_to_string(path)
                .with_context(|| format!("could not read script {}", path.display()))?;
        }
        Ok(request)
    }
}

fn log_proxy() {
    let proxy = ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"]
        .into_iter()
        .find(|name| std::env::var_os(name).is_some_and(|value| !value.is_empty()));
    match proxy {
        Some(name) => info!("outbound requests use the proxy from {name}"),
        None => debug!("no proxy configured"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = args.sandbox_config()?;
    let request = args.execution_request()?;

    info!(
        "scriptbox v{} (deadline {}ms, network {})",
        scriptbox::VERSION,
        config.deadline_ms,
        if config.allow_network { "on" } else { "off" }
    );
    if config.allow_network {
        log_proxy();
    }

    let response = Sandbox::new(config).execute(request).await;
    println!("{}", serde_json::to_string(&response)?);

    Ok(())
}
