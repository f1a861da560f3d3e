use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use skiff_config::Config;
use skiff_core::{Artifact, Output, RunOptions, SkiffError};
use skiff_runner::Runner;

#[derive(Parser, Debug)]
#[command(name = "skiff", version, about = "Container dev loop for Kubernetes")]
struct Cli {
    /// Path to the skiff configuration file
    #[arg(
        short = 'f',
        long = "filename",
        global = true,
        default_value = "skiff.yaml"
    )]
    filename: PathBuf,

    /// Kubernetes namespace (default: current context)
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Kubernetes context to deploy to
    #[arg(long = "kube-context", global = true)]
    kube_context: Option<String>,

    /// Force a literal tag, overriding the configured tag policy
    #[arg(long, global = true)]
    tag: Option<String>,

    /// Only watch artifacts whose image name contains one of these
    #[arg(long = "watch", global = true)]
    watch: Vec<String>,

    /// Stream container logs after deploying
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    tail: bool,

    /// Ring the terminal bell when a round completes
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    notification: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the configured artifacts
    Build,
    /// Build and deploy once
    Run,
    /// Watch sources and continuously build and deploy
    Dev,
    /// Delete everything the deployer applied
    Delete,
    /// Print the version
    Version,
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

fn load(opts: &RunOptions) -> Result<(Config, Vec<Artifact>)> {
    let cfg = Config::load(&opts.config_file)
        .with_context(|| format!("loading configuration {}", opts.config_file.display()))?;
    let artifacts = cfg.artifacts()?;
    Ok((cfg, artifacts))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Version) {
        println!("skiff {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let opts = RunOptions {
        config_file: cli.filename.clone(),
        namespace: cli.namespace.clone(),
        kube_context: cli.kube_context.clone(),
        custom_tag: cli.tag.clone(),
        watch: cli.watch.clone(),
        tail: cli.tail,
        notification: cli.notification,
    };

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            let _ = signal::ctrl_c().await;
            info!("interrupt received; shutting down");
            token.cancel();
        });
    }

    match cli.command {
        Commands::Build => {
            let (cfg, artifacts) = load(&opts)?;
            let runner = Runner::for_config(opts, &cfg, Output::stdout())?;
            runner.build_artifacts(&token, &artifacts).await?;
        }
        Commands::Run => {
            let (cfg, artifacts) = load(&opts)?;
            let mut runner = Runner::for_config(opts, &cfg, Output::stdout())?;
            runner.run(&token, &artifacts).await?;
        }
        Commands::Dev => loop {
            // A configuration change ends the session with a sentinel; the
            // loop reloads and starts over.
            let (cfg, artifacts) = load(&opts)?;
            let mut runner = Runner::for_config(opts.clone(), &cfg, Output::stdout())?;
            match runner.dev(&token, &artifacts).await {
                Ok(()) => break,
                Err(e) if SkiffError::is_reload(&e) => {
                    info!("configuration changed; restarting dev session");
                    continue;
                }
                Err(e) => return Err(e),
            }
        },
        Commands::Delete => {
            let (cfg, _) = load(&opts)?;
            let runner = Runner::for_config(opts, &cfg, Output::stdout())?;
            runner.cleanup(&token).await?;
        }
        Commands::Version => unreachable!(),
    }

    Ok(())
}
