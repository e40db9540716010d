use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use query_guard::config::{AppConfig, ConfigLoader, DynamicConfigManager};
use query_guard::logging::{init_logging, LogConfig};
use query_guard::security::query::{
    ChannelSink, MemorySink, QuerySecurityAnalyzer, RequestContext, TracingBackend,
};
use query_guard::service;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file (TOML, YAML or JSON)
    #[clap(short, long, env = "QUERY_GUARD_CONFIG")]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP check service (default)
    Serve {
        /// Address to bind, overrides `server.bind_addr`
        #[clap(short, long)]
        bind: Option<String>,
    },
    /// Validate the configuration and compile all signatures
    Validate,
    /// Analyze a single query and print the result as JSON
    Check {
        /// Query document
        query: String,
        /// Variables as a JSON object
        #[clap(long)]
        variables: Option<String>,
        /// Source identity to attribute the request to
        #[clap(long, default_value = "cli")]
        source: String,
    },
}

fn load_config(path: Option<&str>) -> Result<AppConfig> {
    ConfigLoader::new()
        .load_from_file(path)
        .load_from_env()
        .build()
        .with_context(|| {
            format!(
                "Failed to load configuration from {}",
                path.unwrap_or("<default locations>")
            )
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => serve(config, args.config, bind).await,
        Commands::Validate => {
            QuerySecurityAnalyzer::new(config.engine, Arc::new(MemorySink::new()))
                .context("Engine configuration is invalid")?;
            println!("Configuration is valid");
            Ok(())
        }
        Commands::Check {
            query,
            variables,
            source,
        } => {
            let variables = variables
                .map(|v| serde_json::from_str(&v))
                .transpose()
                .context("Variables must be valid JSON")?;
            let analyzer =
                QuerySecurityAnalyzer::new(config.engine, Arc::new(MemorySink::new()))?;
            let result = analyzer.analyze_text(&query, variables, &RequestContext::new(source));
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

async fn serve(config: AppConfig, config_path: Option<String>, bind: Option<String>) -> Result<()> {
    let _log_guard = init_logging(&LogConfig::from(&config.logging))?;

    info!("Starting query-guard {}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let sink_shutdown = CancellationToken::new();

    let (sink, sink_handle) = ChannelSink::spawn(
        TracingBackend,
        config.server.sink_capacity,
        sink_shutdown.clone(),
    );
    let analyzer = Arc::new(QuerySecurityAnalyzer::new(
        config.engine.clone(),
        Arc::new(sink),
    )?);

    let manager = Arc::new(DynamicConfigManager::new(config.clone(), config_path));
    let watcher = analyzer
        .clone()
        .watch_config(manager.clone(), shutdown.clone());
    let sweeper = analyzer
        .tracker()
        .clone()
        .spawn_sweeper(config.engine.threat.sweep_interval(), shutdown.clone());

    spawn_reload_on_hangup(manager, shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let bind = bind.unwrap_or_else(|| config.server.bind_addr.clone());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    let served = service::serve(listener, analyzer.clone(), shutdown.clone()).await;
    shutdown.cancel();

    for (name, handle) in [("config watcher", watcher), ("sweeper", sweeper)] {
        if let Err(e) = handle.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }

    // 未送信のインシデントを書き出してから終了する
    sink_shutdown.cancel();
    if let Err(e) = sink_handle.await {
        warn!("Incident sink task ended abnormally: {}", e);
    }

    served
}

#[cfg(unix)]
fn spawn_reload_on_hangup(manager: Arc<DynamicConfigManager>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("SIGHUP reload unavailable: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match manager.reload() {
                        Ok(version) => info!("Configuration reloaded (version {})", version),
                        Err(e) => error!("Configuration reload failed: {}", e),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_manager: Arc<DynamicConfigManager>, _shutdown: CancellationToken) {}
