mod config;
mod dispatch;
mod expr;
mod metrics;
mod moderation;
mod openai;
mod provider;
mod token;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::dispatch::{DispatchService, router};
use crate::metrics::Metrics;
use crate::provider::HttpClients;
use crate::upstream::registry::Registry;

#[derive(Parser, Debug)]
#[command(name = "llm-dispatcher")]
#[command(about = "Dispatching reverse proxy for OpenAI-compatible LLM APIs", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    conf: PathBuf,
    /// Validate the configuration, print the registry, and exit
    #[arg(long)]
    test: bool,
    /// Print the upstreams that would serve the given model, then exit
    #[arg(long, value_name = "MODEL")]
    eval: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = Arc::new(config::load_config(&cli.conf)?);

    // RUST_LOG 优先；否则由配置里的 debug 决定日志级别。
    let default_level = if conf.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let clients = HttpClients::build(&conf.socks5)?;
    let registry = Arc::new(Registry::build(&conf, clients.clone())?);

    if cli.test {
        registry.print();
        return Ok(());
    }

    if let Some(model) = cli.eval.as_deref() {
        println!("\n---------------------- Eval ----------------------\n");
        registry.eval(model);
        return Ok(());
    }

    ensure!(!conf.listen.is_empty(), "listen address is required");
    let listen = if conf.listen.starts_with(':') {
        format!("0.0.0.0{}", conf.listen)
    } else {
        conf.listen.clone()
    };
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {}", conf.listen))?;

    let metrics = Arc::new(Metrics::default());
    let service = DispatchService::new(conf, registry, &clients, metrics);
    let app = router(service);

    tracing::info!("llm-dispatcher listening on http://{addr}");
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutting down");
}
