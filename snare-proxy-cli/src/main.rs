mod console;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use snare_net::{CaMaterialPaths, LeafIssuer, TlsConfig, load_or_generate_ca};
use snare_proxy::{
    InterceptService, InterceptSettings, Proxy, ProxyConfig, ScopeFilter, ScopeRule,
    event_channel, event_request_modifier, event_response_modifier,
};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "snare", about = "Intercepting HTTP/HTTPS proxy")]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Root certificate (PEM); generated when missing
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Root private key (PEM); generated when missing
    #[arg(long)]
    key: Option<PathBuf>,

    #[arg(long)]
    intercept_requests: bool,

    #[arg(long)]
    intercept_responses: bool,

    /// Host wildcard to intercept; repeatable. Limits interception to scope.
    #[arg(long = "scope")]
    scope: Vec<String>,

    /// Skip certificate verification for upstream servers
    #[arg(long)]
    insecure_upstream: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = load_config(&cli)?;

    let paths = CaMaterialPaths::new(&config.tls.ca_cert_path, &config.tls.ca_key_path);
    let ca = load_or_generate_ca(&paths, &config.tls.ca_common_name).map_err(|err| err.to_string())?;
    let issuer = Arc::new(LeafIssuer::new(ca).map_err(|err| err.to_string())?);

    let mut settings = InterceptSettings {
        requests_enabled: config.intercept.requests_enabled,
        responses_enabled: config.intercept.responses_enabled,
        ..Default::default()
    };
    if config.intercept.in_scope_only {
        let scope = Arc::new(ScopeFilter::new(&config.scope.rules).map_err(|err| err.to_string())?);
        settings.request_filter = Some(scope.clone());
        settings.response_filter = Some(scope);
    }
    let intercept = Arc::new(InterceptService::new(settings));

    let (events_tx, mut events) = event_channel();
    let proxy = Proxy::builder(issuer)
        .tls_config(TlsConfig {
            allow_legacy: config.tls.allow_legacy,
        })
        .upstream_config(config.upstream.clone())
        .request_modifier(event_request_modifier(events_tx.clone()))
        .request_modifier(intercept.request_modifier())
        .response_modifier(event_response_modifier(events_tx))
        .response_modifier(intercept.response_modifier())
        .build()
        .map_err(|err| err.to_string())?;

    let addr = config.listen.socket_addr().map_err(|err| err.to_string())?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| format!("failed to bind {addr}: {err}"))?;
    info!(%addr, ca = %paths.cert_path.display(), "snare ready");

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            info!(
                exchange = %event.id,
                kind = ?event.kind,
                method = ?event.method,
                uri = ?event.uri,
                status = ?event.status,
                "exchange"
            );
        }
    });

    let console_service = intercept.clone();
    tokio::spawn(async move {
        let input = BufReader::new(tokio::io::stdin());
        if let Err(err) = console::run(&console_service, input, tokio::io::stdout()).await {
            info!(error = %err, "operator console closed");
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            signal.cancel();
        }
    });

    proxy
        .run(listener, shutdown)
        .await
        .map_err(|err| err.to_string())?;
    intercept.discard_all();

    Ok(())
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Config file first, then flags on top.
fn load_config(cli: &Cli) -> Result<ProxyConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
            toml::from_str::<ProxyConfig>(&text)
                .map_err(|err| format!("invalid config {}: {err}", path.display()))?
        }
        None => ProxyConfig::default(),
    };

    if let Some(addr) = cli.addr {
        config.listen.host = addr.ip().to_string();
        config.listen.port = addr.port();
    }
    if let Some(cert) = &cli.cert {
        config.tls.ca_cert_path = cert.clone();
    }
    if let Some(key) = &cli.key {
        config.tls.ca_key_path = key.clone();
    }
    if cli.intercept_requests {
        config.intercept.requests_enabled = true;
    }
    if cli.intercept_responses {
        config.intercept.responses_enabled = true;
    }
    if !cli.scope.is_empty() {
        config
            .scope
            .rules
            .extend(cli.scope.iter().map(ScopeRule::include_host));
        config.intercept.in_scope_only = true;
    }
    if cli.insecure_upstream {
        config.upstream.verify_tls = false;
    }

    Ok(config)
}
