mod config;
mod error;
mod framing;
mod proto_utils;
mod proxy;
#[cfg(test)]
mod test_support;
mod upstream;

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Settings, load_config};
use crate::proxy::DnsProxy;
use crate::upstream::Upstream;

#[derive(Parser, Debug)]
#[command(author, version, about = "Plain DNS (UDP/TCP) to DNS-over-TLS forwarding proxy", long_about = None)]
struct Args {
    /// JSON settings file; flags below override it
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Enable the TCP listener
    #[arg(long = "tcp", action = ArgAction::Set)]
    tcp: Option<bool>,
    /// Host to listen on for TCP
    #[arg(long = "host-tcp")]
    host_tcp: Option<String>,
    /// Port to listen on for TCP
    #[arg(long = "port-tcp")]
    port_tcp: Option<u16>,
    /// Enable the UDP listener
    #[arg(long = "udp", action = ArgAction::Set)]
    udp: Option<bool>,
    /// Host to listen on for UDP
    #[arg(long = "host-udp")]
    host_udp: Option<String>,
    /// Port to listen on for UDP
    #[arg(long = "port-udp", alias = "port-up")]
    port_udp: Option<u16>,
    /// Upstream DoT resolver, host:port
    #[arg(long = "upstream", alias = "cloudflare-dot-addr")]
    upstream: Option<String>,
    /// Name to verify the upstream certificate against
    #[arg(long = "tls-name")]
    tls_name: Option<String>,
    /// PEM file with the CA certificates to trust instead of the built-in roots
    #[arg(long = "ca-file")]
    ca_file: Option<PathBuf>,
    /// Upstream round-trip timeout in milliseconds, 0 disables it
    #[arg(long = "upstream-timeout-ms")]
    upstream_timeout_ms: Option<u64>,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

impl Args {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut cfg = match &self.config {
            Some(path) => load_config(path).context("load config")?,
            None => Settings::default(),
        };

        if let Some(v) = self.tcp {
            cfg.tcp.enabled = v;
        }
        if let Some(v) = &self.host_tcp {
            cfg.tcp.host = v.clone();
        }
        if let Some(v) = self.port_tcp {
            cfg.tcp.port = v;
        }
        if let Some(v) = self.udp {
            cfg.udp.enabled = v;
        }
        if let Some(v) = &self.host_udp {
            cfg.udp.host = v.clone();
        }
        if let Some(v) = self.port_udp {
            cfg.udp.port = v;
        }
        if let Some(v) = &self.upstream {
            cfg.upstream.addr = v.clone();
        }
        if let Some(v) = &self.tls_name {
            cfg.upstream.tls_name = Some(v.clone());
        }
        if let Some(v) = &self.ca_file {
            cfg.upstream.ca_file = Some(v.clone());
        }
        if let Some(v) = self.upstream_timeout_ms {
            cfg.upstream.timeout_ms = v;
        }

        cfg.validate().context("invalid settings")?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = args.settings()?;
    let upstream = Upstream::from_settings(&cfg.upstream).context("build upstream")?;
    let proxy = DnsProxy::new(upstream);
    info!(
        upstream = %proxy.upstream().addr(),
        tls_name = %proxy.upstream().tls_name(),
        "using upstream dot resolver"
    );

    let shutdown = CancellationToken::new();
    let mut listeners = JoinSet::new();

    if cfg.tcp.enabled {
        let proxy = proxy.clone();
        let token = shutdown.clone();
        let listen = cfg.tcp.clone();
        listeners.spawn(async move {
            proxy
                .listen_tcp(token, &listen.host, listen.port)
                .await
                .context("tcp listener")
        });
    }
    if cfg.udp.enabled {
        let proxy = proxy.clone();
        let token = shutdown.clone();
        let listen = cfg.udp.clone();
        listeners.spawn(async move {
            proxy
                .listen_udp(token, &listen.host, listen.port)
                .await
                .context("udp listener")
        });
    }

    let mut failed = false;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal, shutting down");
        }
        Some(res) = listeners.join_next() => {
            // a listener only returns on its own when binding failed
            failed |= report(res);
        }
    }

    shutdown.cancel();
    while let Some(res) = listeners.join_next().await {
        failed |= report(res);
    }

    if failed {
        anyhow::bail!("a listener failed");
    }
    Ok(())
}

fn report(res: Result<anyhow::Result<()>, tokio::task::JoinError>) -> bool {
    match res {
        Ok(Ok(())) => false,
        Ok(Err(err)) => {
            error!(error = %format!("{err:#}"), "listener exited with error");
            true
        }
        Err(err) => {
            error!(error = %err, "listener task aborted");
            true
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "install ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "install sigterm handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
