//! The warp client: a name-driven split tunnel.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use warp_tunnel::protocols::{LocalProtocol, Socks5Protocol, SshProtocol, WireguardProtocol};
use warp_tunnel::{DEFAULT_MTU, DeviceIo, Protocol, Service, ServiceConfig};

mod config;

use config::ProtocolKind;

#[derive(Parser)]
#[command(author, version, about = "Name-driven split tunnel over a userspace TUN stack", long_about = None)]
struct Cli {
    /// Plain console logging; exits on SIGINT/SIGTERM.
    #[arg(long)]
    verbose: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[expect(
    clippy::print_stderr,
    reason = "No logger is active when we are printing this error."
)]
fn main() {
    match try_main() {
        Ok(()) => {}
        Err(e) => {
            // Print the chain of errors manually so it doesn't look like a crash.
            eprintln!("{e:#}");

            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    // Without --verbose only warnings reach the console, mirroring how the
    // interactive UI used to cover the screen.
    let default_directives = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let directives =
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_directives.to_string());

    logging::setup_global_subscriber(&directives).context("Failed to set up logging")?;

    let config = config::load().context("Failed to load configuration")?;

    // The workload is I/O bound; two workers carry it comfortably.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("warp")
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: config::Config) -> Result<()> {
    let cancel = CancellationToken::new();

    spawn_signal_handler(cancel.clone())?;

    let tunnel = config.tunnel;

    let host = Arc::new(
        host::PlatformHost::new(&tunnel.name).context("Failed to initialise the host adapter")?,
    );

    let service = Arc::new(Service::new(
        ServiceConfig {
            name: tunnel.name.clone(),
            ip: tunnel.ip,
            mtu: DEFAULT_MTU,
            ipv6: tunnel.ipv6,
        },
        host,
    ));

    let mut protocols: Vec<Arc<dyn Protocol>> = Vec::new();

    for entry in config.protocols {
        let pipes = service.pipes().clone();

        match entry.into_kind()? {
            ProtocolKind::Ssh(cfg) => {
                let protocol = SshProtocol::new(cfg, pipes)
                    .await
                    .context("Failed to create SSH protocol")?;

                protocols.push(Arc::new(protocol));
            }
            ProtocolKind::Wireguard(cfg) => {
                let protocol = WireguardProtocol::new(cfg, pipes, cancel.clone())
                    .await
                    .context("Failed to create WireGuard protocol")?;

                protocols.push(Arc::new(protocol));
            }
            ProtocolKind::Socks5(cfg) => {
                protocols.push(Arc::new(Socks5Protocol::new(cfg, pipes)));
            }
            ProtocolKind::Local(cfg) => {
                let protocol =
                    LocalProtocol::new(cfg).context("Failed to create local protocol")?;

                protocols.push(Arc::new(protocol));
            }
        }
    }

    let device =
        Arc::new(tun::TunDevice::open(&tunnel.name).context("Failed to open TUN device")?);

    let device_io = spawn_device_pumps(device, cancel.clone());

    service.run(device_io, protocols, cancel).await
}

/// SIGINT or SIGTERM triggers one orderly shutdown.
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    #[cfg(target_family = "unix")]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }

            tracing::info!("Signal received, shutting down");

            cancel.cancel();
        });
    }

    #[cfg(not(target_family = "unix"))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;

            cancel.cancel();
        });
    }

    Ok(())
}

/// Moves raw packets between the TUN device and the engine's channels.
fn spawn_device_pumps(device: Arc<tun::TunDevice>, cancel: CancellationToken) -> DeviceIo {
    let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(512);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(512);

    tokio::spawn({
        let device = device.clone();

        async move {
            loop {
                let packet = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = device.recv() => match result {
                        Ok(packet) => packet,
                        Err(e) => {
                            tracing::warn!("TUN read failed: {e}");
                            break;
                        }
                    },
                };

                if inbound_tx.send(packet).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(packet) = outbound_rx.recv().await {
            if let Err(e) = device.send(&packet).await {
                tracing::warn!("TUN write failed: {e}");
            }
        }
    });

    DeviceIo {
        inbound: inbound_rx,
        outbound: outbound_tx,
    }
}
