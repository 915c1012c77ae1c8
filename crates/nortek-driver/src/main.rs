//! Nortek driver entry point.
//!
//! Loads the configuration, opens the link to the instrument, discovers its
//! state, and logs every driver event until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()          -- TOML file from argv[1] or the platform dir
//!  └─ connect_tcp() / open_serial()
//!  └─ start_session()        -- session task owning the protocol
//!       ├─ discover
//!       └─ apply startup parameters (command mode only)
//!  └─ event pump             -- until the session ends
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use nortek_core::params::user_config::nortek_registry;
use nortek_core::Frame;
use nortek_driver::application::{start_session, ProtocolEvent, ProtocolState};
use nortek_driver::infrastructure::notify::{ChannelSink, DriverEvent};
use nortek_driver::infrastructure::storage::config::{
    config_file_path, load_config, TransportKind,
};
use nortek_driver::infrastructure::transport::{connect_tcp, open_serial, ByteStream, Transport};

const EVENT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => config_file_path()?,
    };
    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.driver.log_level)),
        )
        .init();

    info!("Nortek driver starting with {}", path.display());

    let family = config.family()?;
    let mut registry = nortek_registry(family)?;
    config.seed_registry(&mut registry)?;

    let (transport, inbound): (Box<dyn Transport>, ByteStream) = match config.transport.kind {
        TransportKind::Tcp => {
            let (transport, inbound) =
                connect_tcp(&config.transport.address, config.transport.connect_timeout()).await?;
            (Box::new(transport), inbound)
        }
        TransportKind::Serial => {
            let (transport, inbound) =
                open_serial(&config.transport.serial_port, config.transport.baud_rate)?;
            (Box::new(transport), inbound)
        }
    };

    let (sink, mut events) = ChannelSink::new(EVENT_CAPACITY);
    let (session, task) = start_session(
        transport,
        inbound,
        family,
        registry,
        config.timing(),
        Arc::new(sink),
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let shutdown_handle = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_handle.shutdown();
        }
    });

    // ── Discovery ─────────────────────────────────────────────────────────────
    match session.discover().await {
        Ok(state) => {
            info!("instrument is in {state}");
            if state == ProtocolState::Command && config.driver.apply_startup_params {
                if let Err(e) = session.execute(ProtocolEvent::ApplyStartupParams).await {
                    error!("applying startup parameters failed: {e}");
                }
            }
        }
        Err(e) => warn!("discovery failed, staying in UNKNOWN: {e}"),
    }

    info!("Nortek driver ready.  Press Ctrl-C to exit.");

    // ── Event pump ────────────────────────────────────────────────────────────
    // Ends when the session task drops its sink.
    drop(session);
    while let Some(event) = events.recv().await {
        log_event(&event);
    }

    task.await.context("session task panicked")?;
    info!("Nortek driver stopped");
    Ok(())
}

fn log_event(event: &DriverEvent) {
    match event {
        DriverEvent::StateChanged(state) => info!("state changed to {state}"),
        DriverEvent::ConfigChanged { old, new } => {
            let changed: Vec<&String> = new
                .iter()
                .filter(|(name, value)| old.get(*name) != Some(*value))
                .map(|(name, _)| name)
                .collect();
            info!(?changed, "configuration changed");
        }
        DriverEvent::Sample(frame) => match frame {
            Frame::Sample {
                name, checksum_ok, ..
            } => debug!(name, checksum_ok, "sample"),
            other => info!(?other, "status frame"),
        },
        DriverEvent::DirectAccessOutput(bytes) => {
            info!("direct access: {:?}", String::from_utf8_lossy(bytes));
        }
    }
}
