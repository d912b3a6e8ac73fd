// Shoal peer: multicast channels, metadata store, protocol engine, local control socket.

mod channel;
mod config;
mod control;
mod engine;
mod store;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use shoal_core::{Channel, NodeCore};
use tracing_subscriber::EnvFilter;

use crate::channel::Outbound;
use crate::engine::Peer;
use crate::store::MetadataStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("shoal-peer {}", VERSION);
                return Ok(());
            }
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument {:?}", other),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(config_path.as_deref()).context("loading config")?;
    tracing::info!(
        "node {} speaking {} in {}",
        cfg.node_id,
        cfg.version,
        cfg.node_dir().display()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = MetadataStore::open(cfg.node_dir())
            .await
            .context("opening metadata store")?;
        let state = store.load(cfg.chunk_size).await.context("loading metadata")?;
        tracing::debug!("metadata rooted at {}", store.root().display());
        let core = NodeCore::with_state(cfg.node_id, cfg.version, cfg.chunk_size, state);

        let (mc, mdb, mdr) = cfg.channels()?;
        let mut writers = Vec::new();
        let mut readers = Vec::new();
        for (kind, group) in [
            (Channel::Control, mc),
            (Channel::Backup, mdb),
            (Channel::Restore, mdr),
        ] {
            let socket = Arc::new(
                channel::open(group).with_context(|| format!("joining {} at {}", kind, group))?,
            );
            writers.push(channel::spawn_writer(
                kind,
                Arc::clone(&socket),
                SocketAddr::from(group),
            ));
            readers.push((kind, socket));
        }
        let mdr_tx = writers.pop().context("restore writer")?;
        let mdb_tx = writers.pop().context("backup writer")?;
        let mc_tx = writers.pop().context("control writer")?;
        let out = Outbound::new(mc_tx, mdb_tx, mdr_tx);

        let peer = Peer::new(core, store, out, cfg.retry_base(), cfg.purge_grace());
        for (kind, socket) in readers {
            let handler_peer = Arc::clone(&peer);
            tokio::spawn(channel::receive_loop(kind, socket, move |msg| {
                Arc::clone(&handler_peer).handle(msg)
            }));
        }

        let control_bind = SocketAddr::from((Ipv4Addr::LOCALHOST, cfg.control_port));
        let control_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            if let Err(e) = control::run_control(control_bind, control_peer).await {
                tracing::error!("control socket on {} failed: {}", control_bind, e);
            }
        });

        peer.resume_purges().await;
        peer.announce();
        shutdown_signal().await?;
        tracing::info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
