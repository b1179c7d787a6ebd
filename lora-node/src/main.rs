// lora-node: home-controller daemon over a UDP multicast radio channel.

mod config;
mod controller;
mod radio;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use lora_core::protocol::StreamType;
use lora_core::{Engine, NodeId};
use tracing_subscriber::EnvFilter;

use crate::controller::HomeController;
use crate::radio::UdpRadio;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    request_stream: Option<NodeId>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Option<Args>> {
    let mut out = Args {
        request_stream: None,
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lora-node {}", VERSION);
                return Ok(None);
            }
            "--request-stream" => {
                let id = args.next().context("--request-stream needs a node id")?;
                let id: u8 = id.parse().with_context(|| format!("bad node id {id}"))?;
                out.request_stream = Some(NodeId(id));
            }
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(Some(out))
}

fn main() -> Result<()> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load()?;
    tracing::info!(node = %cfg.node_id, version = VERSION, "starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, args))
}

async fn run(cfg: config::Config, args: Args) -> Result<()> {
    let (radio, ready) = UdpRadio::open(cfg.node_id, cfg.multicast_group, cfg.port)?;
    let handler = HomeController::new(&cfg);
    let mut engine = Engine::with_config(cfg.node_id, radio, handler, cfg.engine_config());

    if let Some(peer) = args.request_stream {
        engine.request_stream(peer, StreamType::Jpeg)?;
        tracing::info!(peer = %peer, "stream requested");
    }

    let mut tick = tokio::time::interval(cfg.tick());
    let pinging = cfg.ping_interval_secs > 0;
    let mut ping = tokio::time::interval(Duration::from_secs(cfg.ping_interval_secs.max(1)));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ready.notified() => {
                engine.poll().context("radio closed")?;
            }
            _ = tick.tick() => engine.tick(),
            _ = ping.tick(), if pinging => {
                if let Err(e) = engine.send_ping(NodeId::BROADCAST) {
                    tracing::warn!(error = %e, "ping not sent");
                }
            }
            res = &mut shutdown => {
                res?;
                let h = engine.handler();
                tracing::info!(
                    triggers = h.triggers(),
                    value = h.value(),
                    streams_saved = h.received().len(),
                    "shutting down"
                );
                break;
            }
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
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
