//! `catbusd` — a standalone Catbus node.
//!
//! Wires an `Engine` to the dispatcher, announce, publish, persist, and
//! file-session-timeout tasks, then waits for Ctrl-C. Construction order
//! mirrors the teacher's `main.rs`: build config, build the engine, start
//! the background tasks, block on shutdown.

use std::sync::Arc;

use catbus::config::Args;
use catbus::kv::StaticTable;
use catbus::{CatbusConfig, Engine};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Some(path) = &args.static_image {
        info!("static_image {} given but static-table loading is not wired up; running dynamic-only", path.display());
    }

    let config: CatbusConfig = args.into();
    info!("starting catbusd on {}:{}", config.bind_addr, config.port);
    if !config.tags.is_empty() {
        info!("meta tags: {:?}", config.tags);
    }

    let engine = match Engine::new(config, StaticTable::new(Vec::new())).await {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("failed to start engine: {e}");
            std::process::exit(1);
        }
    };

    wire_publish_hook(&engine);

    spawn_tasks(engine);

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
}

/// Route "a dynamic value changed" notifications into the link runtime's
/// publish path, the same delegation-through-a-callback the original
/// keeps between `kvdb.c` and `catbus.c`.
fn wire_publish_hook(engine: &Arc<Engine>) {
    let hook_engine = Arc::clone(engine);
    engine.kv.set_publish_hook(Arc::new(move |hash| {
        hook_engine.link_runtime.publish(hash);
    }));
}

fn spawn_tasks(engine: Arc<Engine>) {
    tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            if let Err(e) = catbus::protocol::run(engine).await {
                tracing::error!("dispatcher loop exited: {e}");
            }
        }
    });
    tokio::spawn(catbus::discovery::run_announce(Arc::clone(&engine)));
    tokio::spawn(catbus::discovery::run_publish_worker(Arc::clone(&engine)));
    tokio::spawn(catbus::discovery::run_persist_worker(Arc::clone(&engine)));
    tokio::spawn(catbus::discovery::run_file_session_ticker(engine));
}
