//! CLI entry point: parses configuration, builds the pipeline, and serves
//! the health/WebSocket surface until interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use nds::broadcaster::{self, BroadcasterState};
use nds::config::Config;
use nds::metrics::Metrics;
use nds::pipeline::Pipeline;
use nds::pubsub::PubSub;

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = Config::parse();
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    let metrics = Arc::new(Metrics::new());
    let pipeline = match Pipeline::new(config.clone(), metrics.clone()) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!("failed to build pipeline: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = pipeline.start() {
        error!("failed to start pipeline: {}", e);
        std::process::exit(1);
    }
    info!("nds pipeline running on interface {:?}", config.capture_interface);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        }) {
            error!("failed to install ctrl-c handler: {}", e);
        }
    }

    let state = BroadcasterState {
        pubsub: pipeline.pubsub() as Arc<dyn PubSub>,
        metrics: pipeline.metrics(),
        client_queue_len: config.ws_client_queue_len,
    };
    let router = broadcaster::router(state);
    let listener = match tokio::net::TcpListener::bind(&config.http_bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {}", config.http_bind_addr, e);
            pipeline.stop();
            std::process::exit(1);
        }
    };
    info!("serving health and websocket routes on {}", config.http_bind_addr);

    let server = axum::serve(listener, router);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("http server error: {}", e);
            }
        }
        _ = wait_for_shutdown(shutdown) => {
            info!("stopping pipeline");
        }
    }

    pipeline.stop();
}

async fn wait_for_shutdown(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}
