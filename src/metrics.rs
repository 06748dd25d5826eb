use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::thread;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("metric definition");
    // Registration only fails on duplicate names, which would be a typo here.
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("metric definition");
    let _ = REGISTRY.register(Box::new(g.clone()));
    g
}

pub static BLOCKS_PROCESSED: Lazy<IntCounter> =
    Lazy::new(|| counter("chainmirror_blocks_processed_total", "Blocks replayed and committed"));
pub static FINALIZE_OPERATIONS: Lazy<IntCounter> =
    Lazy::new(|| counter("chainmirror_finalize_operations_total", "Mapping operations applied"));
pub static HISTORY_RECORDS: Lazy<IntCounter> =
    Lazy::new(|| counter("chainmirror_history_records_total", "Mapping history records written"));
pub static CONSISTENCY_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("chainmirror_consistency_failures_total", "Replays that disagreed with the network"));
pub static REJECTED_TRANSACTIONS: Lazy<IntCounter> =
    Lazy::new(|| counter("chainmirror_rejected_transactions_total", "Rejected transactions replayed"));
pub static PEER_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| counter("chainmirror_peer_reconnects_total", "Connection attempts after the first"));
pub static REVERTS: Lazy<IntCounter> = Lazy::new(|| counter("chainmirror_reverts_total", "Completed reverts"));
pub static LATEST_HEIGHT: Lazy<IntGauge> = Lazy::new(|| gauge("chainmirror_latest_height", "Local chain tip"));
pub static PEER_HEIGHT: Lazy<IntGauge> =
    Lazy::new(|| gauge("chainmirror_peer_height", "Latest height advertised by the peer"));

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    if !cfg.enabled {
        return Ok(());
    }
    // Touch every metric so it shows up before its first update.
    Lazy::force(&BLOCKS_PROCESSED);
    Lazy::force(&FINALIZE_OPERATIONS);
    Lazy::force(&HISTORY_RECORDS);
    Lazy::force(&CONSISTENCY_FAILURES);
    Lazy::force(&REJECTED_TRANSACTIONS);
    Lazy::force(&PEER_RECONNECTS);
    Lazy::force(&REVERTS);
    Lazy::force(&LATEST_HEIGHT);
    Lazy::force(&PEER_HEIGHT);

    let bind_addr = cfg.bind.clone();
    let header = "Content-Type: text/plain; version=0.0.4"
        .parse::<tiny_http::Header>()
        .map_err(|_| anyhow::anyhow!("invalid metrics content-type header"))?;
    thread::spawn(move || {
        let server = match tiny_http::Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("could not start metrics server on {bind_addr}: {e}");
                return;
            }
        };
        tracing::info!("metrics served on {bind_addr}");

        for request in server.incoming_requests() {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
                tracing::warn!("could not encode metrics");
                continue;
            }
            let response = tiny_http::Response::from_data(buffer).with_header(header.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}
