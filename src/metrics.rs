// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed ingestion --------
pub static SNAPSHOTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("snapshots_total", "fixture snapshots applied").unwrap());

pub static UPDATES_ACCEPTED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("updates_accepted_total", "stream updates accepted").unwrap());

pub static UPDATES_BY_FIXTURE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("updates_total_by_fixture", "stream updates received per fixture"),
        &["fixture"],
    )
    .unwrap()
});

pub static UPDATES_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("updates_rejected_total", "stream updates rejected (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static MARKETS_CHANGED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("markets_changed_total", "market states that actually changed").unwrap()
});

// Time spent reconciling one payload (milliseconds)
pub static LAT_APPLY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "payload_apply_ms",
        "Time to validate + reconcile one payload (ms)",
    ))
    .unwrap()
});

// -------- Listener health --------
pub static PLUGIN_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("plugin_errors_total", "plugin callback failures (label: callback)"),
        &["callback"],
    )
    .unwrap()
});

pub static HEALTH_CHECK_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("health_check_failures_total", "stale fixture streams detected").unwrap()
});

pub static RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("reconnects_total", "stream reconnect attempts").unwrap());

pub static LISTENERS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("listeners_by_state", "stream listeners per state (label: state)"),
        &["state"],
    )
    .unwrap()
});

// -------- Supervisor --------
pub static PUSHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pushes_total", "overview pushes (label: kind = sport|fixture)"),
        &["kind"],
    )
    .unwrap()
});

pub static STORE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("store_errors_total", "persisted-state failures (label: op)"),
        &["op"],
    )
    .unwrap()
});

pub static FIXTURES_KNOWN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("fixtures_known", "fixtures tracked by the supervisor").unwrap());

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_FIXTURE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_fixture", "configured fixtures (labels: sport, fixture)"),
        &["sport", "fixture"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(SNAPSHOTS.clone())),
        REGISTRY.register(Box::new(UPDATES_ACCEPTED.clone())),
        REGISTRY.register(Box::new(UPDATES_BY_FIXTURE.clone())),
        REGISTRY.register(Box::new(UPDATES_REJECTED.clone())),
        REGISTRY.register(Box::new(MARKETS_CHANGED.clone())),
        REGISTRY.register(Box::new(LAT_APPLY.clone())),
        REGISTRY.register(Box::new(PLUGIN_ERRORS.clone())),
        REGISTRY.register(Box::new(HEALTH_CHECK_FAILURES.clone())),
        REGISTRY.register(Box::new(RECONNECTS.clone())),
        REGISTRY.register(Box::new(LISTENERS_BY_STATE.clone())),
        REGISTRY.register(Box::new(PUSHES.clone())),
        REGISTRY.register(Box::new(STORE_ERRORS.clone())),
        REGISTRY.register(Box::new(FIXTURES_KNOWN.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_FIXTURE.clone())),
    ] {
        if let Err(e) = m {
            warn!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                // tanpa metrics tetap jalan
                error!(%addr, ?e, "metrics bind failed, endpoint disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(?e, "metrics accept error"),
            }
        }
    });
}
