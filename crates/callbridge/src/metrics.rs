use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|err| panic!("invalid metric {name}: {err}"));
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|err| panic!("invalid metric {name}: {err}"));
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static CALL_INVOKES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "callbridge_call_invokes_total",
        "call invocations by admission result",
        &["result"],
    )
});

pub static CALL_TERMINAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "callbridge_call_terminal_total",
        "terminal call transitions by outcome",
        &["outcome"],
    )
});

pub static WAKE_STAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "callbridge_wake_stage_total",
        "wake stage outcomes by stage name and result",
        &["stage", "result"],
    )
});

pub static SIGNAL_DUPLICATES: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "callbridge_signal_duplicates_total",
        "inbound signal messages ignored as already applied",
    )
});

pub static RELAY_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "callbridge_relay_reconnects_total",
        "relay links lost and re-established",
    )
});

pub static RELAY_BUFFER_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "callbridge_relay_buffer_drops_total",
        "frames rejected because the reconnect buffer was full",
    )
});

pub static HUB_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "callbridge_hub_frames_total",
        "relay hub signal frames by disposition",
        &["disposition"],
    )
});

pub static HUB_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "callbridge_hub_connections",
        "live relay hub connections",
    ))
    .unwrap_or_else(|err| panic!("invalid metric: {err}"));
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
