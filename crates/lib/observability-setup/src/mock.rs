use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ObservabilityOptions;
use crate::common::env_filter;

pub fn init(options: ObservabilityOptions) {
    if options.trace_path.is_some() {
        eprintln!("tracing-chrome disabled. Rebuild with --features trace.");
    }
    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter(&options))
        .with(fmt_layer)
        .try_init()
    {
        eprintln!("tracing init failed: {err}");
    }
}

pub fn flush() {}
