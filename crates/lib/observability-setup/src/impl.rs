use std::sync::{Mutex, OnceLock};

use tracing_chrome::FlushGuard;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ObservabilityOptions;
use crate::common::env_filter;

static TRACE_GUARD: OnceLock<Mutex<Option<FlushGuard>>> = OnceLock::new();

fn store_trace_guard(guard: FlushGuard) {
    let cell = TRACE_GUARD.get_or_init(|| Mutex::new(None));
    let mut slot = cell.lock().expect("trace guard lock poisoned");
    *slot = Some(guard);
}

/// Drop the chrome flush guard so the trace file is complete.
pub fn flush() {
    if let Some(cell) = TRACE_GUARD.get() {
        let mut slot = cell.lock().expect("trace guard lock poisoned");
        slot.take();
    }
}

pub fn init(options: ObservabilityOptions) {
    let (chrome_layer, trace_guard) = match options.trace_path.clone() {
        Some(path) => {
            let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path.clone())
                .include_args(true)
                .build();
            eprintln!("tracing-chrome enabled (trace at {path})");
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(chrome_layer)
        .with(fmt_layer.with_filter(env_filter(&options)))
        .try_init()
    {
        eprintln!("tracing init failed: {err}");
    }

    if let Some(guard) = trace_guard {
        store_trace_guard(guard);
    }
}
