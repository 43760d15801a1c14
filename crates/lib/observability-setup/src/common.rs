use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// Emit log lines as JSON objects instead of the human-readable format.
    pub json: bool,
    /// Filter directives used when `RUST_LOG` is unset, e.g. `conveyor=debug`.
    pub filter: Option<String>,
    /// Chrome trace output path. Only honored with the `trace` feature.
    pub trace_path: Option<String>,
}

pub(crate) fn env_filter(options: &ObservabilityOptions) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(options.filter.as_deref().unwrap_or("info"))
    })
}
