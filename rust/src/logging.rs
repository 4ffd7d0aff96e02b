/// Process-wide tracing initialization: fmt layer to stderr with an
/// env-filter override (`RUST_LOG`), defaulting to crate-level debug.
///
/// Called once at the start of `App::new()`; repeated calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cove_core=debug,info".into()),
        )
        .try_init();
}
