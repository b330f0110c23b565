use tracing_subscriber::filter::EnvFilter;

/// Route bridge logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_test_writer()
        .try_init();
}
