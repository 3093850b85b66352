/// Install the process-wide tracing subscriber. Call once at startup.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();
}
