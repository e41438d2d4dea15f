/// Installs the fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
