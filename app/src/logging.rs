use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,sqlpane=info,sqlpane_core=info,sqlpane_adapters=info";

/// Installs the stderr subscriber. Filter priority: `--log` flag, then
/// `SQLPANE_LOG`, then `RUST_LOG`, then the built-in default.
pub fn init(custom_filter: Option<&str>) {
    let filter = build_env_filter(
        custom_filter,
        std::env::var("SQLPANE_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_env_filter(
    custom: Option<&str>,
    app_env: Option<&str>,
    rust_env: Option<&str>,
) -> EnvFilter {
    [custom, app_env, rust_env]
        .into_iter()
        .flatten()
        .filter(|directives| !directives.trim().is_empty())
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
