use pkg_constants::runtime::LOG_FILTER_ENV;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. The filter comes from `POLLCOORD_LOG`,
/// then `RUST_LOG`, then defaults to `info`.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
