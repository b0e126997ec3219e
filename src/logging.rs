//! Process-wide tracing subscriber.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn";
const VERBOSE_FILTER: &str = "debug,hyper=info,tokio_postgres=info";

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_FILTER
        } else {
            DEFAULT_FILTER
        })
    })
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
