use tracing_subscriber::EnvFilter;

/// Directive used when neither `filter` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "dbqueue=info";

/// Install a fmt subscriber filtered by `filter`, then `RUST_LOG`, then [`DEFAULT_FILTER`].
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(filter: Option<&str>) -> bool {
    let filter = filter
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init_tracing(Some("dbqueue=debug"));
        assert!(!init_tracing(None));
    }
}
