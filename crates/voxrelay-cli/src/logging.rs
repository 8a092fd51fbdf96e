//! Process-wide tracing setup.

use tracing_subscriber::EnvFilter;

use voxrelay_core::config::LoggingConfig;

/// Filter directives: base level (or `debug` when verbose) plus per-crate filters.
pub fn filter_directives(logging: Option<&LoggingConfig>, verbose: bool) -> String {
    let base = match logging {
        _ if verbose => "debug".to_string(),
        Some(logging) => logging.level.clone(),
        None => "info".to_string(),
    };

    let mut directives = vec![base];
    if let Some(logging) = logging {
        directives.extend(logging.filters.iter().cloned());
    }
    directives.join(",")
}

/// Install the global subscriber. `RUST_LOG` takes precedence over config.
pub fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(logging, verbose)));

    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).try_init(),
        (true, false) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, true) => builder.with_writer(std::io::stdout).try_init(),
        (false, false) => builder.with_writer(std::io::stderr).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}
