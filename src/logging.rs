// Logging setup, powered by tracing-subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingCfg;

/// Build the filter from the configured level, capping chatty HTTP crates.
/// `RUST_LOG` wins when set.
fn build_env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut directives = vec![level.to_string()];
    for target in ["hyper", "hyper_util", "reqwest", "h2"] {
        directives.push(format!("{target}=warn"));
    }
    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean for output.
pub fn init(cfg: &LoggingCfg) -> anyhow::Result<()> {
    let filter = build_env_filter(&cfg.level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_level() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(build_env_filter("debug").is_ok());
        assert!(build_env_filter("synctrack=verbose").is_err());
    }
}
