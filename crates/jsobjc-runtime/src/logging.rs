//! Logging bootstrap

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over the configured level. Only the first call has an
/// effect; it returns whether this process's subscriber is ours (another
/// crate may have installed one first).
pub fn init(config: &LogConfig) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_ascii_lowercase()));
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_ansi(config.ansi))
            .with(filter)
            .try_init()
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            level: "warn".to_string(),
            ansi: false,
        };
        let first = init(&config);
        assert_eq!(init(&config), first);
        tracing::debug!("after init");
    }
}
