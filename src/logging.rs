//! Subscriber setup for the binary.
//!
//! The library only emits events inside the spans handed to each component;
//! installing a subscriber is left to the program embedding it.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    // A subscriber installed by an embedding program stays in place
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Our own events at `level`, dependencies (hyper, reqwest) at warn.
fn default_directive(level: &str) -> String {
    format!("warn,vault_migrations={}", level.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        for level in ["trace", "debug", "info", "warn", "error", "INFO"] {
            let directive = default_directive(level);
            assert!(EnvFilter::try_new(&directive).is_ok(), "{}", directive);
        }
    }
}
