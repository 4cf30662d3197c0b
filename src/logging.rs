use tracing_subscriber::EnvFilter;

use crate::error::{GatewayError, Result};

/// Install a formatting subscriber for the process
///
/// `RUST_LOG` wins over `default_filter` when set. A subscriber installed
/// earlier is kept.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| GatewayError::InvalidConfig {
            message: format!("invalid log filter {default_filter:?}: {e}"),
        })?;

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging("content_gateway=debug").unwrap();
        init_logging("info").unwrap();
    }
}
