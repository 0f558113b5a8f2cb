//! Global tracing initialization, isolated in its own test binary because it
//! installs the process-global subscriber.

use icepap::logging::{init, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    let config = TracingConfig::new(Level::WARN)
        .with_format(OutputFormat::Compact)
        .with_span_events(false)
        .with_ansi(false);
    assert!(init(config.clone()).is_ok());
    assert!(init(config).is_ok());
}
