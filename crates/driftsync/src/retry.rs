//! Retry policy derived from the error-handling configuration.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::ErrorHandlingConfig;

/// Exponential backoff builder matching the configured retry policy.
pub fn backoff(config: &ErrorHandlingConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_factor(config.backoff_factor as f32)
        .with_max_delay(Duration::from_secs(config.max_backoff_seconds))
        .with_max_times(config.max_retries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_respects_max_times() {
        let config = ErrorHandlingConfig {
            max_retries: 2,
            backoff_factor: 2.0,
            max_backoff_seconds: 10,
            dead_letter_queue: true,
            retention_days: 30,
        };
        // The builder is an iterator factory; materialize the delays
        let delays: Vec<Duration> = backon::BackoffBuilder::build(backoff(&config)).collect();
        assert_eq!(delays.len(), 2);
        assert!(delays[1] >= delays[0]);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    }
}
