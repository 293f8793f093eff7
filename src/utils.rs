/// Utility functions and helpers for polling
///
/// This module contains poll metrics, an operation timer, formatting helpers
/// for reports, and logger initialization for tests and binaries.

use std::time::{Duration, Instant};
use log::debug;

use crate::error::ModbusError;

/// Per-poller tick metrics
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Failures since the last successful tick
    pub consecutive_failures: u64,
    pub last_error: Option<ModbusError>,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful tick
    pub fn record_success(&mut self, duration: Duration) {
        self.successful_requests += 1;
        self.consecutive_failures = 0;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.record(duration);
    }

    /// Record a failed tick
    pub fn record_failure(&mut self, duration: Duration, error: &ModbusError) {
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.clone());
        self.record(duration);
    }

    fn record(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.total_duration += duration;
        self.avg_duration = self.total_duration / self.total_requests as u32;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: &'static str,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation_name,
        }
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format poll metrics as a table
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        format!(
            "Poll Metrics:\n\
             ├─ Ticks: {}\n\
             ├─ Successful: {} ({:.1}%)\n\
             ├─ Failed: {} ({} in a row)\n\
             ├─ Last Error: {}\n\
             ├─ Average Duration: {}\n\
             ├─ Min Duration: {}\n\
             └─ Max Duration: {}",
            metrics.total_requests,
            metrics.successful_requests,
            metrics.success_rate(),
            metrics.failed_requests,
            metrics.consecutive_failures,
            metrics
                .last_error
                .as_ref()
                .map_or("none".to_string(), |e| e.to_string()),
            format_duration(metrics.avg_duration),
            metrics.min_duration.map_or("N/A".to_string(), format_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize env_logger for tests; repeated calls are ignored
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_metrics() {
        let mut metrics = PerformanceMetrics::new();

        metrics.record_success(Duration::from_millis(100));
        metrics.record_failure(Duration::from_millis(150), &ModbusError::timeout("poll", 150));
        metrics.record_failure(Duration::from_millis(150), &ModbusError::connection("reset"));

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.consecutive_failures, 2);
        assert!(matches!(metrics.last_error, Some(ModbusError::Connection { .. })));
        assert!((metrics.success_rate() - 33.33).abs() < 0.1);

        metrics.record_success(Duration::from_millis(50));
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(50)));
        assert_eq!(metrics.avg_duration, Duration::from_millis(112) + Duration::from_micros(500));

        metrics.reset();
        assert_eq!(metrics.total_requests, 0);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(20)), "20ms");

        let mut metrics = PerformanceMetrics::new();
        metrics.record_failure(Duration::from_millis(10), &ModbusError::timeout("poll", 10));
        let report = format::format_metrics(&metrics);
        assert!(report.contains("Failed: 1 (1 in a row)"));
        assert!(report.contains("Timeout after 10ms"));
    }
}
