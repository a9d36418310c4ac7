use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use relay_core::ids::{RunId, UserId};

/// Operational notifications emitted by the engine. What happens to them is
/// the sink's business; the engine itself never changes behavior based on
/// timing or failure-rate observations.
#[derive(Clone, Debug)]
pub enum Alert {
    RunFailed {
        user_id: UserId,
        run_id: RunId,
        reason: String,
    },
    /// The run finished fine but took more than 1.5x the soft duration
    /// target. Observability only.
    SlowRun {
        user_id: UserId,
        run_id: RunId,
        duration: Duration,
        target: Duration,
    },
    FailureRateElevated {
        window: usize,
        failure_ratio: f64,
    },
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Default sink: structured warn logs, nothing else.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: &Alert) {
        match alert {
            Alert::RunFailed {
                user_id,
                run_id,
                reason,
            } => {
                warn!(user_id = %user_id, run_id = %run_id, reason = %reason, "run failed");
            }
            Alert::SlowRun {
                user_id,
                run_id,
                duration,
                target,
            } => {
                warn!(
                    user_id = %user_id,
                    run_id = %run_id,
                    duration_ms = duration.as_millis() as u64,
                    target_ms = target.as_millis() as u64,
                    "run exceeded soft duration target"
                );
            }
            Alert::FailureRateElevated {
                window,
                failure_ratio,
            } => {
                warn!(
                    window = window,
                    failure_ratio = failure_ratio,
                    "elevated run failure rate"
                );
            }
        }
    }
}

/// Sliding window over recent run outcomes. Reports the failure ratio when
/// it crosses the threshold with a full window of samples.
pub struct FailureRateMonitor {
    window: usize,
    threshold: f64,
    outcomes: Mutex<VecDeque<bool>>,
}

impl FailureRateMonitor {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self {
            window: window.max(1),
            threshold,
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one run outcome. Returns the failure ratio if it is elevated.
    pub fn record(&self, failed: bool) -> Option<f64> {
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(failed);
        if outcomes.len() > self.window {
            outcomes.pop_front();
        }
        if outcomes.len() < self.window {
            return None;
        }
        let failures = outcomes.iter().filter(|f| **f).count();
        let ratio = failures as f64 / outcomes.len() as f64;
        (ratio >= self.threshold).then_some(ratio)
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_until_window_full() {
        let monitor = FailureRateMonitor::new(4, 0.5);
        assert_eq!(monitor.record(true), None);
        assert_eq!(monitor.record(true), None);
        assert_eq!(monitor.record(true), None);
        // Fourth sample fills the window: 4/4 failed
        assert_eq!(monitor.record(true), Some(1.0));
    }

    #[test]
    fn ratio_below_threshold_is_quiet() {
        let monitor = FailureRateMonitor::new(4, 0.5);
        for _ in 0..4 {
            monitor.record(false);
        }
        assert_eq!(monitor.record(true), None); // 1/4 = 0.25
    }

    #[test]
    fn window_slides() {
        let monitor = FailureRateMonitor::new(2, 0.5);
        monitor.record(true);
        assert_eq!(monitor.record(true), Some(1.0));
        monitor.record(false);
        // Window is now [true, false] → 0.5, still at threshold
        assert_eq!(monitor.record(false), None); // [false, false]
    }
}
