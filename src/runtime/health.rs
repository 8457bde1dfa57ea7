//! Container health state under a [`HealthCheck`] contract.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::HealthCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Starting => write!(f, "starting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of one health request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The endpoint answered successfully after this long.
    Passed(Duration),
    Failed,
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    contract: HealthCheck,
    state: HealthState,
    consecutive_failures: u32,
}

impl HealthTracker {
    pub fn new(contract: HealthCheck) -> Self {
        Self {
            contract,
            state: HealthState::Starting,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Interval between health requests.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.contract.interval_seconds)
    }

    /// Apply an outcome observed `since_start` after the container started.
    pub fn record(&mut self, since_start: Duration, outcome: CheckOutcome) -> HealthState {
        let timeout = Duration::from_secs(self.contract.timeout_seconds);
        let passed = matches!(outcome, CheckOutcome::Passed(latency) if latency <= timeout);

        if passed {
            self.consecutive_failures = 0;
            self.state = HealthState::Healthy;
            return self.state;
        }

        // Start period failures are ignored, but a success inside it still counts.
        if since_start < Duration::from_secs(self.contract.start_period_seconds) {
            debug!(elapsed = ?since_start, "health check failed during start period");
            return self.state;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.contract.retries {
            if self.state != HealthState::Unhealthy {
                warn!(
                    failures = self.consecutive_failures,
                    path = %self.contract.path,
                    "container unhealthy"
                );
            }
            self.state = HealthState::Unhealthy;
        }
        self.state
    }
}

/// `GET` the contract's URL on `port`. Any transport error, timeout or
/// non-2xx/3xx status is a failure.
pub fn http_check(contract: &HealthCheck, port: u16) -> CheckOutcome {
    let url = contract.url(port);
    let started = Instant::now();
    match ureq::get(&url)
        .timeout(Duration::from_secs(contract.timeout_seconds))
        .call()
    {
        Ok(_) => CheckOutcome::Passed(started.elapsed()),
        Err(err) => {
            debug!(%url, error = %err, "health request failed");
            CheckOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_start_period_failures_do_not_count() {
        let mut tracker = HealthTracker::new(HealthCheck::default());
        for at in [0, 10, 20, 29] {
            tracker.record(secs(at), CheckOutcome::Failed);
        }
        assert_eq!(tracker.state(), HealthState::Starting);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_retries_consecutive_failures_mark_unhealthy() {
        let mut tracker = HealthTracker::new(HealthCheck::default());
        tracker.record(secs(30), CheckOutcome::Passed(secs(1)));
        tracker.record(secs(60), CheckOutcome::Failed);
        tracker.record(secs(90), CheckOutcome::Failed);
        assert_eq!(tracker.state(), HealthState::Healthy);
        assert_eq!(tracker.record(secs(120), CheckOutcome::Failed), HealthState::Unhealthy);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut tracker = HealthTracker::new(HealthCheck::default());
        tracker.record(secs(30), CheckOutcome::Failed);
        tracker.record(secs(60), CheckOutcome::Failed);
        tracker.record(secs(90), CheckOutcome::Passed(secs(2)));
        tracker.record(secs(120), CheckOutcome::Failed);
        assert_eq!(tracker.consecutive_failures(), 1);
        assert_eq!(tracker.state(), HealthState::Healthy);
    }

    #[test]
    fn test_slow_response_is_a_failure() {
        let mut tracker = HealthTracker::new(HealthCheck::default());
        for at in [30, 60, 90] {
            tracker.record(secs(at), CheckOutcome::Passed(secs(31)));
        }
        assert_eq!(tracker.state(), HealthState::Unhealthy);
    }

    #[test]
    fn test_recovers_after_unhealthy() {
        let mut tracker = HealthTracker::new(HealthCheck::default());
        for at in [30, 60, 90] {
            tracker.record(secs(at), CheckOutcome::Failed);
        }
        assert_eq!(tracker.state(), HealthState::Unhealthy);
        assert_eq!(tracker.record(secs(120), CheckOutcome::Passed(secs(1))), HealthState::Healthy);
    }

    #[test]
    fn test_http_check_fails_without_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let contract = HealthCheck {
            timeout_seconds: 2,
            ..HealthCheck::default()
        };
        assert_eq!(http_check(&contract, port), CheckOutcome::Failed);
    }

    #[test]
    fn test_http_check_passes_on_ok_response() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .unwrap();
            request
        });

        let outcome = http_check(&HealthCheck::default(), port);

        assert!(matches!(outcome, CheckOutcome::Passed(_)));
        assert!(server.join().unwrap().starts_with("GET /api/v1/health "));
    }
}
