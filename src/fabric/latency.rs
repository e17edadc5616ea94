//! End-to-end latency tracking from `send_time` metadata.

/// Accumulates `(receive_time - send_time)` samples and reports their
/// arithmetic mean once per window, resetting the accumulator.
#[derive(Debug)]
pub struct LatencyWindow {
    window_secs: f64,
    window_started: f64,
    total_ms: f64,
    count: u32,
}

impl LatencyWindow {
    pub fn new(window_secs: f64) -> LatencyWindow {
        LatencyWindow {
            window_secs,
            window_started: 0.0,
            total_ms: 0.0,
            count: 0,
        }
    }

    /// Record one sample. Returns the average latency in milliseconds when
    /// the current window has elapsed, `None` otherwise.
    pub fn record(&mut self, send_time: f64, receive_time: f64) -> Option<f64> {
        if self.count == 0 {
            self.window_started = receive_time;
        }
        self.total_ms += (receive_time - send_time) * 1000.0;
        self.count += 1;

        if receive_time - self.window_started >= self.window_secs {
            let average = self.total_ms / self.count as f64;
            self.total_ms = 0.0;
            self.count = 0;
            Some(average)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn reports_arithmetic_mean_over_one_window() {
        let mut window = LatencyWindow::new(1.0);
        // latencies: 10ms, 20ms, 30ms
        assert!(window.record(100.0, 100.010).is_none());
        assert!(window.record(100.3, 100.320).is_none());
        let average = window.record(101.0, 101.030).expect("window elapsed");
        assert_relative_eq!(average, 20.0, epsilon = 1e-9);
    }

    #[test]
    fn accumulator_resets_between_windows() {
        let mut window = LatencyWindow::new(1.0);
        assert!(window.record(0.0, 0.100).is_none());
        let first = window.record(1.0, 2.0).expect("first window");
        assert_relative_eq!(first, 550.0, epsilon = 1e-9);

        // the next window starts fresh
        assert!(window.record(2.0, 2.005).is_none());
        let second = window.record(3.0, 3.005).expect("second window");
        assert_relative_eq!(second, 5.0, epsilon = 1e-9);
    }
}
