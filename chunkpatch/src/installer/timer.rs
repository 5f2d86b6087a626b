//! Stage timing.

use std::time::{Duration, Instant};

/// Wall-clock timer for one installer stage.
///
/// Accumulates across starts, so a stage repeated by installer retries reports
/// its total time.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageTimer {
    started: Option<Instant>,
    total: Duration,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.total += started.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.total + self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }

    pub fn seconds(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_accumulates_across_runs() {
        let mut timer = StageTimer::new();
        timer.start();
        thread::sleep(Duration::from_millis(10));
        timer.stop();
        let first = timer.elapsed();
        assert!(first >= Duration::from_millis(10));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.elapsed(), first);

        timer.start();
        thread::sleep(Duration::from_millis(10));
        timer.stop();
        assert!(timer.elapsed() >= first + Duration::from_millis(10));
    }

    #[test]
    fn test_double_start_keeps_first_instant() {
        let mut timer = StageTimer::new();
        timer.start();
        thread::sleep(Duration::from_millis(10));
        timer.start();
        assert!(timer.elapsed() >= Duration::from_millis(10));
        assert!(timer.is_running());
    }
}
