//! Job progress and the observable status surface.
//!
//! The worker is the only writer. Observers get a [`StatusSnapshot`] through a
//! `watch` channel and the append-only debug log through a `broadcast`
//! channel, so slow readers never block the transfer loop.

use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

/// A throughput sample older than this no longer predicts the future.
const STALE_AFTER: Duration = Duration::from_secs(30);
const LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ProgressState {
    bytes_target: u64,
    bytes_processed: u64,
    started: Instant,
    last_sample: Instant,
}

impl ProgressState {
    pub fn new(bytes_target: u64) -> Self {
        Self::starting_at(bytes_target, Instant::now())
    }

    pub fn starting_at(bytes_target: u64, now: Instant) -> Self {
        Self { bytes_target, bytes_processed: 0, started: now, last_sample: now }
    }

    pub fn bytes_target(&self) -> u64 {
        self.bytes_target
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn advance(&mut self, bytes: u64) {
        self.advance_at(bytes, Instant::now());
    }

    /// Adds processed bytes; the counter never moves backwards and never
    /// passes the target.
    pub fn advance_at(&mut self, bytes: u64, now: Instant) {
        self.bytes_processed = self.bytes_processed.saturating_add(bytes).min(self.bytes_target);
        self.last_sample = now;
    }

    /// Percentage in `0..=100`.
    pub fn percent(&self) -> u8 {
        if self.bytes_target == 0 {
            return 0;
        }
        ((self.bytes_processed as u128 * 100) / self.bytes_target as u128) as u8
    }

    pub fn eta_seconds(&self) -> Option<u64> {
        self.eta_seconds_at(Instant::now())
    }

    pub fn eta_seconds_at(&self, now: Instant) -> Option<u64> {
        if self.bytes_processed == 0 || now.duration_since(self.last_sample) > STALE_AFTER {
            return None;
        }
        let elapsed = self.last_sample.duration_since(self.started).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let rate = self.bytes_processed as f64 / elapsed;
        let remaining = self.bytes_target.saturating_sub(self.bytes_processed) as f64;
        Some((remaining / rate).ceil() as u64)
    }
}

pub fn format_eta(eta: Option<u64>) -> String {
    match eta {
        None => "--:--".to_string(),
        Some(secs) if secs >= 3600 => format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60),
        Some(secs) => format!("{:02}:{:02}", secs / 60, secs % 60),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub queue: Vec<String>,
    pub active_job: Option<String>,
    pub status_message: String,
    pub progress: u8,
    pub eta: String,
}

#[derive(Debug)]
pub struct StatusBoard {
    status: watch::Sender<StatusSnapshot>,
    log: broadcast::Sender<String>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (status, _) = watch::channel(StatusSnapshot { eta: format_eta(None), ..Default::default() });
        let (log, _) = broadcast::channel(LOG_CAPACITY);
        Self { status, log }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn subscribe_log(&self) -> broadcast::Receiver<String> {
        self.log.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn set_queue(&self, queue: Vec<String>, active_job: Option<String>) {
        self.status.send_modify(|s| {
            s.queue = queue;
            s.active_job = active_job;
        });
    }

    pub fn set_status(&self, message: impl Into<String>) {
        let message = message.into();
        self.log(&message);
        self.status.send_modify(|s| s.status_message = message);
    }

    pub fn set_progress(&self, progress: &ProgressState) {
        let percent = progress.percent();
        let eta = format_eta(progress.eta_seconds());
        self.status.send_modify(|s| {
            s.progress = percent;
            s.eta = eta;
        });
    }

    pub fn clear_progress(&self) {
        self.status.send_modify(|s| {
            s.progress = 0;
            s.eta = format_eta(None);
        });
    }

    /// Appends a line to the debug stream. Having no listener is fine.
    pub fn log(&self, line: &str) {
        tracing::debug!(target: "nas_mirror::status", "{line}");
        let _ = self.log.send(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_bytes_are_clamped_and_monotonic() {
        let t0 = Instant::now();
        let mut p = ProgressState::starting_at(1000, t0);
        p.advance_at(400, t0 + Duration::from_secs(4));
        assert_eq!(p.percent(), 40);
        p.advance_at(5000, t0 + Duration::from_secs(5));
        assert_eq!(p.bytes_processed(), 1000);
        assert_eq!(p.percent(), 100);
    }

    #[test]
    fn eta_from_average_rate() {
        let t0 = Instant::now();
        let mut p = ProgressState::starting_at(1000, t0);
        assert_eq!(p.eta_seconds_at(t0), None);
        p.advance_at(250, t0 + Duration::from_secs(10));
        // 25 B/s with 750 B to go.
        assert_eq!(p.eta_seconds_at(t0 + Duration::from_secs(10)), Some(30));
    }

    #[test]
    fn stale_sample_resets_eta() {
        let t0 = Instant::now();
        let mut p = ProgressState::starting_at(1000, t0);
        p.advance_at(100, t0 + Duration::from_secs(1));
        assert!(p.eta_seconds_at(t0 + Duration::from_secs(2)).is_some());
        assert_eq!(p.eta_seconds_at(t0 + Duration::from_secs(60)), None);
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(None), "--:--");
        assert_eq!(format_eta(Some(75)), "01:15");
        assert_eq!(format_eta(Some(3725)), "1:02:05");
    }

    #[tokio::test]
    async fn board_publishes_status_and_log() {
        let board = StatusBoard::new();
        let mut status = board.subscribe();
        let mut log = board.subscribe_log();

        board.set_status("Downloading a.jpg");
        status.changed().await.unwrap();
        assert_eq!(status.borrow().status_message, "Downloading a.jpg");
        assert_eq!(log.recv().await.unwrap(), "Downloading a.jpg");

        board.set_queue(vec!["backup:/b".into()], Some("backup:/a".into()));
        assert_eq!(board.snapshot().active_job.as_deref(), Some("backup:/a"));
        assert_eq!(board.snapshot().queue, vec!["backup:/b".to_string()]);
    }
}
