use super::health::Health;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A point-in-time view of a torrent's progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentStatus {
    /// Verified fraction in `0.0..=1.0`.
    pub progress: f64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Seeds: connected peers with every piece, or the tracker's count when
    /// larger.
    pub seeds: u32,
    pub peers: u32,
    pub verified_pieces: u32,
    pub total_pieces: u32,
}

impl TorrentStatus {
    pub fn health(&self) -> Health {
        Health::from_counts(self.seeds, self.peers)
    }
}

/// Bytes per second over a sliding window.
pub(crate) struct RateMeter {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&self, now: Instant, bytes: u64) {
        let mut samples = self.samples.lock();
        samples.push_back((now, bytes));
        Self::prune(&mut samples, now, self.window);
    }

    pub fn rate(&self) -> u64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&self, now: Instant) -> u64 {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.window);
        let total: u64 = samples.iter().map(|(_, b)| b).sum();
        (total as f64 / self.window.as_secs_f64()) as u64
    }

    fn prune(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some((at, _)) = samples.front() {
            if now.saturating_duration_since(*at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}
