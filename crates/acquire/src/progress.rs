use std::time::Duration;
use tokio::time::Instant;

const PERCENT_STEP: f64 = 0.1;
const DETAIL_INTERVAL: Duration = Duration::from_millis(500);
const MB: f64 = 1024.0 * 1024.0;

/// Snapshot of a running download
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadState {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second since the previous snapshot
    pub speed_bps: f64,
    pub eta: Option<Duration>,
    pub percent: Option<f64>,
    pub complete: bool,
}

impl DownloadState {
    pub fn formatted_speed(&self) -> String {
        if self.complete {
            return "Complete".to_string();
        }
        let mbps = self.speed_bps / MB;
        if mbps >= 1.0 {
            format!("{:.2} MB/s", mbps)
        } else {
            format!("{:.0} KB/s", mbps * 1024.0)
        }
    }

    pub fn formatted_eta(&self) -> Option<String> {
        let secs = self.eta?.as_secs();
        Some(if secs >= 3600 {
            format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
        } else if secs >= 60 {
            format!("{}m {:02}s", secs / 60, secs % 60)
        } else {
            format!("{}s", secs)
        })
    }
}

type PercentCallback = Box<dyn FnMut(f64) + Send>;
type DetailCallback = Box<dyn FnMut(DownloadState) + Send>;

/// Progress callbacks for one acquisition.
///
/// The percent callback fires whenever the percentage moved by at least
/// 0.1 points. The detailed callback fires at most every 0.5 s and once
/// more when the transfer completes.
#[derive(Default)]
pub struct ProgressReporter {
    percent: Option<PercentCallback>,
    detailed: Option<DetailCallback>,
}

impl ProgressReporter {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn on_percent(mut self, callback: impl FnMut(f64) + Send + 'static) -> Self {
        self.percent = Some(Box::new(callback));
        self
    }

    pub fn on_detailed(mut self, callback: impl FnMut(DownloadState) + Send + 'static) -> Self {
        self.detailed = Some(Box::new(callback));
        self
    }

    pub(crate) fn report(&mut self, throttle: &mut ProgressThrottle, downloaded: u64, now: Instant) {
        if let Some(callback) = self.percent.as_mut() {
            if let Some(percent) = throttle.coarse(downloaded) {
                callback(percent);
            }
        }
        if let Some(callback) = self.detailed.as_mut() {
            if let Some(state) = throttle.detailed(downloaded, now) {
                callback(state);
            }
        }
    }

    pub(crate) fn complete(&mut self, throttle: &ProgressThrottle, downloaded: u64) {
        if let Some(callback) = self.detailed.as_mut() {
            callback(throttle.complete(downloaded));
        }
    }
}

/// Throttling state, driven by explicit instants
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    total: Option<u64>,
    last_percent: f64,
    last_detail_at: Instant,
    last_detail_bytes: u64,
}

impl ProgressThrottle {
    pub(crate) fn new(total: Option<u64>, started: Instant) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            last_percent: 0.0,
            last_detail_at: started,
            last_detail_bytes: 0,
        }
    }

    fn percent_of(&self, downloaded: u64) -> Option<f64> {
        self.total
            .map(|total| (downloaded as f64 * 100.0 / total as f64).min(100.0))
    }

    pub(crate) fn coarse(&mut self, downloaded: u64) -> Option<f64> {
        let percent = self.percent_of(downloaded)?;
        if percent - self.last_percent >= PERCENT_STEP {
            self.last_percent = percent;
            Some(percent)
        } else {
            None
        }
    }

    pub(crate) fn detailed(&mut self, downloaded: u64, now: Instant) -> Option<DownloadState> {
        let elapsed = now.saturating_duration_since(self.last_detail_at);
        if elapsed < DETAIL_INTERVAL {
            return None;
        }

        let delta = downloaded.saturating_sub(self.last_detail_bytes);
        let speed_bps = delta as f64 / elapsed.as_secs_f64();
        self.last_detail_at = now;
        self.last_detail_bytes = downloaded;

        let eta = match self.total {
            Some(total) if speed_bps > 0.0 => Some(Duration::from_secs_f64(
                total.saturating_sub(downloaded) as f64 / speed_bps,
            )),
            _ => None,
        };

        Some(DownloadState {
            bytes_downloaded: downloaded,
            total_bytes: self.total,
            speed_bps,
            eta,
            percent: self.percent_of(downloaded),
            complete: false,
        })
    }

    pub(crate) fn complete(&self, downloaded: u64) -> DownloadState {
        DownloadState {
            bytes_downloaded: downloaded,
            total_bytes: self.total,
            speed_bps: 0.0,
            eta: self.total.map(|_| Duration::ZERO),
            percent: self.total.map(|_| 100.0),
            complete: true,
        }
    }
}
