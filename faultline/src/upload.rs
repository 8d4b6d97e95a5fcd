//! The Uploader: drives `Pending` reports through their upload lifecycle
//! against an HTTP collector.
//!
//! Each attempt is a blocking multipart POST carrying the dump artifact and
//! the annotations. Outcome classification is deliberately coarse: 2xx is
//! done, 4xx is the collector telling us to stop, everything else is worth
//! retrying with backoff until attempts run out.

use crate::{
    store::{CrashReport, ReportState, ReportStore},
    Error,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

pub struct UploadConfig {
    /// Collector endpoint reports are POSTed to
    pub url: String,
    /// Master switch; when false the uploader runs but transmits nothing,
    /// leaving reports `Pending`
    pub enabled: bool,
    /// Attempts after which a report is abandoned
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub base_delay: Duration,
    /// Retry delay ceiling
    pub max_delay: Duration,
    pub request_timeout: Duration,
    /// Worker threads running the upload loop; the store's per-record
    /// compare-and-swap keeps them from double-sending
    pub max_concurrent: usize,
    /// Maximum uploads started per rate window, unlimited when `None`
    pub rate_limit: Option<u32>,
    pub rate_window: Duration,
}

impl UploadConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(30),
            max_concurrent: 1,
            rate_limit: None,
            rate_window: Duration::from_secs(60),
        }
    }
}

/// Reads the user consent override. Present in the environment (any value)
/// means uploads are disabled; checked once at startup.
pub fn uploads_enabled_from_env() -> bool {
    std::env::var_os("FAULTLINE_UPLOADS_OFF").is_none()
}

enum Outcome {
    /// The collector accepted the report
    Delivered,
    /// Worth another attempt later
    Transient,
    /// Retrying cannot help: the collector rejected the report outright, or
    /// its artifact is gone
    Permanent,
}

struct RateWindow {
    started: Instant,
    count: u32,
}

pub struct Uploader {
    store: Arc<ReportStore>,
    config: UploadConfig,
    client: reqwest::blocking::Client,
    window: Mutex<RateWindow>,
}

impl Uploader {
    /// # Errors
    ///
    /// Fails only if the HTTP client cannot be constructed.
    pub fn new(store: Arc<ReportStore>, config: UploadConfig) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            store,
            config,
            client,
            window: Mutex::new(RateWindow {
                started: Instant::now(),
                count: 0,
            }),
        })
    }

    /// How many worker threads should run [`Self::run`]
    pub fn concurrency(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    /// Runs until `shutdown` is set, uploading eligible reports as their
    /// next-attempt times come due.
    ///
    /// An attempt already in flight when shutdown is requested runs to
    /// completion; a transient failure at that point simply leaves the
    /// report `Pending` for the next run.
    pub fn run(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            match self.process_one() {
                Ok(true) => {}
                Ok(false) => {
                    // Nothing eligible right now
                    idle(shutdown, Duration::from_millis(500));
                }
                Err(err) => {
                    log::error!("upload pass failed: {err}");
                    idle(shutdown, Duration::from_secs(1));
                }
            }
        }
    }

    /// Attempts the upload of at most one report.
    ///
    /// Returns whether any report was acted upon, so the caller knows
    /// whether to poll again immediately or idle.
    pub fn process_one(&self) -> Result<bool, Error> {
        if !self.config.enabled {
            return Ok(false);
        }

        let Some(report) = self.next_eligible() else {
            return Ok(false);
        };

        if !self.admit() {
            return Ok(false);
        }

        let report = match self.store.transition(
            report.id,
            ReportState::Pending,
            ReportState::Uploading,
        ) {
            Ok(report) => report,
            // Lost the race for this report; there may be others
            Err(Error::StaleState(_)) => return Ok(true),
            Err(err) => return Err(err),
        };

        match self.attempt(&report) {
            Outcome::Delivered => {
                self.store
                    .transition(report.id, ReportState::Uploading, ReportState::Uploaded)?;
                log::info!("uploaded report {}", report.id);
            }
            Outcome::Permanent => {
                self.store
                    .transition(report.id, ReportState::Uploading, ReportState::Abandoned)?;
                log::warn!("abandoned report {}: rejected by collector", report.id);
            }
            Outcome::Transient => {
                let attempts = report.attempts + 1;

                if attempts >= self.config.max_attempts {
                    self.store.bump_attempt(report.id, None)?;
                    self.store.transition(
                        report.id,
                        ReportState::Uploading,
                        ReportState::Abandoned,
                    )?;
                    log::warn!("abandoned report {} after {attempts} attempts", report.id);
                } else {
                    let delay = backoff_delay(&self.config, attempts);
                    let next = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_err| chrono::Duration::seconds(60));

                    self.store.bump_attempt(report.id, Some(next))?;
                    self.store.transition(
                        report.id,
                        ReportState::Uploading,
                        ReportState::Pending,
                    )?;
                    log::debug!(
                        "report {} attempt {attempts} failed, retrying in {delay:?}",
                        report.id
                    );
                }
            }
        }

        Ok(true)
    }

    /// The `Pending` report whose next-attempt time has passed, oldest
    /// schedule first
    fn next_eligible(&self) -> Option<CrashReport> {
        let now = Utc::now();

        self.store
            .list(ReportState::Pending)
            .into_iter()
            .filter(|report| report.next_attempt_at.map_or(true, |at| at <= now))
            .min_by_key(|report| (report.next_attempt_at, report.created_at))
    }

    /// Applies the rate limit, counting this call as an upload if admitted
    fn admit(&self) -> bool {
        let Some(limit) = self.config.rate_limit else {
            return true;
        };

        let mut window = self.window.lock();

        if window.started.elapsed() >= self.config.rate_window {
            window.started = Instant::now();
            window.count = 0;
        }

        if window.count >= limit {
            return false;
        }

        window.count += 1;
        true
    }

    fn attempt(&self, report: &CrashReport) -> Outcome {
        let artifact = match std::fs::read(&report.artifact) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("artifact for report {} is unreadable: {err}", report.id);
                return Outcome::Permanent;
            }
        };

        let mut form = reqwest::blocking::multipart::Form::new();
        for (key, value) in &report.annotations {
            form = form.text(key.clone(), value.clone());
        }

        let part = reqwest::blocking::multipart::Part::bytes(artifact)
            .file_name(format!("{}.dmp", report.id));
        form = form.part("dump", part);

        match self.client.post(&self.config.url).multipart(form).send() {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    Outcome::Delivered
                } else if status.is_client_error() {
                    Outcome::Permanent
                } else {
                    Outcome::Transient
                }
            }
            Err(err) => {
                log::debug!("upload of report {} failed: {err}", report.id);
                Outcome::Transient
            }
        }
    }
}

/// Sleeps in short slices so shutdown stays responsive
fn idle(shutdown: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;

    while !shutdown.load(Ordering::Relaxed) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// The delay before attempt `attempts + 1`: base doubling per attempt,
/// jittered, capped.
///
/// Jitter only ever lengthens a delay and the doubling outpaces the jitter
/// range, so the schedule is monotonically non-decreasing.
fn backoff_delay(config: &UploadConfig, attempts: u32) -> Duration {
    use rand::Rng;

    let exp = attempts.saturating_sub(1).min(31);
    let raw = config
        .base_delay
        .checked_mul(1u32 << exp)
        .unwrap_or(config.max_delay);

    if raw >= config.max_delay {
        return config.max_delay;
    }

    let jitter = raw.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
    (raw + jitter).min(config.max_delay)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let config = UploadConfig::new("http://localhost/collect");

        let mut previous = Duration::ZERO;
        for attempts in 1..=20 {
            let delay = backoff_delay(&config, attempts);
            assert!(delay >= previous, "attempt {attempts} shrank the delay");
            assert!(delay <= config.max_delay);
            previous = delay;
        }

        assert_eq!(backoff_delay(&config, 20), config.max_delay);
    }

    #[test]
    fn backoff_starts_at_base() {
        let config = UploadConfig::new("http://localhost/collect");

        let first = backoff_delay(&config, 1);
        assert!(first >= config.base_delay);
        assert!(first < config.base_delay * 2);
    }
}
