use serde::Serialize;
use tracing::info;

use crate::upload::UploadReport;

/// Running counters for one run. Purely observational.
///
/// `processed` counts every item pulled into a flushed batch, before
/// validation and regardless of whether encoding succeeded, so the success
/// rate reads as "share of flushed items that made it into both sinks".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressTracker {
    pub batches: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub upserted: u64,
    pub invalid: u64,
    pub encode_failures: u64,
    pub transient_skips: u64,
    pub undeliverable: u64,
}

impl ProgressTracker {
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.processed as f64
        }
    }

    pub fn record_upload(&mut self, batch_len: usize, report: &UploadReport) {
        self.batches += 1;
        self.processed += batch_len as u64;
        self.succeeded += report.ledgered as u64;
        self.upserted += report.upserted as u64;
        self.invalid += report.invalid as u64;
        self.log_line();
    }

    pub fn record_encode_failure(&mut self, batch_len: usize) {
        self.batches += 1;
        self.encode_failures += 1;
        self.processed += batch_len as u64;
        self.log_line();
    }

    pub fn record_transient_skip(&mut self) {
        self.transient_skips += 1;
    }

    pub fn record_undeliverable(&mut self) {
        self.undeliverable += 1;
    }

    fn log_line(&self) {
        info!(
            success_rate = %format!("{:.2}", self.success_rate()),
            processed = self.processed,
            inserted = self.succeeded,
            batches = self.batches,
            "progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadPath;

    fn report(valid: usize, upserted: usize, ledgered: usize) -> UploadReport {
        UploadReport {
            valid,
            invalid: 0,
            upserted,
            ledgered,
            path: UploadPath::Bulk,
        }
    }

    #[test]
    fn rate_is_zero_before_any_batch() {
        assert_eq!(ProgressTracker::default().success_rate(), 0.0);
    }

    #[test]
    fn encode_failures_count_as_processed() {
        let mut p = ProgressTracker::default();
        p.record_upload(32, &report(32, 32, 32));
        p.record_encode_failure(32);
        assert_eq!(p.processed, 64);
        assert_eq!(p.succeeded, 32);
        assert!((p.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn succeeded_tracks_ledgered_not_upserted() {
        let mut p = ProgressTracker::default();
        p.record_upload(10, &report(10, 10, 0));
        assert_eq!((p.upserted, p.succeeded), (10, 0));
    }
}
