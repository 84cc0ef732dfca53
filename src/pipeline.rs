//! The ingestion loop: candidates → fetch → batch → encode → dual-sink upload,
//! followed by a single deletion sweep once the candidate stream is drained.
//!
//! Everything runs sequentially on one task; at most one batch of image bytes
//! is alive at a time.

use anyhow::Result;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::batch::{Accepted, BatchAccumulator, PendingItem, TrailingBatch};
use crate::catalog::CandidateSource;
use crate::encoder::{check_dimensions, Encoder};
use crate::fetch::{FetchError, ImageFetcher};
use crate::progress::ProgressTracker;
use crate::sweep::{DeletionSweep, ItemDeleter, SweepOutcome};
use crate::upload::DualSinkUploader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Streaming,
    Drained,
    Sweeping,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub progress: ProgressTracker,
    pub sweep: SweepOutcome,
    /// Items left in a partial batch and dropped by `TrailingBatch::Drop`.
    pub dropped_trailing: usize,
    pub state: RunState,
}

pub struct Pipeline<'a> {
    pub source: &'a dyn CandidateSource,
    pub fetcher: &'a dyn ImageFetcher,
    pub encoder: &'a dyn Encoder,
    pub uploader: &'a DualSinkUploader<'a>,
    pub deleter: &'a dyn ItemDeleter,
    pub batch_size: usize,
    pub trailing: TrailingBatch,
}

fn advance(state: &mut RunState, next: RunState) {
    debug!(from = ?*state, to = ?next, "run state");
    *state = next;
}

impl<'a> Pipeline<'a> {
    /// Runs until the candidate stream is exhausted. Only a catalog error
    /// makes this return `Err`; every other failure is absorbed and counted.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut state = RunState::Init;
        let mut acc = BatchAccumulator::new(self.batch_size);
        let mut progress = ProgressTracker::default();

        let mut rows = self.source.candidates();
        advance(&mut state, RunState::Streaming);
        while let Some(next) = rows.next().await {
            let item = match next {
                Ok(item) => item,
                Err(e) => {
                    advance(&mut state, RunState::Failed);
                    return Err(e.context("catalog query failed; aborting run"));
                }
            };

            let fetched = match item.image_location.as_deref().map(str::trim) {
                Some(url) if !url.is_empty() => self.fetcher.fetch(url).await,
                _ => Err(FetchError::Transient("no image url".into())),
            };
            if let Err(e) = &fetched {
                debug!(vinted_id = %item.vinted_id, error = %e, "image fetch failed");
            }

            match acc.accept(item, fetched) {
                Accepted::Buffered { full: true } => {
                    let batch = acc.flush();
                    self.flush(batch, &mut progress).await;
                }
                Accepted::Buffered { full: false } => {}
                Accepted::Skipped => progress.record_transient_skip(),
                Accepted::Undeliverable => progress.record_undeliverable(),
            }
        }
        drop(rows);
        advance(&mut state, RunState::Drained);

        let mut dropped_trailing = 0;
        let trailing = acc.flush();
        if !trailing.is_empty() {
            match self.trailing {
                TrailingBatch::Flush => self.flush(trailing, &mut progress).await,
                TrailingBatch::Drop => {
                    dropped_trailing = trailing.len();
                    warn!(items = dropped_trailing, "dropping trailing partial batch");
                }
            }
        }

        advance(&mut state, RunState::Sweeping);
        let undeliverable = acc.into_undeliverable();
        let sweep = DeletionSweep::new(self.deleter).run(&undeliverable).await;
        advance(&mut state, RunState::Done);

        info!(
            success_rate = %format!("{:.2}", progress.success_rate()),
            processed = progress.processed,
            inserted = progress.succeeded,
            invalid = progress.invalid,
            encode_failures = progress.encode_failures,
            transient_skips = progress.transient_skips,
            undeliverable = progress.undeliverable,
            sweep = ?sweep,
            "run finished"
        );
        Ok(RunSummary {
            progress,
            sweep,
            dropped_trailing,
            state,
        })
    }

    async fn flush(&self, batch: Vec<PendingItem>, progress: &mut ProgressTracker) {
        let images: Vec<_> = batch.iter().map(|p| p.image.clone()).collect();
        let encoded = self.encoder.encode(&images).await.and_then(|vectors| {
            anyhow::ensure!(
                vectors.len() == batch.len(),
                "encoder returned {} vectors for {} images",
                vectors.len(),
                batch.len()
            );
            check_dimensions(&vectors, self.encoder.dimension())?;
            Ok(vectors)
        });
        drop(images);

        match encoded {
            Ok(vectors) => {
                let report = self.uploader.upload(&batch, vectors).await;
                debug!(?report, "batch uploaded");
                progress.record_upload(batch.len(), &report);
            }
            Err(e) => {
                warn!(items = batch.len(), error = %format!("{e:#}"), "encoding failed; discarding batch");
                progress.record_encode_failure(batch.len());
            }
        }
    }
}
