use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use snafu::Report;
use tracing::{error, info};
use walkdir::WalkDir;

use super::{FileOutcome, Uploader};
use crate::error::{Error, Result};
use crate::repository::Repository;

/// What a failed file does to the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort on the first failure and report it
    #[default]
    StopOnError,
    /// Log and count failures and keep going
    ContinueOnError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub ingested: usize,
    pub created: usize,
    pub already_present: usize,
    pub not_imaging: usize,
    /// Failed files with the rendered error chain
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchSummary {
    fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::NotImaging => self.not_imaging += 1,
            FileOutcome::AlreadyPresent { .. } => self.already_present += 1,
            FileOutcome::Ingested { .. } => self.ingested += 1,
            FileOutcome::Created { .. } => self.created += 1,
        }
    }

    pub fn uploaded(&self) -> usize {
        self.ingested + self.created
    }

    pub fn attempted(&self) -> usize {
        self.uploaded() + self.already_present + self.failed.len()
    }

    /// Fails if any file failed under [`FailurePolicy::ContinueOnError`].
    pub fn check(&self) -> Result<()> {
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(Error::BatchFailed {
                failed: self.failed.len(),
                attempted: self.attempted(),
            })
        }
    }
}

/// Walks input paths and uploads every regular file.
pub struct BatchDriver<'a, R> {
    uploader: &'a Uploader<R>,
    policy: FailurePolicy,
    progress: ProgressBar,
}

impl<'a, R: Repository> BatchDriver<'a, R> {
    pub fn new(uploader: &'a Uploader<R>, policy: FailurePolicy) -> Self {
        BatchDriver {
            uploader,
            policy,
            progress: ProgressBar::hidden(),
        }
    }

    /// Shows a spinner with the current file while the batch runs.
    pub fn with_progress(mut self) -> Self {
        let progress = ProgressBar::new_spinner();
        progress.set_style(
            ProgressStyle::default_spinner()
                .template("[{elapsed_precise}] {spinner} {pos} files {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        progress.enable_steady_tick(Duration::from_millis(120));
        self.progress = progress;
        self
    }

    pub async fn run(&self, inputs: &[PathBuf]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for input in inputs {
            // lexical order within each directory
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().unwrap_or(input).to_path_buf();
                        self.fail(&mut summary, &path, Error::Walk { source: e })?;
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                self.progress.set_message(path.display().to_string());
                match self.uploader.upload_file(path).await {
                    Ok(outcome) => summary.record(&outcome),
                    Err(e) => self.fail(&mut summary, path, e)?,
                }
                self.progress.inc(1);
            }
        }
        self.progress.finish_and_clear();

        info!(
            "Ingested {}, created {}, already present {}, not imaging {}, failed {}",
            summary.ingested,
            summary.created,
            summary.already_present,
            summary.not_imaging,
            summary.failed.len()
        );
        Ok(summary)
    }

    fn fail(&self, summary: &mut BatchSummary, path: &Path, e: Error) -> Result<()> {
        match self.policy {
            FailurePolicy::StopOnError => {
                self.progress.finish_and_clear();
                Err(e)
            }
            FailurePolicy::ContinueOnError => {
                let report = Report::from_error(e).to_string();
                error!(
                    "Failed to upload {} into {}: {}",
                    path.display(),
                    self.uploader.scope(),
                    report
                );
                summary.failed.push((path.to_path_buf(), report));
                Ok(())
            }
        }
    }
}
