//! Per-file upload pipeline.
//!
//! A file is decoded, its identifiers validated and looked up in the repository.
//! Already stored instances are skipped (optionally after a checksum comparison),
//! new ones get their patient identity remapped and are either ingested as a new
//! study or created next to the first imported dataset of their series.

use std::path::{Path, PathBuf};

use snafu::prelude::*;
use tracing::info;

use crate::dataset::ImagingFile;
use crate::error::{DecodeTaskSnafu, Result};
use crate::patient_map::PatientIdMap;
use crate::repository::Repository;
use crate::utils::Cid;

pub mod anchor;
pub mod archive;
pub mod batch;
pub mod checksum;
pub mod dedup;
pub mod ingest;
pub mod metadata;

pub use anchor::Strategy;
pub use batch::{BatchDriver, BatchSummary, FailurePolicy};
pub use dedup::DedupMatch;
pub use ingest::IngestOptions;

/// Result of processing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Not a DICOM file
    NotImaging,
    AlreadyPresent { dataset: Cid },
    /// Imported as a new study
    Ingested { study: Cid, dataset: Cid },
    /// Added to the study of an existing series
    Created { study: Cid, dataset: Cid },
}

/// Uploads single files into one project scope.
pub struct Uploader<R> {
    repository: R,
    scope: Cid,
    patient_ids: PatientIdMap,
    verify_checksum: bool,
    compression_level: u32,
}

impl<R: Repository> Uploader<R> {
    pub fn new(repository: R, scope: Cid, patient_ids: PatientIdMap) -> Self {
        Uploader {
            repository,
            scope,
            patient_ids,
            verify_checksum: false,
            compression_level: archive::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Compare checksums of already stored instances and record them for new ones.
    pub fn verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn scope(&self) -> &Cid {
        &self.scope
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn into_repository(self) -> R {
        self.repository
    }

    pub async fn upload_file(&self, path: &Path) -> Result<FileOutcome> {
        info!("Uploading file {}", path.display());
        let owned: PathBuf = path.to_path_buf();
        let opened = tokio::task::spawn_blocking(move || ImagingFile::open(&owned))
            .await
            .context(DecodeTaskSnafu)??;
        let Some(mut file) = opened else {
            info!("Ignoring non-DICOM file {}", path.display());
            return Ok(FileOutcome::NotImaging);
        };

        let ids = file.normalize()?;
        if let DedupMatch::One(dataset) =
            dedup::resolve(&self.repository, &self.scope, &ids).await?
        {
            info!(
                "{} (SOPInstanceUID {}) is already stored as dataset {}",
                path.display(),
                ids.sop_instance_uid,
                dataset
            );
            if self.verify_checksum {
                checksum::verify(&self.repository, &dataset, &file).await?;
            }
            return Ok(FileOutcome::AlreadyPresent { dataset });
        }

        let patient_id = self.patient_ids.lookup(&ids.accession_number)?;
        file.set_patient(self.scope.as_str(), patient_id);

        let options = IngestOptions {
            compression_level: self.compression_level,
            generate_checksum: self.verify_checksum,
        };
        match anchor::select_strategy(&self.repository, &self.scope, &ids.series_instance_uid)
            .await?
        {
            Strategy::FullStudyIngest => {
                let (study, dataset) =
                    ingest::full_study_ingest(&self.repository, &self.scope, file, options)
                        .await?;
                Ok(FileOutcome::Ingested { study, dataset })
            }
            Strategy::IncrementalCreate { anchor } => {
                let (study, dataset) =
                    ingest::incremental_create(&self.repository, &anchor, file, options).await?;
                Ok(FileOutcome::Created { study, dataset })
            }
        }
    }
}
