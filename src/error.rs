use std::path::PathBuf;

use dicom_core::header::Tag;
use snafu::prelude::*;

use crate::repository::RepositoryError;
use crate::utils::{describe_tag, Cid};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Could not load settings
    LoadSettings { source: config::ConfigError },

    #[snafu(display("invalid settings: {message}"))]
    InvalidSettings { message: String },

    #[snafu(display("could not read patient id map {}", path.display()))]
    ReadPatientIdMap {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("patient id map {} contains no mappings", path.display()))]
    EmptyPatientIdMap { path: PathBuf },

    #[snafu(display("could not open log file {}", path.display()))]
    OpenLogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not read DICOM file {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("could not probe file {}", path.display()))]
    Probe {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Could not walk input directory
    Walk { source: walkdir::Error },

    /// Background decoding task failed
    DecodeTask { source: tokio::task::JoinError },

    /// Error writing DICOM object to the archive stream
    WriteDataset {
        source: Box<dicom_object::WriteError>,
    },

    /// Unsupported file transfer syntax {uid}
    UnsupportedFileTransferSyntax { uid: String },

    /// Transcoding error
    Transcode {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("missing required attribute {} in {}", describe_tag(*tag), path.display()))]
    MissingIdentifier { path: PathBuf, tag: Tag },

    #[snafu(display("no patient id mapped to accession number {accession_number}"))]
    PatientIdNotFound { accession_number: String },

    #[snafu(display(
        "{} objects in {scope} match SOPInstanceUID {sop_instance_uid} and AccessionNumber {accession_number}: {}",
        cids.len(),
        join_cids(cids)
    ))]
    AmbiguousDuplicate {
        scope: Cid,
        sop_instance_uid: String,
        accession_number: String,
        cids: Vec<Cid>,
    },

    #[snafu(display(
        "pixel data checksum of {} does not match {cid} (local: {}, remote: {})",
        path.display(),
        local.as_deref().unwrap_or("none"),
        remote.as_deref().unwrap_or("none")
    ))]
    ChecksumMismatch {
        path: PathBuf,
        cid: Cid,
        local: Option<String>,
        remote: Option<String>,
    },

    #[snafu(display("repository call {service} failed"))]
    Repository {
        service: String,
        source: RepositoryError,
    },

    #[snafu(display("response of {service} lacks {field}"))]
    UnexpectedResponse { service: String, field: String },

    #[snafu(display("no newly ingested dataset found in study {study} for {}", path.display()))]
    IngestedDatasetMissing { study: Cid, path: PathBuf },

    #[snafu(display("dataset {cid} is locked"))]
    DatasetLocked { cid: Cid },

    #[snafu(display("series anchor {cid} has no parent study or derivation method"))]
    AnchorIncomplete { cid: Cid },

    #[snafu(display("{failed} of {attempted} files failed to upload"))]
    BatchFailed { failed: usize, attempted: usize },
}

fn join_cids(cids: &[Cid]) -> String {
    cids.iter()
        .map(Cid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure classes of a run, used for logging and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Io,
    MissingRequiredIdentifier,
    PatientIdNotFound,
    AmbiguousDuplicate,
    ChecksumMismatch,
    UploadStreamFailure,
    RepositoryCallFailure,
    /// Some files failed while the batch continued
    PartialFailure,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LoadSettings { .. }
            | Error::InvalidSettings { .. }
            | Error::ReadPatientIdMap { .. }
            | Error::EmptyPatientIdMap { .. }
            | Error::OpenLogFile { .. } => ErrorKind::Configuration,
            Error::ReadFile { .. }
            | Error::Probe { .. }
            | Error::Walk { .. }
            | Error::DecodeTask { .. }
            | Error::WriteDataset { .. }
            | Error::UnsupportedFileTransferSyntax { .. }
            | Error::Transcode { .. } => ErrorKind::Io,
            Error::MissingIdentifier { .. } => ErrorKind::MissingRequiredIdentifier,
            Error::PatientIdNotFound { .. } => ErrorKind::PatientIdNotFound,
            Error::AmbiguousDuplicate { .. } => ErrorKind::AmbiguousDuplicate,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::Repository {
                source: RepositoryError::Input { .. },
                ..
            } => ErrorKind::UploadStreamFailure,
            Error::Repository { .. }
            | Error::UnexpectedResponse { .. }
            | Error::IngestedDatasetMissing { .. }
            | Error::DatasetLocked { .. }
            | Error::AnchorIncomplete { .. } => ErrorKind::RepositoryCallFailure,
            Error::BatchFailed { .. } => ErrorKind::PartialFailure,
        }
    }

    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::MissingRequiredIdentifier => 3,
            ErrorKind::PatientIdNotFound => 4,
            ErrorKind::AmbiguousDuplicate => 5,
            ErrorKind::ChecksumMismatch => 6,
            ErrorKind::UploadStreamFailure => 7,
            ErrorKind::RepositoryCallFailure => 8,
            ErrorKind::Io | ErrorKind::PartialFailure => 1,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
