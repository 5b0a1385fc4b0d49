//! Remote asset repository client.
//!
//! The repository is a hierarchical store addressed by citable identifiers and reached
//! through a query/execute RPC pair. Implementations: [`http::HttpRepository`] for a
//! live server and, with the `testing` feature, an in-process `memory::MemoryRepository`
//! test double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;
use tokio::io::AsyncWrite;

use crate::utils::Cid;

pub mod http;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
mod query;

pub use query::{Action, Filter, Query, QueryResult};

/// Remote service names.
pub mod services {
    pub const ASSET_GET: &str = "asset.get";
    pub const ASSET_SET: &str = "asset.set";
    pub const ASSET_IDENTIFIER_GET: &str = "asset.identifier.get";
    pub const DICOM_INGEST: &str = "dicom.ingest";
    pub const DERIVATION_CREATE: &str = "dataset.derivation.create";
    pub const CHECKSUM_GENERATE: &str = "dicom.pixel-data.checksum.generate";
    pub const METADATA_EXTRACT: &str = "dicom.metadata.extract";
    pub const LOGON: &str = "system.logon";
    pub const LOGOFF: &str = "system.logoff";
}

/// Attribute paths of the asset documents the upload engine reads and writes.
pub mod paths {
    /// SOPInstanceUID (0008,0018) as populated by metadata extraction
    pub const SOP_INSTANCE_UID: &str = "meta/dicom-dataset/object/00080018";
    /// AccessionNumber (0008,0050) as populated by metadata extraction
    pub const ACCESSION_NUMBER: &str = "meta/dicom-dataset/object/00080050";
    pub const SERIES_UID: &str = "meta/dicom-series/uid";
    pub const NOTE: &str = "meta/note/note";
    pub const OBJECT_NAME: &str = "meta/object/name";
    pub const METHOD_ID: &str = "meta/derivation/method/id";
    pub const METHOD_STEP: &str = "meta/derivation/method/step";
    pub const PIXEL_DATA_CHECKSUM: &str = "meta/pixel-data-checksum";
}

/// MIME type of the archive container used as upload body.
pub const ARCHIVE_MIME_TYPE: &str = "application/gzip";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RepositoryError {
    /// HTTP request failed
    Http { source: reqwest::Error },

    #[snafu(display("server responded with status {status}: {body}"))]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// Could not encode or decode a message
    Json { source: serde_json::Error },

    #[snafu(display("service error: {message}"))]
    Service { message: String },

    /// Generating the service input failed
    Input { source: InputError },

    #[snafu(display("query returned {found} where {expected} were expected"))]
    UnexpectedResult {
        expected: &'static str,
        found: &'static str,
    },
}

/// Failure while a [`GeneratedInput`] copies itself to the outbound stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InputError {
    /// The producer of the input stream failed
    ProducerFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The producer of the input stream panicked
    ProducerPanicked { source: tokio::task::JoinError },

    /// Could not write the input stream
    WriteInput { source: std::io::Error },
}

/// A stored object and its metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: u64,
    pub cid: Cid,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub lock: bool,
}

impl Asset {
    /// Value at a `meta/...` attribute path.
    pub fn value(&self, path: &str) -> Option<&Value> {
        let path = path.strip_prefix("meta/")?;
        lookup(&self.meta, path)
    }

    /// String form of a scalar value at `path`.
    pub fn string(&self, path: &str) -> Option<String> {
        self.value(path).and_then(query::scalar_string)
    }
}

/// Walks a `/`-separated key path through nested JSON objects.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .try_fold(value, |v, key| v.get(key))
}

/// Upload body attached to an execute call, generated on demand.
#[async_trait]
pub trait GeneratedInput: Send {
    /// Streams the whole input into `out`.
    async fn copy_to(
        self: Box<Self>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), InputError>;
}

pub struct ServiceInput {
    pub mime_type: String,
    /// Entry name, usually the source file name
    pub name: String,
    pub source: Box<dyn GeneratedInput>,
}

impl std::fmt::Debug for ServiceInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInput")
            .field("mime_type", &self.mime_type)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Query/execute RPC interface of the repository.
///
/// Calls are issued strictly sequentially by the upload engine.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn query(&self, query: &Query) -> Result<QueryResult, RepositoryError>;

    async fn execute(
        &self,
        service: &str,
        args: Value,
        input: Option<ServiceInput>,
    ) -> Result<Value, RepositoryError>;
}

#[async_trait]
impl<R: Repository + ?Sized> Repository for std::sync::Arc<R> {
    async fn query(&self, query: &Query) -> Result<QueryResult, RepositoryError> {
        (**self).query(query).await
    }

    async fn execute(
        &self,
        service: &str,
        args: Value,
        input: Option<ServiceInput>,
    ) -> Result<Value, RepositoryError> {
        (**self).execute(service, args, input).await
    }
}
