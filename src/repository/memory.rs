//! In-process repository with the same query and service semantics as the server.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dicom_core::header::Tag;
use dicom_dictionary_std::tags;
use dicom_object::DefaultDicomObject;
use flate2::read::GzDecoder;
use serde_json::{json, Map, Value};
use snafu::prelude::*;

use super::{
    paths, services, Action, Asset, InputSnafu, Query, QueryResult, Repository, RepositoryError,
    ServiceInput, ServiceSnafu,
};
use crate::upload::checksum::{self, ChecksumRecord};
use crate::utils::{clean_value, Cid};

/// Attributes copied into `dicom-dataset/object` by metadata extraction.
const EXTRACTED_TAGS: [Tag; 9] = [
    tags::SOP_INSTANCE_UID,
    tags::ACCESSION_NUMBER,
    tags::STUDY_INSTANCE_UID,
    tags::SERIES_INSTANCE_UID,
    tags::SERIES_NUMBER,
    tags::INSTANCE_NUMBER,
    tags::MODALITY,
    tags::PATIENT_ID,
    tags::PATIENT_NAME,
];

#[derive(Debug, Default)]
struct State {
    assets: Vec<Asset>,
    next_id: u64,
    /// Uploaded DICOM files by dataset
    content: HashMap<Cid, Vec<u8>>,
    calls: Vec<String>,
    /// Services that fail on purpose
    failing: Vec<String>,
}

impl State {
    fn add(&mut self, cid: Cid, meta: Value) -> &Asset {
        self.next_id += 1;
        self.assets.push(Asset {
            id: self.next_id,
            cid,
            meta,
            lock: false,
        });
        &self.assets[self.assets.len() - 1]
    }

    fn asset(&self, cid: &Cid) -> Result<&Asset, RepositoryError> {
        self.assets
            .iter()
            .find(|a| a.cid == *cid)
            .with_context(|| ServiceSnafu {
                message: format!("asset {} does not exist", cid),
            })
    }

    fn asset_mut(&mut self, cid: &Cid) -> Result<&mut Asset, RepositoryError> {
        self.assets
            .iter_mut()
            .find(|a| a.cid == *cid)
            .with_context(|| ServiceSnafu {
                message: format!("asset {} does not exist", cid),
            })
    }

    fn next_child(&self, parent: &Cid) -> Cid {
        let last = self
            .assets
            .iter()
            .filter(|a| a.cid.is_child_of(parent))
            .map(|a| a.cid.ordinal())
            .max()
            .unwrap_or_default();
        parent.child(last + 1)
    }
}

/// Recursively merges `patch` into `target`, replacing scalars and arrays.
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn arg_cid(args: &Value, key: &str) -> Result<Cid, RepositoryError> {
    args.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .with_context(|| ServiceSnafu {
            message: format!("argument {} missing or invalid", key),
        })
}

fn parse_archive(body: &[u8]) -> Result<(Vec<u8>, DefaultDicomObject), RepositoryError> {
    let mut content = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut content)
        .map_err(|e| RepositoryError::Service {
            message: format!("invalid archive: {}", e),
        })?;
    let object = content
        .get(128..)
        .filter(|rest| rest.starts_with(b"DICM"))
        .context(ServiceSnafu {
            message: "archive entry is not a DICOM file",
        })
        .and_then(|rest| {
            dicom_object::from_reader(rest).map_err(|e| RepositoryError::Service {
                message: format!("invalid DICOM content: {}", e),
            })
        })?;
    Ok((content, object))
}

fn element_string(object: &DefaultDicomObject, tag: Tag) -> Option<String> {
    object
        .get(tag)
        .and_then(|e| e.to_str().ok())
        .and_then(|s| clean_value(&s))
}

/// Repository held in memory.
///
/// Ingests files into one study per StudyInstanceUID below the target project and creates
/// datasets carrying a derivation method but no note, the way the server's ingest
/// engine does.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository with one empty project.
    pub fn with_project(project: &Cid) -> Self {
        let repository = Self::new();
        repository.seed(project.clone(), json!({ "object": { "name": "project" } }));
        repository
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an asset as if it had been created earlier.
    pub fn seed(&self, cid: Cid, meta: Value) {
        self.state().add(cid, meta);
    }

    pub fn set_lock(&self, cid: &Cid, lock: bool) {
        if let Ok(asset) = self.state().asset_mut(cid) {
            asset.lock = lock;
        }
    }

    /// Makes every later call of `service` fail.
    pub fn fail_service(&self, service: &str) {
        self.state().failing.push(service.to_string());
    }

    pub fn assets(&self) -> Vec<Asset> {
        self.state().assets.clone()
    }

    pub fn asset(&self, cid: &Cid) -> Option<Asset> {
        self.state().asset(cid).ok().cloned()
    }

    /// Names of the services called so far, in order.
    pub fn service_calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of calls that carried an upload body.
    pub fn upload_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|s| *s == services::DICOM_INGEST || *s == services::DERIVATION_CREATE)
            .count()
    }

    /// Uploaded DICOM file of a dataset.
    pub fn content(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.state().content.get(cid).cloned()
    }

    fn ingest(&self, args: &Value, body: &[u8]) -> Result<Value, RepositoryError> {
        let project = arg_cid(args, "cid")?;
        let (content, object) = parse_archive(body)?;
        let study_uid = element_string(&object, tags::STUDY_INSTANCE_UID);
        let series_uid = element_string(&object, tags::SERIES_INSTANCE_UID);

        let mut state = self.state();
        state.asset(&project)?;
        let existing = state
            .assets
            .iter()
            .find(|a| {
                a.cid.is_child_of(&project)
                    && study_uid.is_some()
                    && a.string("meta/dicom-study/uid") == study_uid
            })
            .map(|a| (a.id, a.cid.clone()));
        let (study_id, study) = match existing {
            Some(study) => study,
            None => {
                let cid = state.next_child(&project);
                let asset = state.add(cid, json!({ "dicom-study": { "uid": study_uid } }));
                (asset.id, asset.cid.clone())
            }
        };

        let dataset = state.next_child(&study);
        state.add(
            dataset.clone(),
            json!({
                "dicom-series": { "uid": series_uid },
                "derivation": { "method": { "id": project.child(1).to_string(), "step": "1" } },
            }),
        );
        state.content.insert(dataset, content);
        Ok(json!({ "study": { "id": study_id } }))
    }

    fn create_derivation(&self, args: &Value, body: &[u8]) -> Result<Value, RepositoryError> {
        let parent = arg_cid(args, "pid")?;
        let (content, _) = parse_archive(body)?;

        let mut meta = json!({
            "object": {},
            "derivation": {
                "method": args.get("method").cloned().unwrap_or(Value::Null),
                "processed": args.get("processed").cloned().unwrap_or(Value::Bool(false)),
            },
        });
        for key in ["name", "description", "type"] {
            if let Some(value) = args.get(key) {
                meta["object"][key] = value.clone();
            }
        }
        if let Some(extra) = args.get("meta") {
            merge(&mut meta, extra);
        }

        let mut state = self.state();
        state.asset(&parent)?;
        let cid = state.next_child(&parent);
        state.add(cid.clone(), meta);
        state.content.insert(cid.clone(), content);
        Ok(json!({ "cid": cid }))
    }

    fn extract_metadata(&self, args: &Value) -> Result<Value, RepositoryError> {
        let cid = arg_cid(args, "cid")?;
        let mut state = self.state();
        let object = state
            .content
            .get(&cid)
            .map(|content| parse_stored(content))
            .transpose()?
            .context(ServiceSnafu {
                message: format!("dataset {} has no DICOM content", cid),
            })?;
        let mut extracted = Map::new();
        for tag in EXTRACTED_TAGS {
            if let Some(value) = element_string(&object, tag) {
                extracted.insert(format!("{:04X}{:04X}", tag.group(), tag.element()), json!(value));
            }
        }
        let asset = state.asset_mut(&cid)?;
        merge(
            &mut asset.meta,
            &json!({ "dicom-dataset": { "object": extracted } }),
        );
        Ok(json!({}))
    }

    fn generate_checksum(&self, args: &Value) -> Result<Value, RepositoryError> {
        let cid = arg_cid(args, "cid")?;
        let save = args.get("save").and_then(Value::as_bool).unwrap_or(false);
        let mut state = self.state();
        let Some(content) = state.content.get(&cid) else {
            return Ok(json!({}));
        };
        let object = parse_stored(content)?;
        let Some(digest) = checksum::pixel_data_digest(&object, false) else {
            return Ok(json!({}));
        };
        let record = ChecksumRecord {
            algorithm: checksum::ALGORITHM.to_string(),
            big_endian: false,
            digest,
        };
        if save {
            let asset = state.asset_mut(&cid)?;
            let path = paths::PIXEL_DATA_CHECKSUM.trim_start_matches("meta/");
            let mut patch = Map::new();
            patch.insert(path.to_string(), json!(record));
            merge(&mut asset.meta, &Value::Object(patch));
        }
        Ok(json!({ "checksum": record }))
    }

    fn set(&self, args: &Value) -> Result<Value, RepositoryError> {
        let cid = arg_cid(args, "cid")?;
        let mut state = self.state();
        let asset = state.asset_mut(&cid)?;
        if let Some(meta) = args.get("meta") {
            merge(&mut asset.meta, meta);
        }
        Ok(json!({}))
    }
}

fn parse_stored(content: &[u8]) -> Result<DefaultDicomObject, RepositoryError> {
    content
        .get(128..)
        .context(ServiceSnafu {
            message: "stored content is truncated",
        })
        .and_then(|rest| {
            dicom_object::from_reader(rest).map_err(|e| RepositoryError::Service {
                message: format!("invalid DICOM content: {}", e),
            })
        })
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn query(&self, query: &Query) -> Result<QueryResult, RepositoryError> {
        let state = self.state();
        let mut matched: Vec<&Asset> = state
            .assets
            .iter()
            .filter(|a| query.filter.matches(a))
            .collect();
        matched.sort_by(|a, b| a.cid.cmp(&b.cid));
        if let Some(size) = query.size {
            matched.truncate(size as usize);
        }
        Ok(match &query.action {
            Action::Count => QueryResult::Count(matched.len() as u64),
            Action::GetCid => QueryResult::Cids(matched.iter().map(|a| a.cid.clone()).collect()),
            Action::GetMeta => QueryResult::Assets(matched.into_iter().cloned().collect()),
            Action::GetValue { paths } => QueryResult::Values(
                matched
                    .iter()
                    .map(|a| paths.iter().map(|p| a.value(p).cloned()).collect())
                    .collect(),
            ),
        })
    }

    async fn execute(
        &self,
        service: &str,
        args: Value,
        input: Option<ServiceInput>,
    ) -> Result<Value, RepositoryError> {
        let body = match input {
            Some(input) => {
                let mut body = Vec::new();
                input.source.copy_to(&mut body).await.context(InputSnafu)?;
                Some(body)
            }
            None => None,
        };

        {
            let mut state = self.state();
            state.calls.push(service.to_string());
            if state.failing.iter().any(|s| s == service) {
                return ServiceSnafu {
                    message: format!("{} is unavailable", service),
                }
                .fail();
            }
        }

        let body = body.as_deref();
        match (service, body) {
            (services::DICOM_INGEST, Some(body)) => self.ingest(&args, body),
            (services::DERIVATION_CREATE, Some(body)) => self.create_derivation(&args, body),
            (services::DICOM_INGEST | services::DERIVATION_CREATE, None) => ServiceSnafu {
                message: format!("{} requires an input", service),
            }
            .fail(),
            (services::ASSET_GET, _) => {
                let cid = arg_cid(&args, "cid")?;
                let state = self.state();
                Ok(json!({ "asset": state.asset(&cid)? }))
            }
            (services::ASSET_SET, _) => self.set(&args),
            (services::ASSET_IDENTIFIER_GET, _) => {
                let id = args.get("id").and_then(Value::as_u64);
                let state = self.state();
                let asset = state
                    .assets
                    .iter()
                    .find(|a| Some(a.id) == id)
                    .context(ServiceSnafu {
                        message: format!("no asset with id {:?}", id),
                    })?;
                Ok(json!({ "cid": asset.cid }))
            }
            (services::METADATA_EXTRACT, _) => self.extract_metadata(&args),
            (services::CHECKSUM_GENERATE, _) => self.generate_checksum(&args),
            (services::LOGON, _) => Ok(json!({ "session": "memory" })),
            (services::LOGOFF, _) => Ok(json!({})),
            _ => ServiceSnafu {
                message: format!("unknown service {}", service),
            }
            .fail(),
        }
    }
}
