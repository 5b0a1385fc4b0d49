//! Repository calls that place a new instance and describe it.

use std::path::Path;

use serde_json::{json, Map, Value};
use snafu::prelude::*;
use tracing::{debug, info};

use super::archive::ArchiveInput;
use super::{checksum, metadata};
use crate::dataset::ImagingFile;
use crate::error::{
    AnchorIncompleteSnafu, DatasetLockedSnafu, IngestedDatasetMissingSnafu, RepositorySnafu,
    Result, UnexpectedResponseSnafu,
};
use crate::repository::{
    paths, services, Action, Asset, Filter, Query, QueryResult, Repository,
};
use crate::utils::Cid;

/// Ingest engine for DICOM archives.
pub const INGEST_ENGINE: &str = "nig.dicom";
pub const DATASET_TYPE: &str = "dicom/series";

/// Options shared by both placement strategies.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub compression_level: u32,
    /// Ask the repository to record the pixel data checksum of new datasets
    pub generate_checksum: bool,
}

async fn call<R: Repository + ?Sized>(repository: &R, service: &str, args: Value) -> Result<Value> {
    repository
        .execute(service, args, None)
        .await
        .context(RepositorySnafu { service })
}

fn response_cid(re: &Value, service: &str, field: &str) -> Result<Cid> {
    re.get(field)
        .and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .context(UnexpectedResponseSnafu { service, field })
}

fn source_note(path: &Path) -> String {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    format!("source: {}", path.display())
}

/// Imports the file as a new study and turns the created dataset into the series anchor.
///
/// Returns the study and dataset identifiers.
pub async fn full_study_ingest<R: Repository + ?Sized>(
    repository: &R,
    scope: &Cid,
    file: ImagingFile,
    options: IngestOptions,
) -> Result<(Cid, Cid)> {
    let path = file.path().to_path_buf();
    let attributes = file.attributes().clone();
    let input = ArchiveInput::for_file(file, options.compression_level).into_service_input();

    info!("Ingesting {} into {}", path.display(), scope);
    let args = json!({
        "cid": scope,
        "engine": INGEST_ENGINE,
        "anonymize": true,
        "compression-level": options.compression_level,
    });
    let re = repository
        .execute(services::DICOM_INGEST, args, Some(input))
        .await
        .context(RepositorySnafu {
            service: services::DICOM_INGEST,
        })?;
    let study_id = re
        .get("study")
        .and_then(|s| s.get("id"))
        .and_then(|id| match id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .context(UnexpectedResponseSnafu {
            service: services::DICOM_INGEST,
            field: "study/id",
        })?;

    let re = call(
        repository,
        services::ASSET_IDENTIFIER_GET,
        json!({ "id": study_id }),
    )
    .await?;
    let study = response_cid(&re, services::ASSET_IDENTIFIER_GET, "cid")?;

    let query = Query::new(
        Filter::child_of(&study).and(Filter::has_no_value(paths::NOTE)),
        Action::GetMeta,
    )
    .size(1);
    let dataset: Asset = repository
        .query(&query)
        .await
        .and_then(QueryResult::into_assets)
        .context(RepositorySnafu {
            service: "asset.query",
        })?
        .into_iter()
        .next()
        .context(IngestedDatasetMissingSnafu {
            study: study.clone(),
            path: &path,
        })?;
    ensure!(
        !dataset.lock,
        DatasetLockedSnafu {
            cid: dataset.cid.clone()
        }
    );

    if let Some(name) = metadata::study_name(&attributes) {
        rename_study(repository, &study, &name).await?;
    }

    let mut object = Map::new();
    if let Some(name) = metadata::dataset_name(&attributes) {
        object.insert("name".into(), json!(name));
    }
    if let Some(description) = metadata::dataset_description(&attributes) {
        object.insert("description".into(), json!(description));
    }
    call(
        repository,
        services::ASSET_SET,
        json!({
            "cid": dataset.cid,
            "meta": {
                "object": object,
                "derivation": { "processed": true },
                "note": { "note": source_note(&path) },
            }
        }),
    )
    .await?;

    describe_dataset(repository, &dataset.cid, options).await?;
    info!("Ingested {} as dataset {}", path.display(), dataset.cid);
    Ok((study, dataset.cid))
}

/// Sets study name and description unless the name already reads `name`.
async fn rename_study<R: Repository + ?Sized>(repository: &R, study: &Cid, name: &str) -> Result<()> {
    let re = call(repository, services::ASSET_GET, json!({ "cid": study })).await?;
    let current = re
        .get("asset")
        .and_then(|a| serde_json::from_value::<Asset>(a.clone()).ok())
        .and_then(|a| a.string(paths::OBJECT_NAME));
    if current.as_deref() == Some(name) {
        debug!("Study {} is already named {}", study, name);
        return Ok(());
    }
    call(
        repository,
        services::ASSET_SET,
        json!({
            "cid": study,
            "meta": { "object": { "name": name, "description": name } }
        }),
    )
    .await?;
    Ok(())
}

/// Creates a sibling dataset of the series anchor in the anchor's study.
pub async fn incremental_create<R: Repository + ?Sized>(
    repository: &R,
    anchor: &Asset,
    file: ImagingFile,
    options: IngestOptions,
) -> Result<(Cid, Cid)> {
    let incomplete = || AnchorIncompleteSnafu {
        cid: anchor.cid.clone(),
    };
    let study = anchor.cid.parent().with_context(incomplete)?;
    let method_id = anchor.string(paths::METHOD_ID).with_context(incomplete)?;
    let method_step = anchor.string(paths::METHOD_STEP).with_context(incomplete)?;

    let path = file.path().to_path_buf();
    let attributes = file.attributes().clone();
    let input = ArchiveInput::for_file(file, options.compression_level).into_service_input();

    let mut args = json!({
        "pid": study,
        "method": { "id": method_id, "step": method_step },
        "type": DATASET_TYPE,
        "ctype": crate::repository::ARCHIVE_MIME_TYPE,
        "processed": true,
        "meta": {
            "dicom-series": metadata::series_document(&attributes),
            "note": { "note": source_note(&path) },
        }
    });
    if let Some(name) = metadata::dataset_name(&attributes) {
        args["name"] = json!(name);
    }
    if let Some(description) = metadata::dataset_description(&attributes) {
        args["description"] = json!(description);
    }

    info!(
        "Creating dataset for {} in study {} next to {}",
        path.display(),
        study,
        anchor.cid
    );
    let re = repository
        .execute(services::DERIVATION_CREATE, args, Some(input))
        .await
        .context(RepositorySnafu {
            service: services::DERIVATION_CREATE,
        })?;
    let dataset = response_cid(&re, services::DERIVATION_CREATE, "cid")?;

    describe_dataset(repository, &dataset, options).await?;
    info!("Created dataset {} from {}", dataset, path.display());
    Ok((study, dataset))
}

async fn describe_dataset<R: Repository + ?Sized>(
    repository: &R,
    dataset: &Cid,
    options: IngestOptions,
) -> Result<()> {
    call(
        repository,
        services::METADATA_EXTRACT,
        json!({ "cid": dataset }),
    )
    .await?;
    if options.generate_checksum {
        checksum::generate(repository, dataset).await?;
    }
    Ok(())
}
