use snafu::prelude::*;

use crate::error::{RepositorySnafu, Result};
use crate::repository::{paths, Action, Asset, Filter, Query, QueryResult, Repository};
use crate::utils::Cid;

/// How a new instance is placed in the repository.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// No sibling of the series is stored yet; ingest creates study and dataset
    FullStudyIngest,
    /// Create a sibling dataset in the study of the series anchor
    IncrementalCreate { anchor: Asset },
}

pub fn anchor_query(scope: &Cid, series_instance_uid: &str) -> Query {
    let filter = Filter::cid_within(scope)
        .and(Filter::equals(paths::SERIES_UID, series_instance_uid))
        .and(Filter::has_value(paths::NOTE));
    Query::new(filter, Action::GetMeta).size(1)
}

/// The first imported dataset of the series, if any.
pub async fn find_anchor<R: Repository + ?Sized>(
    repository: &R,
    scope: &Cid,
    series_instance_uid: &str,
) -> Result<Option<Asset>> {
    let query = anchor_query(scope, series_instance_uid);
    let assets = repository
        .query(&query)
        .await
        .and_then(QueryResult::into_assets)
        .context(RepositorySnafu {
            service: "asset.query",
        })?;
    Ok(assets.into_iter().next())
}

pub async fn select_strategy<R: Repository + ?Sized>(
    repository: &R,
    scope: &Cid,
    series_instance_uid: &str,
) -> Result<Strategy> {
    Ok(match find_anchor(repository, scope, series_instance_uid).await? {
        Some(anchor) => Strategy::IncrementalCreate { anchor },
        None => Strategy::FullStudyIngest,
    })
}
