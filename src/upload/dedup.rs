use snafu::prelude::*;
use tracing::debug;

use crate::dataset::Identifiers;
use crate::error::{AmbiguousDuplicateSnafu, RepositorySnafu, Result};
use crate::repository::{paths, Action, Filter, Query, QueryResult, Repository};
use crate::utils::Cid;

/// Existing remote object for a content identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupMatch {
    None,
    One(Cid),
}

/// Query for datasets in `scope` holding the same instance.
pub fn identity_query(scope: &Cid, ids: &Identifiers) -> Query {
    let filter = Filter::cid_within(scope)
        .and(Filter::equals(
            paths::SOP_INSTANCE_UID,
            ids.sop_instance_uid.as_str(),
        ))
        .and(Filter::equals(
            paths::ACCESSION_NUMBER,
            ids.accession_number.as_str(),
        ));
    Query::new(filter, Action::GetCid)
}

/// Looks up the instance in the repository.
///
/// More than one match is never resolved automatically.
pub async fn resolve<R: Repository + ?Sized>(
    repository: &R,
    scope: &Cid,
    ids: &Identifiers,
) -> Result<DedupMatch> {
    let query = identity_query(scope, ids);
    let mut cids = repository
        .query(&query)
        .await
        .and_then(QueryResult::into_cids)
        .context(RepositorySnafu {
            service: "asset.query",
        })?;
    debug!("{} existing objects for {}", cids.len(), query.filter);

    match cids.len() {
        0 => Ok(DedupMatch::None),
        1 => Ok(DedupMatch::One(cids.remove(0))),
        _ => {
            cids.sort();
            AmbiguousDuplicateSnafu {
                scope: scope.clone(),
                sop_instance_uid: ids.sop_instance_uid.as_str(),
                accession_number: ids.accession_number.as_str(),
                cids,
            }
            .fail()
        }
    }
}
