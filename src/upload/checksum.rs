use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use snafu::prelude::*;
use tracing::{info, warn};

use crate::dataset::ImagingFile;
use crate::error::{ChecksumMismatchSnafu, RepositorySnafu, Result};
use crate::repository::{lookup, paths, services, Repository};
use crate::utils::Cid;

pub const ALGORITHM: &str = "sha-256";

/// Pixel data checksum as recorded on a remote dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub algorithm: String,
    /// Digest was computed over big endian words
    #[serde(rename = "big-endian", default)]
    pub big_endian: bool,
    pub digest: String,
}

/// SHA-256 hex digest of the pixel data value, or `None` without pixel data.
///
/// Native pixel data is hashed in the requested byte order, swapping words of
/// BitsAllocated width. Encapsulated fragments are hashed as stored.
pub fn pixel_data_digest(obj: &InMemDicomObject, big_endian: bool) -> Option<String> {
    let element = obj.get(tags::PIXEL_DATA)?;
    let mut hasher = Sha256::new();
    let value = element.value();
    if let Some(fragments) = value.fragments() {
        for fragment in fragments {
            hasher.update(fragment);
        }
    } else {
        let bytes = value.primitive()?.to_bytes();
        let word = obj
            .get(tags::BITS_ALLOCATED)
            .and_then(|e| e.to_int::<u16>().ok())
            .map(|bits| usize::from(bits / 8))
            .unwrap_or(1);
        if big_endian && (word == 2 || word == 4) {
            for chunk in bytes.chunks(word) {
                let mut swapped = chunk.to_vec();
                swapped.reverse();
                hasher.update(&swapped);
            }
        } else {
            hasher.update(&bytes);
        }
    }
    Some(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Match,
    BothAbsent,
    Mismatch,
}

pub fn compare(local: Option<&str>, remote: Option<&str>) -> Comparison {
    match (local, remote) {
        (None, None) => Comparison::BothAbsent,
        (Some(l), Some(r)) if l.eq_ignore_ascii_case(r) => Comparison::Match,
        _ => Comparison::Mismatch,
    }
}

fn record_in(value: &Value, path: &str) -> Option<ChecksumRecord> {
    lookup(value, path).and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Asks the repository to compute and store the checksum of a dataset.
pub async fn generate<R: Repository + ?Sized>(
    repository: &R,
    cid: &Cid,
) -> Result<Option<ChecksumRecord>> {
    let re = repository
        .execute(
            services::CHECKSUM_GENERATE,
            json!({ "cid": cid, "algorithm": ALGORITHM, "save": true }),
            None,
        )
        .await
        .context(RepositorySnafu {
            service: services::CHECKSUM_GENERATE,
        })?;
    Ok(record_in(&re, "checksum"))
}

/// Checksum recorded on the dataset, generated on demand.
///
/// Remote failures are logged and reported as absent.
pub async fn remote_checksum<R: Repository + ?Sized>(
    repository: &R,
    cid: &Cid,
) -> Option<ChecksumRecord> {
    let fetched = repository
        .execute(services::ASSET_GET, json!({ "cid": cid }), None)
        .await
        .context(RepositorySnafu {
            service: services::ASSET_GET,
        })
        .map(|re| {
            let path = paths::PIXEL_DATA_CHECKSUM.trim_start_matches("meta/");
            re.get("asset")
                .and_then(|asset| asset.get("meta"))
                .and_then(|meta| record_in(meta, path))
        });
    let result = match fetched {
        Ok(Some(record)) => Ok(Some(record)),
        Ok(None) => generate(repository, cid).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(record) => record,
        Err(e) => {
            warn!(
                "Could not get pixel data checksum of dataset {}: {}",
                cid,
                snafu::Report::from_error(e)
            );
            None
        }
    }
}

/// Compares the local pixel data with the checksum of the already stored dataset.
pub async fn verify<R: Repository + ?Sized>(
    repository: &R,
    cid: &Cid,
    file: &ImagingFile,
) -> Result<()> {
    let remote = remote_checksum(repository, cid).await;
    let big_endian = remote.as_ref().is_some_and(|r| r.big_endian);
    let local = pixel_data_digest(file.object(), big_endian);
    let remote = remote.map(|r| r.digest);

    match compare(local.as_deref(), remote.as_deref()) {
        Comparison::Match => {
            info!(
                "Pixel data checksum {} of {} matches dataset {}",
                remote.as_deref().unwrap_or_default(),
                file.path().display(),
                cid
            );
            Ok(())
        }
        Comparison::BothAbsent => {
            warn!(
                "No pixel data checksum for dataset {} nor for {}",
                cid,
                file.path().display()
            );
            Ok(())
        }
        Comparison::Mismatch => ChecksumMismatchSnafu {
            path: file.path(),
            cid: cid.clone(),
            local,
            remote,
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, VR};

    fn image(bits: u16, pixels: Vec<u8>) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            PrimitiveValue::from(bits),
        ));
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(pixels),
        ));
        obj
    }

    #[test]
    fn test_digest_byte_order() {
        let little = image(16, vec![0x01, 0x02, 0x03, 0x04]);
        let big = image(16, vec![0x02, 0x01, 0x04, 0x03]);
        assert_eq!(
            pixel_data_digest(&little, true),
            pixel_data_digest(&big, false)
        );
        assert_ne!(
            pixel_data_digest(&little, false),
            pixel_data_digest(&little, true)
        );
        assert_eq!(pixel_data_digest(&InMemDicomObject::new_empty(), false), None);
    }

    #[test]
    fn test_compare() {
        assert_eq!(compare(Some("AbC"), Some("abc")), Comparison::Match);
        assert_eq!(compare(None, None), Comparison::BothAbsent);
        assert_eq!(compare(Some("abc"), None), Comparison::Mismatch);
        assert_eq!(compare(None, Some("abc")), Comparison::Mismatch);
        assert_eq!(compare(Some("abc"), Some("abd")), Comparison::Mismatch);
    }

    #[test]
    fn test_record_field_names() {
        let record: ChecksumRecord =
            serde_json::from_value(json!({"algorithm": "sha-256", "big-endian": true, "digest": "ff"}))
                .unwrap();
        assert!(record.big_endian);
    }
}
