//! Display names, descriptions and the series document of remote objects.
//!
//! All functions are pure and return `None` when none of their source attributes are
//! present, so callers never overwrite remote values with empty ones.

use chrono::NaiveDateTime;
use serde_json::{json, Map, Value};

use crate::dataset::DatasetAttributes;

/// Commas become spaces and runs of spaces collapse to one.
pub fn normalize_description(description: &str) -> String {
    description
        .replace(',', " ")
        .split(' ')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Dataset name from protocol and series description, suffixed with view position and
/// laterality, e.g. `L CC_CC_L`.
///
/// A series description without a protocol name does not contribute to the name.
pub fn dataset_name(attrs: &DatasetAttributes) -> Option<String> {
    let protocol = attrs.protocol_name.as_deref();
    let base = match (attrs.series_description.as_deref(), protocol) {
        (Some(description), Some(protocol)) if description.starts_with(protocol) => {
            Some(normalize_description(description))
        }
        (Some(description), Some(protocol)) => Some(format!("{}_{}", protocol, description)),
        (None, Some(protocol)) => Some(protocol.to_string()),
        (_, None) => None,
    };

    let parts: Vec<&str> = base
        .as_deref()
        .into_iter()
        .chain(attrs.view_position.as_deref())
        .chain(attrs.image_laterality.as_deref())
        .collect();
    (!parts.is_empty()).then(|| parts.join("_"))
}

pub fn dataset_description(attrs: &DatasetAttributes) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(description) = attrs.series_description.as_deref() {
        parts.push(normalize_description(description));
    }
    if !attrs.image_type.is_empty() {
        parts.push(attrs.image_type.join("\\"));
    }
    parts.extend(attrs.view_position.clone());
    parts.extend(attrs.image_laterality.clone());
    (!parts.is_empty()).then(|| parts.join(", "))
}

pub fn study_name(attrs: &DatasetAttributes) -> Option<String> {
    match (
        attrs.study_description.as_deref(),
        attrs.accession_number.as_deref(),
    ) {
        (Some(description), Some(accession)) => Some(format!("{} - {}", description, accession)),
        (Some(description), None) => Some(description.to_string()),
        (None, Some(accession)) => Some(accession.to_string()),
        (None, None) => None,
    }
}

/// Parses a DICOM date (`YYYYMMDD`) and time (`HHMMSS[.ffffff]`).
pub fn parse_date_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let (whole, fraction) = match time.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (time, None),
    };
    let base = NaiveDateTime::parse_from_str(&format!("{}{}", date, whole), "%Y%m%d%H%M%S").ok()?;
    let millis = match fraction {
        Some(f) if !f.is_empty() => {
            let seconds: f64 = format!("0.{}", f).parse().ok()?;
            (seconds * 1000.0) as i64
        }
        _ => 0,
    };
    Some(base + chrono::Duration::milliseconds(millis))
}

fn render_date_time(date: Option<&str>, time: Option<&str>) -> Option<String> {
    parse_date_time(date?, time?).map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
}

/// Series document attached to incrementally created datasets.
pub fn series_document(attrs: &DatasetAttributes) -> Value {
    let mut doc = Map::new();
    if let Some(uid) = &attrs.series_instance_uid {
        doc.insert("uid".into(), json!(uid));
    }
    if let Some(number) = &attrs.series_number {
        doc.insert("id".into(), json!(number));
    }
    if let Some(description) = attrs
        .series_description
        .as_ref()
        .or(attrs.series_number.as_ref())
    {
        doc.insert("description".into(), json!(description));
    }
    if let Some(sdate) = render_date_time(attrs.series_date.as_deref(), attrs.series_time.as_deref())
    {
        doc.insert("sdate".into(), json!(sdate));
    }
    if let Some(adate) = render_date_time(
        attrs.acquisition_date.as_deref(),
        attrs.acquisition_time.as_deref(),
    ) {
        doc.insert("adate".into(), json!(adate));
    }
    if let Some(instance) = &attrs.instance_number {
        doc.insert("imin".into(), json!(instance));
        doc.insert("imax".into(), json!(instance));
    }
    doc.insert("size".into(), json!(1));
    if let Some(modality) = &attrs.modality {
        doc.insert("modality".into(), json!(modality));
    }
    if let Some(protocol) = &attrs.protocol_name {
        doc.insert("protocol".into(), json!(protocol));
    }

    let mut image = Map::new();
    if let Some([x, y, z]) = attrs.image_position {
        image.insert("position".into(), json!({ "x": x, "y": y, "z": z }));
    }
    if let Some(orientation) = attrs.image_orientation {
        image.insert("orientation".into(), json!(orientation));
    }
    if !image.is_empty() {
        doc.insert("image".into(), Value::Object(image));
    }
    Value::Object(doc)
}
