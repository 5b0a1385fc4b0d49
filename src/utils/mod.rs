pub mod cid;
pub mod dicom_tags;

// Re-export commonly used items
pub use cid::{Cid, InvalidCid};
pub use dicom_tags::{describe_tag, tag_alias};

/// Trim DICOM padding (trailing spaces and NULs) and map empty values to `None`.
pub fn clean_value(value: &str) -> Option<String> {
    let value = value
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .trim_start();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
