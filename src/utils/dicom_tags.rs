use dicom_core::header::Tag;
use dicom_core::DataDictionary;
use dicom_dictionary_std::StandardDataDictionary;

/// Keyword of a tag from the standard dictionary, e.g. `SOPInstanceUID`.
pub fn tag_alias(tag: Tag) -> &'static str {
    StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.alias)
        .unwrap_or("Unknown")
}

/// Human-readable tag label for log and error messages: `SOPInstanceUID (0008,0018)`.
pub fn describe_tag(tag: Tag) -> String {
    format!("{} {}", tag_alias(tag), tag)
}
