//! Decoded imaging files and their typed identifier attributes.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use dicom_core::header::Tag;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{open_file, DefaultDicomObject, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::error::{
    MissingIdentifierSnafu, ProbeSnafu, ReadFileSnafu, Result, UnsupportedFileTransferSyntaxSnafu,
    WriteDatasetSnafu,
};
use crate::utils::clean_value;

/// Offset of the `DICM` magic code after the file preamble.
const MAGIC_OFFSET: usize = 128;

/// Identifier attributes of an instance after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifiers {
    pub accession_number: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub series_number: String,
}

/// Typed view of the attributes the upload engine reads.
///
/// Every other element stays untouched in the decoded object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetAttributes {
    pub accession_number: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub series_number: Option<String>,
    pub study_description: Option<String>,
    pub series_description: Option<String>,
    pub protocol_name: Option<String>,
    pub view_position: Option<String>,
    pub image_laterality: Option<String>,
    pub image_type: Vec<String>,
    pub modality: Option<String>,
    pub instance_number: Option<String>,
    pub series_date: Option<String>,
    pub series_time: Option<String>,
    pub acquisition_date: Option<String>,
    pub acquisition_time: Option<String>,
    pub image_position: Option<[f64; 3]>,
    pub image_orientation: Option<[f64; 6]>,
}

impl DatasetAttributes {
    pub fn from_object(obj: &InMemDicomObject) -> Self {
        DatasetAttributes {
            accession_number: string(obj, tags::ACCESSION_NUMBER),
            study_instance_uid: string(obj, tags::STUDY_INSTANCE_UID),
            series_instance_uid: string(obj, tags::SERIES_INSTANCE_UID),
            sop_instance_uid: string(obj, tags::SOP_INSTANCE_UID),
            series_number: string(obj, tags::SERIES_NUMBER),
            study_description: string(obj, tags::STUDY_DESCRIPTION),
            series_description: string(obj, tags::SERIES_DESCRIPTION),
            protocol_name: string(obj, tags::PROTOCOL_NAME),
            view_position: string(obj, tags::VIEW_POSITION),
            image_laterality: string(obj, tags::IMAGE_LATERALITY),
            image_type: strings(obj, tags::IMAGE_TYPE),
            modality: string(obj, tags::MODALITY),
            instance_number: string(obj, tags::INSTANCE_NUMBER),
            series_date: string(obj, tags::SERIES_DATE),
            series_time: string(obj, tags::SERIES_TIME),
            acquisition_date: string(obj, tags::ACQUISITION_DATE),
            acquisition_time: string(obj, tags::ACQUISITION_TIME),
            image_position: floats(obj, tags::IMAGE_POSITION_PATIENT)
                .and_then(|v| <[f64; 3]>::try_from(v).ok()),
            image_orientation: floats(obj, tags::IMAGE_ORIENTATION_PATIENT)
                .and_then(|v| <[f64; 6]>::try_from(v).ok()),
        }
    }
}

fn string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.get(tag)
        .and_then(|e| e.to_str().ok())
        .and_then(|s| clean_value(&s))
}

fn strings(obj: &InMemDicomObject, tag: Tag) -> Vec<String> {
    obj.get(tag)
        .and_then(|e| e.to_multi_str().ok())
        .map(|values| values.iter().filter_map(|v| clean_value(v)).collect())
        .unwrap_or_default()
}

fn floats(obj: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
    obj.get(tag).and_then(|e| e.to_multi_float64().ok())
}

/// One local imaging file, decoded and ready to be modified and re-serialized.
#[derive(Debug)]
pub struct ImagingFile {
    path: PathBuf,
    /// Name of the parent directory, which carries the accession number
    accession_from_directory: Option<String>,
    object: DefaultDicomObject,
    attributes: DatasetAttributes,
}

impl ImagingFile {
    /// Decodes a file, or returns `None` if it is not a DICOM file.
    ///
    /// DICOMDIR files are not imaging files. Neither are files without the Part 10
    /// preamble and `DICM` code, such as bare ACR-NEMA streams.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        if path.file_name() == Some(OsStr::new("DICOMDIR")) {
            debug!("Ignoring DICOMDIR {}", path.display());
            return Ok(None);
        }
        if !has_dicm_magic(path)? {
            return Ok(None);
        }

        let object = open_file(path)
            .map_err(Box::from)
            .context(ReadFileSnafu { path })?;
        let transfer_syntax = object.meta().transfer_syntax();
        ensure!(
            TransferSyntaxRegistry.get(transfer_syntax).is_some(),
            UnsupportedFileTransferSyntaxSnafu {
                uid: transfer_syntax.to_string()
            }
        );
        let object = into_explicit_vr_le(object)?;
        let attributes = DatasetAttributes::from_object(&object);

        Ok(Some(ImagingFile {
            path: path.to_path_buf(),
            accession_from_directory: path
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned()),
            object,
            attributes,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn attributes(&self) -> &DatasetAttributes {
        &self.attributes
    }

    pub fn object(&self) -> &DefaultDicomObject {
        &self.object
    }

    /// Establishes the identifiers the upload depends on.
    ///
    /// The directory name overrides the in-file AccessionNumber, and a missing
    /// SeriesNumber is set to `1`. Both changes are written to the object.
    pub fn normalize(&mut self) -> Result<Identifiers> {
        let accession_number = match (
            self.accession_from_directory.clone(),
            self.attributes.accession_number.clone(),
        ) {
            (Some(from_dir), Some(in_file)) if from_dir != in_file => {
                warn!(
                    "AccessionNumber {} in {} differs from directory name {}, using {}",
                    in_file,
                    self.path.display(),
                    from_dir,
                    from_dir
                );
                from_dir
            }
            (Some(from_dir), _) => from_dir,
            (None, Some(in_file)) => in_file,
            (None, None) => {
                return MissingIdentifierSnafu {
                    path: &self.path,
                    tag: tags::ACCESSION_NUMBER,
                }
                .fail()
            }
        };
        if self.attributes.accession_number.as_ref() != Some(&accession_number) {
            self.put_str(tags::ACCESSION_NUMBER, VR::SH, &accession_number);
            self.attributes.accession_number = Some(accession_number.clone());
        }

        let series_instance_uid = self.required(tags::SERIES_INSTANCE_UID, |a| {
            a.series_instance_uid.clone()
        })?;
        let sop_instance_uid =
            self.required(tags::SOP_INSTANCE_UID, |a| a.sop_instance_uid.clone())?;

        let series_number = match self.attributes.series_number.clone() {
            Some(n) => n,
            None => {
                debug!("No SeriesNumber in {}, defaulting to 1", self.path.display());
                self.put_str(tags::SERIES_NUMBER, VR::IS, "1");
                self.attributes.series_number = Some("1".to_string());
                "1".to_string()
            }
        };

        Ok(Identifiers {
            accession_number,
            series_instance_uid,
            sop_instance_uid,
            series_number,
        })
    }

    fn required(
        &self,
        tag: Tag,
        get: impl FnOnce(&DatasetAttributes) -> Option<String>,
    ) -> Result<String> {
        get(&self.attributes).context(MissingIdentifierSnafu {
            path: &self.path,
            tag,
        })
    }

    /// Replaces the patient identity with the project id and the mapped patient id.
    pub fn set_patient(&mut self, patient_name: &str, patient_id: &str) {
        self.put_str(tags::PATIENT_NAME, VR::PN, patient_name);
        self.put_str(tags::PATIENT_ID, VR::LO, patient_id);
    }

    fn put_str(&mut self, tag: Tag, vr: VR, value: &str) {
        self.object
            .put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    /// Serializes the complete file: preamble, file meta group and data set.
    pub fn write_to(&self, to: &mut dyn Write) -> Result<()> {
        self.object
            .write_all(to)
            .map_err(Box::from)
            .context(WriteDatasetSnafu)
    }
}

fn has_dicm_magic(path: &Path) -> Result<bool> {
    let mut head = [0u8; MAGIC_OFFSET + 4];
    let mut file = File::open(path).context(ProbeSnafu { path })?;
    match file.read_exact(&mut head) {
        Ok(()) => Ok(&head[MAGIC_OFFSET..] == b"DICM"),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).context(ProbeSnafu { path }),
    }
}

// transcoding functions

#[cfg(feature = "transcode")]
fn into_explicit_vr_le(dicom_file: DefaultDicomObject) -> Result<DefaultDicomObject> {
    use dicom_dictionary_std::uids;
    use dicom_pixeldata::Transcode;

    let current = dicom_file.meta().transfer_syntax().to_string();
    if current == uids::EXPLICIT_VR_LITTLE_ENDIAN {
        return Ok(dicom_file);
    }
    // encapsulated pixel data is passed through in its native encoding
    let codec_free = TransferSyntaxRegistry
        .get(&current)
        .is_some_and(|ts| ts.is_codec_free());
    let Some(target) = TransferSyntaxRegistry.get(uids::EXPLICIT_VR_LITTLE_ENDIAN) else {
        return Ok(dicom_file);
    };
    if !codec_free {
        debug!("Keeping transfer syntax {}", current);
        return Ok(dicom_file);
    }

    let mut file = dicom_file;
    debug!("Transcoding file from {} to {}", current, target.uid());
    file.transcode(target)
        .map_err(|e| crate::error::Error::Transcode {
            source: Box::new(e),
        })?;
    Ok(file)
}

#[cfg(not(feature = "transcode"))]
fn into_explicit_vr_le(dicom_file: DefaultDicomObject) -> Result<DefaultDicomObject> {
    Ok(dicom_file)
}
