#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::InMemDicomObject;

use dicom_upload::patient_map::PatientIdMap;
use dicom_upload::repository::memory::MemoryRepository;
use dicom_upload::{Cid, Uploader};

pub const STUDY_UID: &str = "1.2.826.0.1.3680043.2.1125.1";
pub const SERIES_UID: &str = "1.2.826.0.1.3680043.2.1125.1.1";

pub fn scope() -> Cid {
    "1.5".parse().unwrap()
}

/// Attributes of a generated test instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub sop_instance_uid: Option<String>,
    pub series_instance_uid: String,
    pub accession_number: Option<String>,
    pub series_number: Option<String>,
    pub instance_number: u32,
    pub pixels: Vec<u8>,
}

impl Instance {
    pub fn new(n: u32) -> Self {
        Instance {
            sop_instance_uid: Some(format!("{}.{}", SERIES_UID, n)),
            series_instance_uid: SERIES_UID.to_string(),
            accession_number: None,
            series_number: Some("2".to_string()),
            instance_number: n,
            pixels: (0..64u32).map(|i| ((i * n) % 256) as u8).collect(),
        }
    }

    pub fn series(mut self, uid: &str) -> Self {
        self.series_instance_uid = uid.to_string();
        self
    }

    pub fn without_sop_instance_uid(mut self) -> Self {
        self.sop_instance_uid = None;
        self
    }

    fn put(obj: &mut InMemDicomObject, tag: dicom_core::Tag, vr: VR, value: &str) {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    /// Writes the instance as a DICOM file.
    pub fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let mut obj = InMemDicomObject::new_empty();
        Self::put(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::SECONDARY_CAPTURE_IMAGE_STORAGE);
        if let Some(sop) = &self.sop_instance_uid {
            Self::put(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop);
        }
        Self::put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, STUDY_UID);
        Self::put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, &self.series_instance_uid);
        if let Some(accession) = &self.accession_number {
            Self::put(&mut obj, tags::ACCESSION_NUMBER, VR::SH, accession);
        }
        if let Some(number) = &self.series_number {
            Self::put(&mut obj, tags::SERIES_NUMBER, VR::IS, number);
        }
        Self::put(&mut obj, tags::INSTANCE_NUMBER, VR::IS, &self.instance_number.to_string());
        Self::put(&mut obj, tags::PATIENT_NAME, VR::PN, "Doe^Jane");
        Self::put(&mut obj, tags::PATIENT_ID, VR::LO, "ORIGINAL-ID");
        Self::put(&mut obj, tags::MODALITY, VR::CS, "MG");
        Self::put(&mut obj, tags::STUDY_DESCRIPTION, VR::LO, "MAMMO SCREEN");
        Self::put(&mut obj, tags::SERIES_DESCRIPTION, VR::LO, "L CC");
        Self::put(&mut obj, tags::VIEW_POSITION, VR::CS, "CC");
        obj.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            PrimitiveValue::from(8u16),
        ));
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(self.pixels.clone()),
        ));

        let sop = self
            .sop_instance_uid
            .clone()
            .unwrap_or_else(|| format!("{}.999", SERIES_UID));
        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(sop)
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN),
            )
            .unwrap();
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        file.write_to_file(&path).unwrap();
        path
    }
}

pub fn patient_ids(lines: &str) -> PatientIdMap {
    PatientIdMap::parse(lines)
}

pub fn uploader(
    repository: &Arc<MemoryRepository>,
    patient_ids: PatientIdMap,
) -> Uploader<Arc<MemoryRepository>> {
    Uploader::new(Arc::clone(repository), scope(), patient_ids)
}

pub fn repository() -> Arc<MemoryRepository> {
    Arc::new(MemoryRepository::with_project(&scope()))
}
