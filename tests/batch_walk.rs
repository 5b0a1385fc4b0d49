mod support;

use std::path::PathBuf;

use dicom_upload::repository::paths;
use dicom_upload::upload::{BatchDriver, FailurePolicy};
use dicom_upload::{Cid, Error, ErrorKind};
use support::Instance;

fn cid(s: &str) -> Cid {
    s.parse().unwrap()
}

/// Two uploadable files, a text file, a file without SOPInstanceUID, one more uploadable file.
fn mixed_directory(root: &std::path::Path) -> PathBuf {
    let dir = root.join("A1");
    Instance::new(1).write(&dir, "1.dcm");
    Instance::new(2).write(&dir, "2.dcm");
    std::fs::write(dir.join("3.txt"), "scan notes").unwrap();
    Instance::new(4).without_sop_instance_uid().write(&dir, "4.dcm");
    Instance::new(5).write(&dir, "5.dcm");
    dir
}

#[tokio::test]
async fn test_continue_on_error_walks_everything() {
    let root = tempfile::tempdir().unwrap();
    let dir = mixed_directory(root.path());

    let repository = support::repository();
    let uploader = support::uploader(&repository, support::patient_ids("1001,A1\n"));
    let summary = BatchDriver::new(&uploader, FailurePolicy::ContinueOnError)
        .run(&[dir.clone()])
        .await
        .unwrap();

    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.not_imaging, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, dir.join("4.dcm"));
    assert_eq!(summary.attempted(), 4);
    assert_eq!(repository.upload_count(), 3);

    let err = summary.check().unwrap_err();
    assert!(matches!(
        err,
        Error::BatchFailed {
            failed: 1,
            attempted: 4
        }
    ));
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_stop_on_error_halts_at_first_failure() {
    let root = tempfile::tempdir().unwrap();
    let dir = mixed_directory(root.path());

    let repository = support::repository();
    let uploader = support::uploader(&repository, support::patient_ids("1001,A1\n"));
    let err = BatchDriver::new(&uploader, FailurePolicy::StopOnError)
        .run(&[dir])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingIdentifier { .. }));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(repository.upload_count(), 2);
    let fifth = Instance::new(5).sop_instance_uid.unwrap();
    assert!(repository
        .assets()
        .iter()
        .all(|asset| asset.string(paths::SOP_INSTANCE_UID).as_deref() != Some(fifth.as_str())));
}

#[tokio::test]
async fn test_unmapped_accession_does_not_stop_other_studies() {
    let root = tempfile::tempdir().unwrap();
    Instance::new(1).write(&root.path().join("A123"), "1.dcm");
    Instance::new(1)
        .series("1.2.826.0.1.3680043.2.1125.1.2")
        .write(&root.path().join("B7"), "1.dcm");

    let repository = support::repository();
    let uploader = support::uploader(&repository, support::patient_ids("1002,B7\n"));
    let summary = BatchDriver::new(&uploader, FailurePolicy::ContinueOnError)
        .run(&[root.path().to_path_buf()])
        .await
        .unwrap();

    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].0.starts_with(root.path().join("A123")));
    assert!(summary.failed[0].1.contains("A123"));

    let dataset = repository.asset(&cid("1.5.1.1")).unwrap();
    assert_eq!(
        dataset
            .string("meta/dicom-dataset/object/00100020")
            .as_deref(),
        Some("1002")
    );
}

#[tokio::test]
async fn test_single_file_input() {
    let root = tempfile::tempdir().unwrap();
    let path = Instance::new(1).write(&root.path().join("A1"), "1.dcm");

    let repository = support::repository();
    let uploader = support::uploader(&repository, support::patient_ids("1001,A1\n"));
    let driver = BatchDriver::new(&uploader, FailurePolicy::StopOnError);
    let first = driver.run(&[path.clone()]).await.unwrap();
    assert_eq!(first.ingested, 1);
    let second = driver.run(&[path]).await.unwrap();
    assert_eq!(second.already_present, 1);
    assert_eq!(second.uploaded(), 0);
    assert!(second.check().is_ok());
}

#[tokio::test]
async fn test_unreadable_input_is_a_walk_failure() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("A1");
    Instance::new(1).write(&dir, "1.dcm");
    let missing = root.path().join("gone");

    let repository = support::repository();
    let uploader = support::uploader(&repository, support::patient_ids("1001,A1\n"));

    let summary = BatchDriver::new(&uploader, FailurePolicy::ContinueOnError)
        .run(&[missing.clone(), dir.clone()])
        .await
        .unwrap();
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, missing);
    assert_eq!(summary.ingested, 1);
    let err = summary.check().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialFailure);

    let err = BatchDriver::new(&uploader, FailurePolicy::StopOnError)
        .run(&[missing, dir])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Walk { .. }));
    assert_eq!(err.kind(), ErrorKind::Io);
}
