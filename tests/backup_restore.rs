//! End-to-end engine behavior over an in-memory device.

use tempfile::tempdir;

use espvault::backup::BackupEngine;
use espvault::catalog::Catalog;
use espvault::error::Error;
use espvault::partition::PartitionTable;
use espvault::restore::{Phase, RestoreEngine, RestoreOptions};
use espvault::session::SimulatedSession;
use espvault::verify;

const FLASH_SIZE: u32 = 4 * 1024 * 1024;
const CHUNK_SIZE: usize = 4096;

fn device(chip_id: &str) -> SimulatedSession {
    SimulatedSession::with_pattern(chip_id, FLASH_SIZE)
}

#[test]
fn published_backup_verifies_against_its_metadata() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:01");

    let metadata = BackupEngine::new(&catalog, &table, CHUNK_SIZE)
        .backup_full(&mut session)
        .unwrap();

    let artifact = std::fs::read(catalog.artifact_path(&metadata.backup_id)).unwrap();

    assert_eq!(artifact.len() as u64, metadata.byte_size);
    assert!(verify::matches(&artifact, &metadata.checksum));
    assert_eq!(artifact, session.flash());
}

#[test]
fn partition_backup_covers_exactly_the_declared_region() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:02");

    let metadata = BackupEngine::new(&catalog, &table, CHUNK_SIZE)
        .backup_partition(&mut session, "app0")
        .unwrap();

    assert_eq!(metadata.byte_size, 1_048_576);
    assert_eq!(metadata.regions.len(), 1);
    assert_eq!(metadata.regions[0].start, 65_536);
    assert_eq!(metadata.regions[0].length, 1_048_576);
    assert_eq!(metadata.regions[0].name.as_deref(), Some("app0"));

    let artifact = std::fs::read(catalog.artifact_path(&metadata.backup_id)).unwrap();
    assert_eq!(artifact.len(), 1_048_576);
    assert_eq!(&artifact[..], &session.flash()[0x10000..0x110000]);
}

#[test]
fn consecutive_full_backups_share_a_checksum() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:03");

    let mut engine = BackupEngine::new(&catalog, &table, CHUNK_SIZE);
    let first = engine.backup_full(&mut session).unwrap();
    let second = engine.backup_full(&mut session).unwrap();

    assert_ne!(first.backup_id, second.backup_id);
    assert_eq!(first.checksum, second.checksum);
}

#[test]
fn out_of_range_request_is_rejected_before_any_device_io() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:04");

    let result = BackupEngine::new(&catalog, &table, CHUNK_SIZE).backup_range(
        &mut session,
        Some("app0"),
        0x3f_0000,
        0x20_000,
    );

    assert!(matches!(result, Err(Error::InvalidRange { .. })));
    assert_eq!(session.read_count(), 0);
    assert!(catalog.list().unwrap().is_empty());
}

#[test]
fn cancellation_leaves_no_entry_and_no_staging_file() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:05");

    let engine = BackupEngine::new(&catalog, &table, CHUNK_SIZE);
    let token = engine.cancel_token();

    let result = {
        let cancel_after = 8u64;
        let mut engine = engine.with_progress(move |done, _| {
            if done >= cancel_after {
                token.cancel();
            }
        });
        engine.backup_full(&mut session)
    };

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(catalog.list().unwrap().is_empty());

    let staging: Vec<_> = std::fs::read_dir(catalog.dir().join(".staging"))
        .unwrap()
        .collect();
    assert!(staging.is_empty());
}

#[test]
fn retry_exhaustion_reports_the_failing_offset() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:06");
    session.fail_reads_at(0x12000, 99);

    let result =
        BackupEngine::new(&catalog, &table, CHUNK_SIZE).backup_partition(&mut session, "app0");

    match result {
        Err(Error::Transfer {
            offset, attempts, ..
        }) => {
            assert_eq!(offset, 0x12000);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected Transfer, got {:?}", other.map(|_| ())),
    }

    assert!(catalog.list().unwrap().is_empty());
}

#[test]
fn restore_round_trips_partition_bytes() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:07");

    let metadata = BackupEngine::new(&catalog, &table, CHUNK_SIZE)
        .backup_partition(&mut session, "app0")
        .unwrap();
    let artifact = std::fs::read(catalog.artifact_path(&metadata.backup_id)).unwrap();

    // scramble the partition on the device
    for byte in &mut session.flash_mut()[0x10000..0x110000] {
        *byte = !*byte;
    }

    let mut engine = RestoreEngine::new(&catalog, CHUNK_SIZE).with_confirmation(|_| true);
    let report = engine
        .run(&mut session, &metadata.backup_id, RestoreOptions::default())
        .unwrap();

    assert_eq!(engine.phase(), Phase::Done);
    assert_eq!(report.bytes_written, 1_048_576);
    assert!(!report.chip_mismatch);
    assert_eq!(&session.flash()[0x10000..0x110000], &artifact[..]);
}

#[test]
fn restore_without_force_fails_on_chip_mismatch_with_zero_writes() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();

    let mut donor = device("24:0a:c4:00:00:08");
    let metadata = BackupEngine::new(&catalog, &table, CHUNK_SIZE)
        .backup_partition(&mut donor, "app0")
        .unwrap();

    let mut other = device("24:0a:c4:ff:ff:ff");
    let mut engine = RestoreEngine::new(&catalog, CHUNK_SIZE).with_confirmation(|_| true);

    let result = engine.run(&mut other, &metadata.backup_id, RestoreOptions::default());

    match result {
        Err(Error::ChipMismatch { expected, actual }) => {
            assert_eq!(expected, "24:0a:c4:00:00:08");
            assert_eq!(actual, "24:0a:c4:ff:ff:ff");
        }
        other => panic!("expected ChipMismatch, got {:?}", other.map(|_| ())),
    }

    assert_eq!(engine.phase(), Phase::Failed);
    assert_eq!(other.write_count(), 0);
}

#[test]
fn restore_with_force_proceeds_past_chip_mismatch() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();

    let mut donor = device("24:0a:c4:00:00:09");
    let metadata = BackupEngine::new(&catalog, &table, CHUNK_SIZE)
        .backup_partition(&mut donor, "nvs")
        .unwrap();

    let mut other = device("24:0a:c4:ff:ff:fe");
    let mut engine = RestoreEngine::new(&catalog, CHUNK_SIZE).with_confirmation(|_| true);

    let report = engine
        .run(&mut other, &metadata.backup_id, RestoreOptions { force: true })
        .unwrap();

    assert!(report.chip_mismatch);
    assert_eq!(engine.phase(), Phase::Done);
    assert_eq!(
        &other.flash()[0x9000..0xf000],
        &donor.flash()[0x9000..0xf000]
    );
}

#[test]
fn restore_without_consent_is_declined_before_device_access() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:0a");

    let metadata = BackupEngine::new(&catalog, &table, CHUNK_SIZE)
        .backup_partition(&mut session, "nvs")
        .unwrap();
    let writes_before = session.write_count();

    // no confirmation callback installed: consent is withheld by default
    let mut engine = RestoreEngine::new(&catalog, CHUNK_SIZE);
    let result = engine.run(&mut session, &metadata.backup_id, RestoreOptions::default());

    assert!(matches!(result, Err(Error::Declined)));
    assert_eq!(engine.phase(), Phase::Failed);
    assert_eq!(session.write_count(), writes_before);
}

#[test]
fn corrupted_writes_fail_verification_with_the_divergent_offset() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:0b");

    let metadata = BackupEngine::new(&catalog, &table, CHUNK_SIZE)
        .backup_partition(&mut session, "otadata")
        .unwrap();

    session.corrupt_writes(true);

    let mut engine = RestoreEngine::new(&catalog, CHUNK_SIZE).with_confirmation(|_| true);
    let result = engine.run(&mut session, &metadata.backup_id, RestoreOptions::default());

    match result {
        Err(Error::RestoreVerification { offset }) => assert_eq!(offset, 0xe000),
        other => panic!("expected RestoreVerification, got {:?}", other.map(|_| ())),
    }

    assert_eq!(engine.phase(), Phase::Failed);
}

#[test]
fn restoring_an_unknown_id_reports_not_found() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let mut session = device("24:0a:c4:00:00:0c");

    let mut engine = RestoreEngine::new(&catalog, CHUNK_SIZE).with_confirmation(|_| true);
    let result = engine.run(&mut session, "missing", RestoreOptions::default());

    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(session.read_count(), 0);
    assert_eq!(session.write_count(), 0);
}

#[test]
fn tampered_artifacts_are_rejected_during_validation() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let table = PartitionTable::esp32_4m();
    let mut session = device("24:0a:c4:00:00:0d");

    let metadata = BackupEngine::new(&catalog, &table, CHUNK_SIZE)
        .backup_partition(&mut session, "nvs")
        .unwrap();

    // flip one byte of the published artifact on disk
    let path = catalog.artifact_path(&metadata.backup_id);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[100] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let mut engine = RestoreEngine::new(&catalog, CHUNK_SIZE).with_confirmation(|_| true);
    let result = engine.run(&mut session, &metadata.backup_id, RestoreOptions::default());

    assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    assert_eq!(session.write_count(), 0);
}
