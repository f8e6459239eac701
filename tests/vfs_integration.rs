//! Virtual File System Integration Tests
//!
//! Every test runs a real server on `TempDir` drive roots:
//! - Round trips for RAID 0, 1 and 6, with and without encryption
//! - Versioning, restore and purge of previous versions
//! - Crash recovery through the journal
//! - Listing, drive sync, integrity repair, buckets and scheduled cleanup

use std::path::PathBuf;
use std::sync::Arc;

use assert_matches::assert_matches;
use raidvault::config::{EncryptionConfig, Raid6Config, ServerSettings};
use raidvault::model::{DriveStatus, Item, OperationCode};
use raidvault::{Error, RedundancyLevel, VirtualFileSystem};
use tempfile::TempDir;

const MASTER_KEY: &str = "00112233445566778899aabbccddeeff0123456789abcdeffedcba9876543210";

fn drive_roots(tmp: &TempDir, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| tmp.path().join(format!("drive{}", i)))
        .collect()
}

fn settings(tmp: &TempDir, level: RedundancyLevel, count: usize) -> ServerSettings {
    let mut settings = ServerSettings::with_drives(level, drive_roots(tmp, count));
    if level == RedundancyLevel::Raid6 {
        settings.raid6 = Raid6Config {
            data_drives: 4,
            parity_drives: 2,
            block_size: 16,
        };
    }
    settings
}

fn drive_count(level: RedundancyLevel) -> usize {
    match level {
        RedundancyLevel::Raid0 => 3,
        RedundancyLevel::Raid1 => 2,
        RedundancyLevel::Raid6 => 6,
    }
}

fn open(tmp: &TempDir, level: RedundancyLevel) -> Arc<VirtualFileSystem> {
    VirtualFileSystem::open(settings(tmp, level, drive_count(level))).unwrap()
}

fn encrypted(mut settings: ServerSettings) -> ServerSettings {
    settings.encryption = EncryptionConfig {
        enabled: true,
        master_key: Some(MASTER_KEY.to_string()),
    };
    settings
}

const ALL_LEVELS: [RedundancyLevel; 3] = [
    RedundancyLevel::Raid0,
    RedundancyLevel::Raid1,
    RedundancyLevel::Raid6,
];

// =============================================================================
// Round Trips
// =============================================================================

mod round_trip_tests {
    use super::*;

    fn payloads() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            b"hello".to_vec(),
            (0..=255u8).cycle().take(1000).collect(),
        ]
    }

    #[test]
    fn test_round_trip_all_levels() {
        for level in ALL_LEVELS {
            let tmp = TempDir::new().unwrap();
            let vfs = open(&tmp, level);
            vfs.create_bucket("b1").unwrap();

            for (i, payload) in payloads().into_iter().enumerate() {
                let object = format!("o{}", i);
                let meta = vfs.put_object_bytes("b1", &object, &payload).unwrap();
                assert_eq!(meta.length, payload.len() as u64);
                assert_eq!(meta.raid, level);
                assert_eq!(vfs.read_object("b1", &object).unwrap(), payload, "{}", level);
            }
        }
    }

    #[test]
    fn test_encrypted_round_trip_all_levels() {
        for level in ALL_LEVELS {
            let tmp = TempDir::new().unwrap();
            let s = encrypted(settings(&tmp, level, drive_count(level)));
            let vfs = VirtualFileSystem::open(s).unwrap();
            vfs.create_bucket("b1").unwrap();

            for (i, payload) in payloads().into_iter().enumerate() {
                let object = format!("o{}", i);
                let meta = vfs.put_object_bytes("b1", &object, &payload).unwrap();
                assert!(meta.encrypt);
                assert_eq!(meta.length, payload.len() as u64);
                assert!(meta.stored_length > meta.length);
                assert_eq!(vfs.read_object("b1", &object).unwrap(), payload, "{}", level);
            }
        }
    }

    #[test]
    fn test_encrypted_data_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let s = encrypted(settings(&tmp, RedundancyLevel::Raid1, 2));
        {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "secret", b"attack at dawn").unwrap();

            let bucket = vfs.get_bucket("b1").unwrap();
            let drive = vfs.context().drives.get(0).unwrap().clone();
            let stored = std::fs::read(drive.data_file_path(bucket.id, "secret")).unwrap();
            assert_ne!(stored, b"attack at dawn");
        }
        let vfs = VirtualFileSystem::open(s).unwrap();
        assert_eq!(vfs.read_object("b1", "secret").unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_object_metadata_defaults() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        vfs.create_bucket("b1").unwrap();

        let mut data: &[u8] = b"%PDF";
        let meta = vfs
            .put_object("b1", "report", &mut data, Some("report.pdf"), Some("application/pdf"))
            .unwrap();
        assert_eq!(meta.file_name, "report.pdf");
        assert_eq!(meta.content_type, "application/pdf");
        assert!(meta.integrity_check.is_some());

        // an update without names keeps the previous ones
        let updated = vfs.put_object_bytes("b1", "report", b"%PDF-1.7").unwrap();
        assert_eq!(updated.file_name, "report.pdf");
        assert_eq!(updated.content_type, "application/pdf");
        assert_eq!(updated.creation_date, meta.creation_date);
    }

    #[test]
    fn test_invalid_object_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid0);
        vfs.create_bucket("b1").unwrap();

        for name in ["", "a/b", "..", "version", "1.json"] {
            assert_matches!(
                vfs.put_object_bytes("b1", name, b"x"),
                Err(Error::IllegalArgument(_)),
                "name {:?}",
                name
            );
        }
        assert!(vfs.context().journal.pending_operations().unwrap().is_empty());
    }
}

// =============================================================================
// Versions
// =============================================================================

mod version_tests {
    use super::*;

    #[test]
    fn test_hello_world_versions() {
        for level in ALL_LEVELS {
            let tmp = TempDir::new().unwrap();
            let vfs = open(&tmp, level);
            vfs.create_bucket("b1").unwrap();

            vfs.put_object_bytes("b1", "o1", b"hello").unwrap();
            let head = vfs.put_object_bytes("b1", "o1", b"world").unwrap();
            assert_eq!(head.version, 1);
            assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"world");

            let versions = vfs.get_object_metadata_version_all("b1", "o1").unwrap();
            assert_eq!(versions.len(), 1);
            assert_eq!(versions[0].version, 0);
            assert_eq!(vfs.read_object_version("b1", "o1", 0).unwrap(), b"hello");
            assert_eq!(vfs.read_object_version("b1", "o1", 1).unwrap(), b"world");

            let restored = vfs.restore_previous_version("b1", "o1").unwrap();
            assert_eq!(restored.version, 0, "{}", level);
            assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"hello");
            assert!(vfs.get_object_metadata_version_all("b1", "o1").unwrap().is_empty());
            assert_matches!(
                vfs.get_object_metadata_version("b1", "o1", 1),
                Err(Error::VersionNotFound { version: 1, .. })
            );
        }
    }

    #[test]
    fn test_restore_without_previous_version_fails() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        vfs.create_bucket("b1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"only").unwrap();

        assert_matches!(
            vfs.restore_previous_version("b1", "o1"),
            Err(Error::IllegalState(_))
        );
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"only");
    }

    #[test]
    fn test_version_control_off_keeps_single_version() {
        let tmp = TempDir::new().unwrap();
        let mut s = settings(&tmp, RedundancyLevel::Raid1, 2);
        s.version_control = false;
        let vfs = VirtualFileSystem::open(s).unwrap();
        vfs.create_bucket("b1").unwrap();

        vfs.put_object_bytes("b1", "o1", b"first").unwrap();
        let head = vfs.put_object_bytes("b1", "o1", b"second").unwrap();
        assert_eq!(head.version, 0);
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"second");
        assert!(vfs.get_object_metadata_version_all("b1", "o1").unwrap().is_empty());

        let bucket = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            assert!(drive.list_version_files(bucket.id).unwrap().is_empty());
        }
    }

    #[test]
    fn test_delete_previous_versions_leaves_one_head() {
        for level in ALL_LEVELS {
            let tmp = TempDir::new().unwrap();
            let vfs = open(&tmp, level);
            vfs.create_bucket("b1").unwrap();
            for content in ["a", "b", "c"] {
                vfs.put_object_bytes("b1", "o1", content.as_bytes()).unwrap();
            }
            assert_eq!(vfs.get_object_metadata("b1", "o1").unwrap().version, 2);

            vfs.delete_object_all_previous_versions("b1", "o1").unwrap();
            assert_eq!(vfs.process_pending_requests(), 1);

            let head = vfs.get_object_metadata("b1", "o1").unwrap();
            assert_eq!(head.version, 0);
            assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"c");
            assert!(vfs.get_object_metadata_version_all("b1", "o1").unwrap().is_empty());

            let bucket = vfs.get_bucket("b1").unwrap();
            for drive in vfs.context().drives.all() {
                assert!(drive.list_version_files(bucket.id).unwrap().is_empty(), "{}", level);
                let dir = drive.object_metadata_dir(bucket.id, "o1");
                if dir.exists() {
                    let files: Vec<String> = std::fs::read_dir(&dir)
                        .unwrap()
                        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                        .collect();
                    assert_eq!(files, vec!["o1.json".to_string()]);
                }
            }
        }
    }

    #[test]
    fn test_delete_bucket_all_previous_versions() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        vfs.create_bucket("b1").unwrap();
        vfs.create_bucket("b2").unwrap();
        for data in [&b"a"[..], b"b", b"c"] {
            vfs.put_object_bytes("b1", "o1", data).unwrap();
        }
        vfs.put_object_bytes("b1", "o2", b"only").unwrap();
        vfs.put_object_bytes("b2", "o3", b"x").unwrap();
        vfs.put_object_bytes("b2", "o3", b"y").unwrap();

        vfs.delete_bucket_all_previous_versions("b1").unwrap();
        assert!(vfs.process_pending_requests() >= 1);
        assert_eq!(vfs.context().scheduler.pending(), 0);

        let head = vfs.get_object_metadata("b1", "o1").unwrap();
        assert_eq!(head.version, 0);
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"c");
        assert!(vfs.get_object_metadata_version_all("b1", "o1").unwrap().is_empty());
        assert_eq!(vfs.read_object("b1", "o2").unwrap(), b"only");

        // other buckets keep their history
        assert_eq!(vfs.get_object_metadata("b2", "o3").unwrap().version, 1);
        assert_eq!(vfs.read_object_version("b2", "o3", 0).unwrap(), b"x");

        let b1 = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            assert!(drive.list_version_files(b1.id).unwrap().is_empty());
        }
    }

    #[test]
    fn test_wipe_all_previous_versions() {
        for level in ALL_LEVELS {
            let tmp = TempDir::new().unwrap();
            let vfs = open(&tmp, level);
            vfs.create_bucket("b1").unwrap();
            vfs.create_bucket("b2").unwrap();
            vfs.put_object_bytes("b1", "o1", b"first").unwrap();
            vfs.put_object_bytes("b1", "o1", b"second").unwrap();
            vfs.put_object_bytes("b2", "o2", b"one").unwrap();
            vfs.put_object_bytes("b2", "o2", b"two").unwrap();

            vfs.wipe_all_previous_versions();
            vfs.process_pending_requests();

            for (bucket, object, data) in [("b1", "o1", &b"second"[..]), ("b2", "o2", b"two")] {
                assert_eq!(vfs.get_object_metadata(bucket, object).unwrap().version, 0, "{}", level);
                assert_eq!(vfs.read_object(bucket, object).unwrap(), data, "{}", level);
                let id = vfs.get_bucket(bucket).unwrap().id;
                for drive in vfs.context().drives.all() {
                    assert!(drive.list_version_files(id).unwrap().is_empty(), "{}", level);
                }
            }
        }
    }

    #[test]
    fn test_raid6_backup_replaces_stale_version_shards() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid6);
        vfs.create_bucket("b1").unwrap();
        let large: Vec<u8> = (0..50u8).collect();
        vfs.put_object_bytes("b1", "o1", &large).unwrap();
        vfs.put_object_bytes("b1", "o1", b"small").unwrap();

        // the four-chunk .v0 shards stay on disk until the cleanup runs
        vfs.delete_object_all_previous_versions("b1", "o1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"fresh").unwrap();
        vfs.process_pending_requests();

        let bucket = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            let files = drive.list_version_files(bucket.id).unwrap();
            assert_eq!(files.len(), 1, "drive {}: {:?}", drive.name(), files);
            assert!(files[0].starts_with("o1.0."), "{:?}", files);
        }
        assert_eq!(vfs.read_object_version("b1", "o1", 0).unwrap(), b"small");
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"fresh");
    }

    #[test]
    fn test_put_object_metadata() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid6);
        vfs.create_bucket("b1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"tagged").unwrap();

        let mut meta = vfs.get_object_metadata("b1", "o1").unwrap();
        meta.content_type = "text/plain".to_string();
        meta.system_tags = Some("archived-by=test".to_string());
        vfs.put_object_metadata("b1", &meta).unwrap();

        let stored = vfs.get_object_metadata("b1", "o1").unwrap();
        assert_eq!(stored.content_type, "text/plain");
        assert_eq!(stored.system_tags.as_deref(), Some("archived-by=test"));

        meta.version = 3;
        assert_matches!(
            vfs.put_object_metadata("b1", &meta),
            Err(Error::IllegalArgument(_))
        );
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        vfs.create_bucket("b1").unwrap();

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let vfs = vfs.clone();
                std::thread::spawn(move || {
                    vfs.put_object_bytes("b1", "shared", format!("writer {}", i).as_bytes())
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let head = vfs.get_object_metadata("b1", "shared").unwrap();
        assert_eq!(head.version, 7);
        assert_eq!(
            vfs.get_object_metadata_version_all("b1", "shared").unwrap().len(),
            7
        );
        let content = String::from_utf8(vfs.read_object("b1", "shared").unwrap()).unwrap();
        assert!(content.starts_with("writer "));
    }
}

// =============================================================================
// Delete and Scheduled Cleanup
// =============================================================================

mod delete_tests {
    use super::*;

    #[test]
    fn test_delete_then_cleanup_removes_data() {
        for level in ALL_LEVELS {
            let tmp = TempDir::new().unwrap();
            let vfs = open(&tmp, level);
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "o1", b"v0").unwrap();
            vfs.put_object_bytes("b1", "o1", b"v1").unwrap();

            vfs.delete_object("b1", "o1").unwrap();
            assert!(!vfs.exists_object("b1", "o1").unwrap());
            assert_matches!(
                vfs.get_object_metadata("b1", "o1"),
                Err(Error::ObjectNotFound { .. })
            );
            assert_eq!(vfs.process_pending_requests(), 1);

            let bucket = vfs.get_bucket("b1").unwrap();
            for drive in vfs.context().drives.all() {
                assert!(drive.list_data_files(bucket.id).unwrap().is_empty(), "{}", level);
                assert!(drive.list_version_files(bucket.id).unwrap().is_empty(), "{}", level);
            }
            assert!(vfs.is_bucket_empty("b1").unwrap());

            // the name is free again
            vfs.put_object_bytes("b1", "o1", b"reborn").unwrap();
            assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"reborn");
        }
    }

    #[test]
    fn test_delete_missing_object() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid0);
        vfs.create_bucket("b1").unwrap();
        assert_matches!(
            vfs.delete_object("b1", "ghost"),
            Err(Error::ObjectNotFound { .. })
        );
    }

    #[test]
    fn test_pending_cleanup_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid1, 2);
        let bucket_id = {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "o1", b"doomed").unwrap();
            vfs.delete_object("b1", "o1").unwrap();
            vfs.get_bucket("b1").unwrap().id
        };

        let vfs = VirtualFileSystem::open(s).unwrap();
        for drive in vfs.context().drives.all() {
            assert!(drive.data_file_exists(bucket_id, "o1"));
        }
        assert_eq!(vfs.process_pending_requests(), 1);
        for drive in vfs.context().drives.all() {
            assert!(!drive.data_file_exists(bucket_id, "o1"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_worker_runs_cleanup() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        let handles = vfs.start_background();

        vfs.create_bucket("b1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"short lived").unwrap();
        let bucket_id = vfs.get_bucket("b1").unwrap().id;
        vfs.delete_object("b1", "o1").unwrap();

        let drive = vfs.context().drives.get(0).unwrap().clone();
        let mut cleaned = false;
        for _ in 0..100 {
            if !drive.data_file_exists(bucket_id, "o1") {
                cleaned = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(cleaned);

        vfs.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

// =============================================================================
// Crash Recovery
// =============================================================================

mod recovery_tests {
    use super::*;

    #[test]
    fn test_interrupted_update_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid1, 2);
        {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "o1", b"hello").unwrap();

            let bucket = vfs.get_bucket("b1").unwrap();
            let head = vfs.get_object_metadata("b1", "o1").unwrap();
            let ctx = vfs.context();
            ctx.journal
                .begin(OperationCode::UpdateObject, Some(&bucket), Some("o1"), head.version)
                .unwrap();

            // backup done, new data half written, then the process dies
            for drive in ctx.drives.all() {
                drive.copy_data_to_version(bucket.id, "o1", 0).unwrap();
                drive.save_object_metadata_version(&head).unwrap();
            }
            let drive = ctx.drives.get(0).unwrap();
            drive.put_data_bytes(bucket.id, "o1", b"garbage").unwrap();
            let mut torn = head.clone();
            torn.version = 1;
            drive.save_object_metadata(&torn).unwrap();
        }

        let vfs = VirtualFileSystem::open(s).unwrap();
        assert!(vfs.context().journal.pending_operations().unwrap().is_empty());
        let head = vfs.get_object_metadata("b1", "o1").unwrap();
        assert_eq!(head.version, 0);
        assert!(vfs.get_object_metadata_version_all("b1", "o1").unwrap().is_empty());

        let bucket = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            assert_eq!(drive.read_data(bucket.id, "o1", None).unwrap().unwrap(), b"hello");
            assert!(!drive.data_file_version_exists(bucket.id, "o1", 0));
        }
    }

    #[test]
    fn test_interrupted_create_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid6, 6);
        let bucket_id = {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            let bucket = vfs.get_bucket("b1").unwrap();
            vfs.context()
                .journal
                .begin(OperationCode::CreateObject, Some(&bucket), Some("o2"), 0)
                .unwrap();
            for (block, drive) in vfs.context().drives.all().iter().enumerate().take(3) {
                drive
                    .put_data_bytes(bucket.id, &format!("o2.0.{}", block), b"shard")
                    .unwrap();
            }
            bucket.id
        };

        let vfs = VirtualFileSystem::open(s).unwrap();
        assert!(!vfs.exists_object("b1", "o2").unwrap());
        for drive in vfs.context().drives.all() {
            assert!(drive.list_data_files(bucket_id).unwrap().is_empty());
        }
    }

    #[test]
    fn test_interrupted_delete_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid0, 3);
        {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "o1", b"keep me").unwrap();

            let bucket = vfs.get_bucket("b1").unwrap();
            let ctx = vfs.context();
            let op = ctx
                .journal
                .begin(OperationCode::DeleteObject, Some(&bucket), Some("o1"), 0)
                .unwrap();
            for drive in ctx.drives.all() {
                if drive.exists_object_metadata(bucket.id, "o1") {
                    drive.backup_metadata_dir(bucket.id, "o1", &op.id).unwrap();
                    drive.remove_object_metadata_dir(bucket.id, "o1").unwrap();
                }
            }
        }

        let vfs = VirtualFileSystem::open(s).unwrap();
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"keep me");
    }

    #[test]
    fn test_interrupted_restore_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid1, 2);
        {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "o1", b"first").unwrap();
            vfs.put_object_bytes("b1", "o1", b"second").unwrap();

            let bucket = vfs.get_bucket("b1").unwrap();
            let head = vfs.get_object_metadata("b1", "o1").unwrap();
            let previous = vfs.get_object_metadata_version("b1", "o1", 0).unwrap();
            let ctx = vfs.context();
            ctx.journal
                .begin(
                    OperationCode::RestoreObjectPreviousVersion,
                    Some(&bucket),
                    Some("o1"),
                    head.version,
                )
                .unwrap();

            // head backed up everywhere, v0 copied back on the first drive only
            for drive in ctx.drives.all() {
                drive.copy_data_to_version(bucket.id, "o1", 1).unwrap();
                drive.save_object_metadata_version(&head).unwrap();
            }
            let drive = ctx.drives.get(0).unwrap();
            drive.copy_version_to_data(bucket.id, "o1", 0).unwrap();
            drive.save_object_metadata(&previous).unwrap();
        }

        let vfs = VirtualFileSystem::open(s).unwrap();
        assert!(vfs.context().journal.pending_operations().unwrap().is_empty());
        let bucket = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            let head = drive.get_object_metadata(bucket.id, "o1").unwrap().unwrap();
            assert_eq!(head.version, 1, "drive {}", drive.name());
            assert_eq!(drive.read_data(bucket.id, "o1", None).unwrap().unwrap(), b"second");
            assert!(!drive.data_file_version_exists(bucket.id, "o1", 1));
            assert!(drive.get_object_metadata_version(bucket.id, "o1", 1).unwrap().is_none());
        }
        assert_eq!(vfs.read_object_version("b1", "o1", 0).unwrap(), b"first");
    }

    #[test]
    fn test_interrupted_previous_versions_delete_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid1, 2);
        {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            for data in [&b"a"[..], b"b", b"c"] {
                vfs.put_object_bytes("b1", "o1", data).unwrap();
            }

            let bucket = vfs.get_bucket("b1").unwrap();
            let head = vfs.get_object_metadata("b1", "o1").unwrap();
            let ctx = vfs.context();
            let op = ctx
                .journal
                .begin(
                    OperationCode::DeleteObjectPreviousVersions,
                    Some(&bucket),
                    Some("o1"),
                    head.version,
                )
                .unwrap();

            // the first drive lost its versions, the second was never reached
            let drive = ctx.drives.get(0).unwrap();
            drive.backup_metadata_dir(bucket.id, "o1", &op.id).unwrap();
            for version in 0..head.version {
                drive.remove_object_metadata_version(bucket.id, "o1", version).unwrap();
            }
            let mut trimmed = head.clone();
            trimmed.version = 0;
            drive.save_object_metadata(&trimmed).unwrap();
        }

        let vfs = VirtualFileSystem::open(s).unwrap();
        assert!(vfs.context().journal.pending_operations().unwrap().is_empty());
        let bucket = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            let head = drive.get_object_metadata(bucket.id, "o1").unwrap().unwrap();
            assert_eq!(head.version, 2, "drive {}", drive.name());
            for version in 0..2 {
                assert!(drive
                    .get_object_metadata_version(bucket.id, "o1", version)
                    .unwrap()
                    .is_some());
            }
        }
        assert_eq!(vfs.read_object_version("b1", "o1", 0).unwrap(), b"a");
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"c");
    }

    #[test]
    fn test_interrupted_metadata_update_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid1, 2);
        {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            let mut data: &[u8] = b"body";
            vfs.put_object("b1", "o1", &mut data, Some("body.txt"), Some("text/plain"))
                .unwrap();

            let bucket = vfs.get_bucket("b1").unwrap();
            let head = vfs.get_object_metadata("b1", "o1").unwrap();
            let ctx = vfs.context();
            let op = ctx
                .journal
                .begin(OperationCode::UpdateObjectMetadata, Some(&bucket), Some("o1"), head.version)
                .unwrap();

            let drive = ctx.drives.get(0).unwrap();
            drive.backup_metadata_dir(bucket.id, "o1", &op.id).unwrap();
            let mut edited = head.clone();
            edited.content_type = "application/json".to_string();
            drive.save_object_metadata(&edited).unwrap();
        }

        let vfs = VirtualFileSystem::open(s).unwrap();
        assert!(vfs.context().journal.pending_operations().unwrap().is_empty());
        let bucket = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            let head = drive.get_object_metadata(bucket.id, "o1").unwrap().unwrap();
            assert_eq!(head.content_type, "text/plain", "drive {}", drive.name());
            assert_eq!(head.file_name, "body.txt");
        }
    }

    #[test]
    fn test_recovery_ignores_backup_of_committed_delete() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid1, 2);
        {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "o1", b"old object").unwrap();
            vfs.put_object_bytes("b1", "o1", b"old object v1").unwrap();
            // committed, its metadata backup stays until the queued cleanup runs
            vfs.delete_object("b1", "o1").unwrap();
            vfs.put_object_bytes("b1", "o1", b"brand new").unwrap();

            let bucket = vfs.get_bucket("b1").unwrap();
            // the process dies before the metadata update takes its own backup
            vfs.context()
                .journal
                .begin(OperationCode::UpdateObjectMetadata, Some(&bucket), Some("o1"), 0)
                .unwrap();
        }

        let vfs = VirtualFileSystem::open(s).unwrap();
        assert!(vfs.context().journal.pending_operations().unwrap().is_empty());
        let head = vfs.get_object_metadata("b1", "o1").unwrap();
        assert_eq!(head.version, 0);
        assert_eq!(head.length, 9);
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), b"brand new");
        assert!(vfs.get_object_metadata_version_all("b1", "o1").unwrap().is_empty());
    }

    #[test]
    fn test_interrupted_bucket_create_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let s = settings(&tmp, RedundancyLevel::Raid1, 2);
        {
            let vfs = VirtualFileSystem::open(s.clone()).unwrap();
            let meta = raidvault::model::BucketMetadata::new(9, "half");
            let bucket = raidvault::ServerBucket::from(&meta);
            vfs.context()
                .journal
                .begin(OperationCode::CreateBucket, Some(&bucket), None, 0)
                .unwrap();
            vfs.context().drives.get(0).unwrap().create_bucket(&meta).unwrap();
        }

        let vfs = VirtualFileSystem::open(s).unwrap();
        assert!(!vfs.exists_bucket("half"));
        for drive in vfs.context().drives.all() {
            assert!(!drive.bucket_exists(9));
        }
    }
}

// =============================================================================
// RAID Layouts
// =============================================================================

mod layout_tests {
    use super::*;

    #[test]
    fn test_raid0_places_object_on_one_drive() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid0);
        vfs.create_bucket("b1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"striped").unwrap();

        let bucket = vfs.get_bucket("b1").unwrap();
        let holders = vfs
            .context()
            .drives
            .all()
            .iter()
            .filter(|d| d.data_file_exists(bucket.id, "o1"))
            .count();
        assert_eq!(holders, 1);
        let meta_holders = vfs
            .context()
            .drives
            .all()
            .iter()
            .filter(|d| d.exists_object_metadata(bucket.id, "o1"))
            .count();
        assert_eq!(meta_holders, 1);
    }

    #[test]
    fn test_raid1_mirrors_every_drive() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        vfs.create_bucket("b1").unwrap();
        let meta = vfs.put_object_bytes("b1", "o1", b"mirrored").unwrap();

        let bucket = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            assert_eq!(drive.read_data(bucket.id, "o1", None).unwrap().unwrap(), b"mirrored");
            assert_eq!(
                drive.hash_data_file(bucket.id, "o1", None).unwrap(),
                meta.sha256
            );
            assert_eq!(drive.get_object_metadata(bucket.id, "o1").unwrap().unwrap(), meta);
        }
    }

    #[test]
    fn test_raid6_shards_per_chunk() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid6);
        vfs.create_bucket("b1").unwrap();

        // 40 bytes over 16 byte blocks: 3 chunks of 6 shards
        let payload: Vec<u8> = (0..40u8).collect();
        let meta = vfs.put_object_bytes("b1", "o1", &payload).unwrap();
        assert_eq!(meta.total_chunks(), 3);
        assert_eq!(meta.sha256_blocks.len(), 18);

        let names = vfs.object_data_files_names("b1", "o1", None).unwrap();
        assert_eq!(names.len(), 18);
        assert!(names.contains(&"o1.2.5".to_string()));

        let bucket = vfs.get_bucket("b1").unwrap();
        for (block, drive) in vfs.context().drives.all().iter().enumerate() {
            let mut files = drive.list_data_files(bucket.id).unwrap();
            files.sort();
            let expected: Vec<String> = (0..3).map(|c| format!("o1.{}.{}", c, block)).collect();
            assert_eq!(files, expected);
        }
    }

    #[test]
    fn test_raid6_reads_with_any_four_of_six() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid6);
        vfs.create_bucket("b1").unwrap();
        let payload: Vec<u8> = (0..100u8).rev().collect();
        vfs.put_object_bytes("b1", "o1", &payload).unwrap();

        let bucket = vfs.get_bucket("b1").unwrap();
        let drives = vfs.context().drives.all().to_vec();

        // one shard gone, one corrupted, on every chunk
        for chunk in 0..7 {
            drives[1]
                .remove_data_file(bucket.id, &format!("o1.{}.1", chunk))
                .unwrap();
            std::fs::write(
                drives[4].data_file_path(bucket.id, &format!("o1.{}.4", chunk)),
                b"bitrot",
            )
            .unwrap();
        }
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), payload);

        // a third loss is beyond two parity shards
        drives[0].remove_data_file(bucket.id, "o1.0.0").unwrap();
        let mut reader = vfs.get_object("b1", "o1").unwrap();
        let mut content = Vec::new();
        assert!(std::io::Read::read_to_end(&mut reader, &mut content).is_err());
    }

    #[test]
    fn test_raid6_version_files() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid6);
        vfs.create_bucket("b1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"first version payload").unwrap();
        vfs.put_object_bytes("b1", "o1", b"second").unwrap();

        let names = vfs.object_data_files_names("b1", "o1", Some(0)).unwrap();
        assert!(names.iter().all(|n| n.ends_with(".v0")));
        assert_eq!(names.len(), 12);
        assert_eq!(
            vfs.read_object_version("b1", "o1", 0).unwrap(),
            b"first version payload"
        );
    }
}

// =============================================================================
// Listing
// =============================================================================

mod listing_tests {
    use super::*;

    fn names(items: &[Item]) -> Vec<String> {
        items
            .iter()
            .filter_map(|i| i.metadata().map(|m| m.object_name.clone()))
            .collect()
    }

    #[test]
    fn test_paged_listing_with_agent() {
        for level in ALL_LEVELS {
            let tmp = TempDir::new().unwrap();
            let vfs = open(&tmp, level);
            vfs.create_bucket("b1").unwrap();
            for i in 0..25 {
                vfs.put_object_bytes("b1", &format!("obj-{:02}", i), b"x").unwrap();
            }

            let mut seen = Vec::new();
            let first = vfs.list_objects("b1", None, Some(10), None, None).unwrap();
            assert_eq!(first.items.len(), 10);
            assert_eq!(first.offset, 10);
            assert!(!first.eod);
            seen.extend(names(&first.items));

            let agent = first.agent_id.clone().unwrap();
            let second = vfs
                .list_objects("b1", None, Some(10), None, Some(&agent))
                .unwrap();
            assert_eq!(second.items.len(), 10);
            seen.extend(names(&second.items));

            let third = vfs
                .list_objects("b1", None, Some(10), None, second.agent_id.as_deref())
                .unwrap();
            assert_eq!(third.items.len(), 5);
            assert!(third.eod);
            assert!(third.agent_id.is_none());
            seen.extend(names(&third.items));

            seen.sort();
            let expected: Vec<String> = (0..25).map(|i| format!("obj-{:02}", i)).collect();
            assert_eq!(seen, expected, "{}", level);
            assert!(vfs.context().iterators.is_empty());
        }
    }

    #[test]
    fn test_listing_offset_and_prefix() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        vfs.create_bucket("b1").unwrap();
        for name in ["Alpha-1", "alpha-2", "beta-1", "gamma-1"] {
            vfs.put_object_bytes("b1", name, b"x").unwrap();
        }

        let alphas = vfs
            .list_objects("b1", None, None, Some(" ALPHA"), None)
            .unwrap();
        let mut found = names(&alphas.items);
        found.sort();
        assert_eq!(found, vec!["Alpha-1".to_string(), "alpha-2".to_string()]);
        assert!(alphas.eod);

        let rest = vfs.list_objects("b1", Some(3), None, None, None).unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.offset, 4);
    }

    #[test]
    fn test_listing_foreign_agent_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid0);
        vfs.create_bucket("b1").unwrap();
        vfs.create_bucket("b2").unwrap();
        for i in 0..3 {
            vfs.put_object_bytes("b1", &format!("o{}", i), b"x").unwrap();
        }
        let page = vfs.list_objects("b1", None, Some(1), None, None).unwrap();
        assert_matches!(
            vfs.list_objects("b2", None, Some(1), None, page.agent_id.as_deref()),
            Err(Error::IllegalArgument(_))
        );
    }
}

// =============================================================================
// Drive Sync
// =============================================================================

mod sync_tests {
    use super::*;

    #[test]
    fn test_raid1_new_drive_is_synced() {
        let tmp = TempDir::new().unwrap();
        {
            let vfs = VirtualFileSystem::open(settings(&tmp, RedundancyLevel::Raid1, 2)).unwrap();
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "o1", b"old").unwrap();
            vfs.put_object_bytes("b1", "o1", b"new").unwrap();
            vfs.put_object_bytes("b1", "o2", b"other").unwrap();
        }

        let vfs = VirtualFileSystem::open(settings(&tmp, RedundancyLevel::Raid1, 3)).unwrap();
        let fresh = vfs.context().drives.get(2).unwrap().clone();
        assert_eq!(fresh.status(), DriveStatus::NotSync);

        let report = vfs.sync_drives().unwrap();
        assert_eq!(report.objects, 2);
        assert_eq!(report.synced, 2);
        assert_eq!(report.errors, 0);
        assert_eq!(fresh.status(), DriveStatus::Enabled);

        let bucket = vfs.get_bucket("b1").unwrap();
        assert_eq!(fresh.read_data(bucket.id, "o1", None).unwrap().unwrap(), b"new");
        assert_eq!(fresh.read_data(bucket.id, "o1", Some(0)).unwrap().unwrap(), b"old");
        assert_eq!(fresh.get_object_metadata(bucket.id, "o1").unwrap().unwrap().version, 1);
        assert!(fresh.get_object_metadata_version(bucket.id, "o1", 0).unwrap().is_some());
        assert!(fresh.sys_file("server-metadata").unwrap().is_some());
    }

    #[test]
    fn test_sync_writes_descriptor_of_bucket_touched_before_sync() {
        let tmp = TempDir::new().unwrap();
        {
            let vfs = VirtualFileSystem::open(settings(&tmp, RedundancyLevel::Raid1, 2)).unwrap();
            vfs.create_bucket("b1").unwrap();
        }

        let vfs = VirtualFileSystem::open(settings(&tmp, RedundancyLevel::Raid1, 3)).unwrap();
        vfs.put_object_bytes("b1", "o1", b"new").unwrap();
        let bucket = vfs.get_bucket("b1").unwrap();
        let fresh = vfs.context().drives.get(2).unwrap().clone();

        vfs.sync_drives().unwrap();
        let descriptor = fresh.get_bucket(bucket.id).unwrap().unwrap();
        assert_eq!(descriptor.bucket_name, "b1");
        assert_eq!(fresh.read_data(bucket.id, "o1", None).unwrap().unwrap(), b"new");
    }

    #[test]
    fn test_raid6_wiped_drive_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let payload: Vec<u8> = (0..50u8).collect();
        {
            let vfs = open(&tmp, RedundancyLevel::Raid6);
            vfs.create_bucket("b1").unwrap();
            vfs.put_object_bytes("b1", "o1", &payload).unwrap();
        }
        std::fs::remove_dir_all(tmp.path().join("drive5")).unwrap();

        let vfs = open(&tmp, RedundancyLevel::Raid6);
        let wiped = vfs.context().drives.get(5).unwrap().clone();
        assert_eq!(wiped.status(), DriveStatus::NotSync);

        let report = vfs.sync_drives().unwrap();
        assert!(report.is_complete());
        assert_eq!(wiped.status(), DriveStatus::Enabled);

        let bucket = vfs.get_bucket("b1").unwrap();
        let mut files = wiped.list_data_files(bucket.id).unwrap();
        files.sort();
        assert_eq!(files, vec!["o1.0.5", "o1.1.5", "o1.2.5", "o1.3.5"]);

        // the rebuilt parity carries the object with two other drives gone
        for drive in &vfs.context().drives.all()[0..2] {
            for chunk in 0..4 {
                drive
                    .remove_data_file(bucket.id, &format!("o1.{}.{}", chunk, drive.order()))
                    .unwrap();
            }
        }
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), payload);
    }

    #[test]
    fn test_raid0_sync_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid0);
        assert_matches!(vfs.sync_drives(), Err(Error::IllegalState(_)));
    }
}

// =============================================================================
// Integrity
// =============================================================================

mod integrity_tests {
    use super::*;

    #[test]
    fn test_raid1_bad_mirror_is_repaired() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        vfs.create_bucket("b1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"pristine").unwrap();

        let bucket = vfs.get_bucket("b1").unwrap();
        let bad = vfs.context().drives.get(1).unwrap().clone();
        std::fs::write(bad.data_file_path(bucket.id, "o1"), b"bitrot!!").unwrap();

        // checked at creation, not due yet
        assert!(vfs.check_integrity("b1", "o1", false).unwrap());
        assert_eq!(bad.read_data(bucket.id, "o1", None).unwrap().unwrap(), b"bitrot!!");

        assert!(vfs.check_integrity("b1", "o1", true).unwrap());
        assert_eq!(bad.read_data(bucket.id, "o1", None).unwrap().unwrap(), b"pristine");
        let repaired = bad.get_object_metadata(bucket.id, "o1").unwrap().unwrap();
        assert_eq!(repaired.drive, bad.name());
    }

    #[test]
    fn test_raid1_all_mirrors_bad() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);
        vfs.create_bucket("b1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"pristine").unwrap();

        let bucket = vfs.get_bucket("b1").unwrap();
        for drive in vfs.context().drives.all() {
            std::fs::write(drive.data_file_path(bucket.id, "o1"), b"bitrot").unwrap();
        }
        assert!(!vfs.check_integrity("b1", "o1", true).unwrap());
    }

    #[test]
    fn test_raid6_bad_shard_is_rewritten() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid6);
        vfs.create_bucket("b1").unwrap();
        let payload: Vec<u8> = (0..30u8).collect();
        vfs.put_object_bytes("b1", "o1", &payload).unwrap();

        let bucket = vfs.get_bucket("b1").unwrap();
        let drives = vfs.context().drives.all().to_vec();
        let original = drives[2].read_data(bucket.id, "o1.1.2", None).unwrap().unwrap();
        std::fs::write(drives[2].data_file_path(bucket.id, "o1.1.2"), b"xx").unwrap();
        drives[5].remove_data_file(bucket.id, "o1.0.5").unwrap();

        assert!(vfs.check_integrity("b1", "o1", true).unwrap());
        assert_eq!(drives[2].read_data(bucket.id, "o1.1.2", None).unwrap().unwrap(), original);
        assert!(drives[5].data_file_exists(bucket.id, "o1.0.5"));
        assert_eq!(vfs.read_object("b1", "o1").unwrap(), payload);
    }

    #[test]
    fn test_raid0_is_always_healthy() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid0);
        vfs.create_bucket("b1").unwrap();
        vfs.put_object_bytes("b1", "o1", b"solo").unwrap();
        assert!(vfs.check_integrity("b1", "o1", true).unwrap());
    }
}

// =============================================================================
// Buckets
// =============================================================================

mod bucket_tests {
    use super::*;

    #[test]
    fn test_bucket_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let vfs = open(&tmp, RedundancyLevel::Raid1);

        let b1 = vfs.create_bucket("b1").unwrap();
        let b2 = vfs.create_bucket(" b2 ").unwrap();
        assert_eq!(b2.id, b1.id + 1);
        assert_eq!(b2.name, "b2");
        assert_matches!(vfs.create_bucket("b1"), Err(Error::IllegalState(_)));
        assert_matches!(vfs.create_bucket("  "), Err(Error::IllegalArgument(_)));

        vfs.put_object_bytes("b1", "o1", b"x").unwrap();
        assert_matches!(vfs.delete_bucket("b1"), Err(Error::IllegalState(_)));

        vfs.delete_object("b1", "o1").unwrap();
        vfs.process_pending_requests();
        vfs.delete_bucket("b1").unwrap();

        assert_matches!(vfs.get_bucket("b1"), Err(Error::BucketNotFound(_)));
        assert_matches!(
            vfs.put_object_bytes("b1", "o1", b"x"),
            Err(Error::BucketNotFound(_))
        );
        for drive in vfs.context().drives.all() {
            assert!(!drive.bucket_exists(b1.id));
        }
        let names: Vec<String> = vfs.list_buckets().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["b2".to_string()]);
    }
}
