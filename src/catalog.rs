//! Persistent index of backups.
//!
//! A backup is a pair of files in the catalog directory: the raw artifact
//! `<backup_id>.bin` and its metadata sidecar `<backup_id>.json`. The pair
//! invariant (neither file visible without the other) is enforced here,
//! not by naming convention at call sites. Captures are staged under
//! `.staging/` and only renamed into the directory once their checksum
//! round-trip has passed. Mutations take an exclusive lock file so two
//! writers cannot interleave.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::chip::ChipInfo;
use crate::error::{Error, Result};
use crate::verify;

pub const SCHEMA_VERSION: u32 = 1;

const ARTIFACT_EXT: &str = "bin";
const METADATA_EXT: &str = "json";
const STAGING_DIR: &str = ".staging";
const LOCK_FILE: &str = ".lock";

/// One contiguous flash region covered by an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub start: u32,
    pub length: u32,
}

/// Metadata sidecar, paired 1:1 with its artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub schema_version: u32,
    pub backup_id: String,
    pub chip: ChipInfo,
    pub regions: Vec<Region>,
    pub checksum: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
}

/// A checksum-verified capture staged for publication.
///
/// Constructed only by [`StagedArtifact::seal`], which re-reads the staged
/// file and checks it against the digest computed while writing; holding a
/// value of this type is proof the round-trip passed. The staging file is
/// removed on drop unless publication succeeded, so cancelled and failed
/// captures leave nothing behind.
pub struct StagedArtifact {
    path: PathBuf,
    metadata: BackupMetadata,
    published: bool,
}

impl StagedArtifact {
    pub(crate) fn seal(path: PathBuf, metadata: BackupMetadata) -> Result<StagedArtifact> {
        let actual = verify::digest_reader(File::open(&path)?)?;

        if !actual.eq_ignore_ascii_case(&metadata.checksum) {
            let _ = fs::remove_file(&path);

            return Err(Error::ChecksumMismatch {
                expected: metadata.checksum,
                actual,
            });
        }

        Ok(StagedArtifact {
            path,
            metadata,
            published: false,
        })
    }

    pub fn metadata(&self) -> &BackupMetadata {
        &self.metadata
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Exclusive catalog writer lock, released on drop.
struct CatalogLock {
    path: PathBuf,
}

impl CatalogLock {
    fn acquire(dir: &Path) -> Result<CatalogLock> {
        let path = dir.join(LOCK_FILE);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(CatalogLock { path }),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(Error::Catalog(format!(
                "catalog is locked by another writer; remove {} if that writer is gone",
                path.display()
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct Catalog {
    dir: PathBuf,
}

impl Catalog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Catalog> {
        let dir = dir.into();

        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join(STAGING_DIR))?;

        Ok(Catalog { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the backup engine stages a capture before publication.
    pub fn staging_path(&self, backup_id: &str) -> PathBuf {
        self.dir
            .join(STAGING_DIR)
            .join(format!("{}.{}", backup_id, ARTIFACT_EXT))
    }

    pub fn artifact_path(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", backup_id, ARTIFACT_EXT))
    }

    fn metadata_path(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", backup_id, METADATA_EXT))
    }

    /// All catalogued backups, newest first. Unreadable sidecars and broken
    /// pairs are skipped with a warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<BackupMetadata>> {
        let mut entries = Vec::new();

        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();

            if path.extension().and_then(|ext| ext.to_str()) != Some(METADATA_EXT) {
                continue;
            }

            let metadata = match self.read_metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("skipping unreadable sidecar {}: {}", path.display(), err);
                    continue;
                }
            };

            if !self.artifact_path(&metadata.backup_id).exists() {
                warn!(
                    "skipping {}: metadata without artifact",
                    metadata.backup_id
                );
                continue;
            }

            entries.push(metadata);
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(entries)
    }

    /// Looks up one backup, checking the pair invariant on the way out.
    pub fn find(&self, backup_id: &str) -> Result<BackupMetadata> {
        let metadata_path = self.metadata_path(backup_id);

        if !metadata_path.exists() {
            return Err(Error::NotFound(backup_id.to_string()));
        }

        let metadata = self.read_metadata(&metadata_path)?;

        if metadata.backup_id != backup_id {
            return Err(Error::Catalog(format!(
                "sidecar {} names backup {}",
                metadata_path.display(),
                metadata.backup_id
            )));
        }

        if !self.artifact_path(backup_id).exists() {
            return Err(Error::Catalog(format!(
                "backup {} has metadata but no artifact",
                backup_id
            )));
        }

        Ok(metadata)
    }

    /// Publishes a sealed capture: artifact first, then sidecar, both by
    /// rename. If the sidecar cannot be placed the artifact is withdrawn so
    /// neither half becomes visible.
    pub fn register(&self, mut staged: StagedArtifact) -> Result<BackupMetadata> {
        let _lock = CatalogLock::acquire(&self.dir)?;

        let metadata = staged.metadata.clone();
        let artifact = self.artifact_path(&metadata.backup_id);
        let sidecar = self.metadata_path(&metadata.backup_id);

        if artifact.exists() || sidecar.exists() {
            return Err(Error::Catalog(format!(
                "backup id {} is already registered",
                metadata.backup_id
            )));
        }

        fs::rename(&staged.path, &artifact)?;
        staged.published = true;

        if let Err(err) = self.write_metadata(&sidecar, &metadata) {
            if let Err(rm) = fs::remove_file(&artifact) {
                warn!(
                    "could not withdraw {} after sidecar failure: {}",
                    artifact.display(),
                    rm
                );
            }

            return Err(err);
        }

        Ok(metadata)
    }

    /// Removes both halves of a backup. When only one half can be removed
    /// the residual file is logged and reported instead of claiming success.
    pub fn delete(&self, backup_id: &str) -> Result<()> {
        let _lock = CatalogLock::acquire(&self.dir)?;

        let sidecar = self.metadata_path(backup_id);
        let artifact = self.artifact_path(backup_id);

        if !sidecar.exists() && !artifact.exists() {
            return Err(Error::NotFound(backup_id.to_string()));
        }

        let mut residual = Vec::new();

        // sidecar first so a half-deleted pair is never listed
        for path in &[sidecar, artifact] {
            if !path.exists() {
                continue;
            }

            if let Err(err) = fs::remove_file(path) {
                warn!("could not remove {}: {}", path.display(), err);
                residual.push(path.display().to_string());
            }
        }

        if residual.is_empty() {
            Ok(())
        } else {
            Err(Error::Catalog(format!(
                "backup {} partially deleted; residual files: {}",
                backup_id,
                residual.join(", ")
            )))
        }
    }

    fn read_metadata(&self, path: &Path) -> Result<BackupMetadata> {
        let file = File::open(path)?;
        let metadata = serde_json::from_reader(file)?;

        Ok(metadata)
    }

    fn write_metadata(&self, path: &Path, metadata: &BackupMetadata) -> Result<()> {
        let staged = self
            .dir
            .join(STAGING_DIR)
            .join(format!("{}.{}", metadata.backup_id, METADATA_EXT));

        let mut file = File::create(&staged)?;
        serde_json::to_writer_pretty(&mut file, metadata)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&staged, path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn chip() -> ChipInfo {
        ChipInfo {
            chip_id: "24:0a:c4:01:02:03".to_string(),
            flash_size: 4 * 1024 * 1024,
            sdk_version: "1.0.0".to_string(),
        }
    }

    fn stage_at(
        catalog: &Catalog,
        backup_id: &str,
        bytes: &[u8],
        created_at: DateTime<Utc>,
    ) -> StagedArtifact {
        let path = catalog.staging_path(backup_id);
        fs::write(&path, bytes).unwrap();

        let metadata = BackupMetadata {
            schema_version: SCHEMA_VERSION,
            backup_id: backup_id.to_string(),
            chip: chip(),
            regions: vec![Region {
                name: None,
                start: 0,
                length: bytes.len() as u32,
            }],
            checksum: verify::digest(bytes),
            byte_size: bytes.len() as u64,
            created_at,
        };

        StagedArtifact::seal(path, metadata).unwrap()
    }

    fn stage(catalog: &Catalog, backup_id: &str, bytes: &[u8]) -> StagedArtifact {
        stage_at(catalog, backup_id, bytes, Utc::now())
    }

    #[test]
    fn it_should_register_and_find_a_pair() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        let staged = stage(&catalog, "one", b"payload");
        let metadata = catalog.register(staged).unwrap();

        let found = catalog.find("one").unwrap();
        assert_eq!(found.checksum, metadata.checksum);
        assert_eq!(found.byte_size, 7);
        assert!(catalog.artifact_path("one").exists());
    }

    #[test]
    fn it_should_refuse_to_seal_a_corrupted_staging_file() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        let path = catalog.staging_path("bad");
        fs::write(&path, b"actual bytes").unwrap();

        let metadata = BackupMetadata {
            schema_version: SCHEMA_VERSION,
            backup_id: "bad".to_string(),
            chip: chip(),
            regions: vec![],
            checksum: verify::digest(b"expected bytes"),
            byte_size: 12,
            created_at: Utc::now(),
        };

        match StagedArtifact::seal(path.clone(), metadata) {
            Err(Error::ChecksumMismatch { .. }) => {}
            other => panic!("expected ChecksumMismatch, got {:?}", other.map(|_| ())),
        }

        // the rejected staging file is cleaned up
        assert!(!path.exists());
    }

    #[test]
    fn it_should_list_newest_first_and_skip_orphans() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        catalog
            .register(stage_at(&catalog, "older", b"aaaa", hour_ago))
            .unwrap();
        catalog.register(stage(&catalog, "newer", b"bbbb")).unwrap();

        // orphan sidecar without artifact
        fs::write(
            catalog.dir().join("ghost.json"),
            serde_json::to_string(&stage(&catalog, "ghost", b"cccc").metadata()).unwrap(),
        )
        .unwrap();

        let listed = catalog.list().unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.backup_id.as_str()).collect();

        assert_eq!(ids, vec!["newer", "older"]);
    }

    #[test]
    fn it_should_reject_duplicate_ids() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        catalog.register(stage(&catalog, "dup", b"first")).unwrap();

        match catalog.register(stage(&catalog, "dup", b"second")) {
            Err(Error::Catalog(_)) => {}
            other => panic!("expected Catalog error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn it_should_delete_both_halves() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        catalog.register(stage(&catalog, "gone", b"bytes")).unwrap();
        catalog.delete("gone").unwrap();

        assert!(!catalog.artifact_path("gone").exists());
        assert!(matches!(catalog.find("gone"), Err(Error::NotFound(_))));
        assert!(matches!(
            catalog.delete("gone"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn it_should_flag_metadata_without_artifact() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        catalog.register(stage(&catalog, "torn", b"bytes")).unwrap();
        fs::remove_file(catalog.artifact_path("torn")).unwrap();

        assert!(matches!(catalog.find("torn"), Err(Error::Catalog(_))));
    }

    #[test]
    fn it_should_serialize_writers() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        let _lock = CatalogLock::acquire(catalog.dir()).unwrap();

        match catalog.register(stage(&catalog, "locked", b"bytes")) {
            Err(Error::Catalog(message)) => assert!(message.contains("locked")),
            other => panic!("expected Catalog error, got {:?}", other.map(|_| ())),
        }
    }
}
