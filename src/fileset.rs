//! On-disk fileset layout for one shard.
//!
//! Every block start owns a sequence of immutable fileset volumes: volume 0
//! is the warm flush, volumes >= 1 are cold flushes. Snapshots are a separate
//! fileset type numbered by their own monotonic index. Each fileset carries
//! an info file; the union of info files on disk is the authoritative truth
//! bootstrap reconstructs flush states from.
//!
//! Info files are length-prefixed bincode behind a magic header with a CRC32
//! trailer, written to a temp file and atomically renamed into place.

use crate::error::{Result, ShardError};
use crate::types::{SeriesId, SeriesMetadata, Timestamp};
use bytes::Bytes;
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const INFO_MAGIC: &[u8; 8] = b"SKDINF01";
const INFO_VERSION: u32 = 1;

/// Identity of one data fileset: the block it covers and its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilesetId {
    pub block_start: Timestamp,
    pub volume_index: i32,
}

/// Contents of a fileset info file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetInfo {
    pub block_start: Timestamp,
    pub volume_index: i32,
    /// Set only for snapshot-type filesets.
    pub snapshot_time: Option<Timestamp>,
    pub num_series: u64,
}

/// One info file read off disk; corrupt files surface their error instead of
/// aborting the whole scan.
#[derive(Debug)]
pub struct InfoFileResult {
    pub path: PathBuf,
    pub info: Result<FilesetInfo>,
}

/// A data fileset discovered on disk by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesetFile {
    pub id: FilesetId,
    pub paths: Vec<PathBuf>,
}

fn info_file_name(block_start: Timestamp, volume: i32) -> String {
    format!("fileset_{:020}_v{:05}.info", block_start, volume)
}

fn data_file_name(block_start: Timestamp, volume: i32) -> String {
    format!("fileset_{:020}_v{:05}.data", block_start, volume)
}

fn parse_fileset_name(name: &str) -> Option<(FilesetId, bool)> {
    let rest = name.strip_prefix("fileset_")?;
    let (block, rest) = rest.split_once("_v")?;
    let (volume, ext) = rest.split_once('.')?;
    let id = FilesetId {
        block_start: block.parse().ok()?,
        volume_index: volume.parse().ok()?,
    };
    match ext {
        "info" => Some((id, true)),
        "data" => Some((id, false)),
        _ => None,
    }
}

/// Writes an info file for a fileset, atomically.
pub fn write_info_file(dir: &Path, info: &FilesetInfo) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let final_path = dir.join(info_file_name(info.block_start, info.volume_index));
    let tmp_path = final_path.with_extension("info.tmp");

    let payload =
        bincode::serialize(info).map_err(|e| ShardError::Serialization(e.to_string()))?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut file = File::create(&tmp_path)?;
    file.write_all(INFO_MAGIC)?;
    file.write_all(&INFO_VERSION.to_le_bytes())?;
    file.write_all(&(payload.len() as u32).to_le_bytes())?;
    file.write_all(&payload)?;
    file.write_all(&crc.to_le_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, &final_path)?;
    sync_dir(dir)?;
    Ok(final_path)
}

/// Reads and validates one info file.
pub fn read_info_file(path: &Path) -> Result<FilesetInfo> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != INFO_MAGIC {
        return Err(ShardError::Serialization(format!(
            "bad info file magic in {}",
            path.display()
        )));
    }
    let mut u32_buf = [0u8; 4];
    file.read_exact(&mut u32_buf)?;
    let version = u32::from_le_bytes(u32_buf);
    if version != INFO_VERSION {
        return Err(ShardError::Serialization(format!(
            "unsupported info file version {} in {}",
            version,
            path.display()
        )));
    }
    file.read_exact(&mut u32_buf)?;
    let len = u32::from_le_bytes(u32_buf) as usize;
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;
    file.read_exact(&mut u32_buf)?;
    let expected = u32::from_le_bytes(u32_buf);

    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(ShardError::Serialization(format!(
            "info file checksum mismatch in {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        )));
    }

    bincode::deserialize(&payload).map_err(|e| ShardError::Serialization(e.to_string()))
}

/// Scans a shard directory for info files. Corrupt files are reported in
/// place so the caller can log and continue; the scan never aborts early.
pub fn read_info_files(dir: &Path) -> Vec<InfoFileResult> {
    let mut results = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(_) => return results,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        match parse_fileset_name(&name) {
            Some((_, true)) => {
                let path = entry.path();
                let info = read_info_file(&path);
                results.push(InfoFileResult { path, info });
            }
            _ => continue,
        }
    }
    results.sort_by_key(|r| r.path.clone());
    results
}

/// Enumerates the data filesets present in a shard directory, grouping the
/// info and data paths of each (blockStart, volume).
pub fn data_fileset_files(dir: &Path) -> Result<Vec<FilesetFile>> {
    let mut by_id: std::collections::BTreeMap<FilesetId, Vec<PathBuf>> = Default::default();
    let entries = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((id, _)) = parse_fileset_name(&name) {
            by_id.entry(id).or_default().push(entry.path());
        }
    }
    Ok(by_id
        .into_iter()
        .map(|(id, mut paths)| {
            paths.sort();
            FilesetFile { id, paths }
        })
        .collect())
}

/// Paths of every fileset entirely before `t`, the cleanup target set for
/// expired retention.
pub fn fileset_paths_before(dir: &Path, t: Timestamp) -> Result<Vec<PathBuf>> {
    Ok(data_fileset_files(dir)?
        .into_iter()
        .filter(|f| f.id.block_start < t)
        .flat_map(|f| f.paths)
        .collect())
}

/// Deletes the given files, continuing past individual failures.
pub fn delete_files(paths: &[PathBuf]) -> Result<()> {
    let mut multi = crate::error::MultiError::new();
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "could not delete fileset file");
                multi.add(err.into());
            }
        }
    }
    multi.final_result()
}

/// True when any volume exists for the block start.
pub fn fileset_exists_at(dir: &Path, block_start: Timestamp) -> Result<bool> {
    Ok(data_fileset_files(dir)?
        .iter()
        .any(|f| f.id.block_start == block_start))
}

/// Highest volume present on disk for the block start.
pub fn latest_volume(dir: &Path, block_start: Timestamp) -> Result<Option<i32>> {
    Ok(data_fileset_files(dir)?
        .iter()
        .filter(|f| f.id.block_start == block_start)
        .map(|f| f.id.volume_index)
        .max())
}

fn sync_dir(dir: &Path) -> Result<()> {
    let file = File::open(dir)?;
    file.sync_all()?;
    Ok(())
}

/// A convenience handle exposing the data file path of a fileset.
pub fn data_file_path(dir: &Path, block_start: Timestamp, volume: i32) -> PathBuf {
    dir.join(data_file_name(block_start, volume))
}

/// One metadata record read from a flushed fileset.
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub id: SeriesId,
    pub tags: Vec<(Bytes, Bytes)>,
    pub size: i64,
    pub checksum: Option<u32>,
}

/// Position a metadata reader resumes from, carried in page tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderPosition {
    pub metadata_idx: i64,
    pub volume: i32,
}

/// A reader over the metadata records of one fileset volume.
pub trait MetadataReader: Send {
    /// Next record, or `None` at the clean end of the volume.
    fn read_metadata(&mut self) -> Result<Option<MetadataEntry>>;

    /// Number of metadata records consumed so far.
    fn metadata_read(&self) -> i64;

    /// The volume actually being read. May differ from a requested position
    /// when a cold flush advanced the fileset between pages.
    fn volume(&self) -> i32;
}

/// The namespace's cache of fileset readers. Readers are borrowed with `get`
/// and must be returned with `put`; after `put` the reader is shared state
/// and must not be touched.
pub trait NamespaceReaderManager: Send + Sync {
    fn fileset_exists_at(&self, shard: u32, block_start: Timestamp) -> Result<bool>;

    fn get(
        &self,
        shard: u32,
        block_start: Timestamp,
        position: ReaderPosition,
    ) -> Result<Box<dyn MetadataReader>>;

    fn put(&self, reader: Box<dyn MetadataReader>) -> Result<()>;

    fn latest_volume(&self, shard: u32, block_start: Timestamp) -> Result<i32>;
}

/// A streaming reader over the (metadata, segment) pairs of one fileset.
pub trait StreamingReader: Send {
    fn read(&mut self) -> Result<Option<(SeriesMetadata, Bytes)>>;

    fn volume(&self) -> i32;
}

/// Opens streaming readers over flushed filesets.
pub trait StreamingReaderFactory: Send + Sync {
    fn open_reader(
        &self,
        shard: u32,
        block_start: Timestamp,
        volume: i32,
    ) -> Result<Box<dyn StreamingReader>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(block_start: Timestamp, volume: i32) -> FilesetInfo {
        FilesetInfo {
            block_start,
            volume_index: volume,
            snapshot_time: None,
            num_series: 3,
        }
    }

    #[test]
    fn info_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let original = info(7200, 2);
        let path = write_info_file(dir.path(), &original).unwrap();
        let read = read_info_file(&path).unwrap();
        assert_eq!(read, original);
    }

    #[test]
    fn corrupt_info_file_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        write_info_file(dir.path(), &info(0, 0)).unwrap();

        // Truncate a second info file mid-payload.
        let bad = dir.path().join(info_file_name(7200, 0));
        fs::write(&bad, b"SKDINF01garbage").unwrap();

        let results = read_info_files(dir.path());
        assert_eq!(results.len(), 2);
        let ok = results.iter().filter(|r| r.info.is_ok()).count();
        let failed = results.iter().filter(|r| r.info.is_err()).count();
        assert_eq!(ok, 1);
        assert_eq!(failed, 1);
    }

    #[test]
    fn checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let path = write_info_file(dir.path(), &info(0, 1)).unwrap();

        // Flip one payload byte past the header.
        let mut raw = fs::read(&path).unwrap();
        let idx = raw.len() - 5;
        raw[idx] ^= 0xff;
        fs::write(&path, raw).unwrap();

        match read_info_file(&path) {
            Err(ShardError::Serialization(msg)) => assert!(msg.contains("checksum"), "{}", msg),
            other => panic!("expected checksum error, got {:?}", other),
        }
    }

    #[test]
    fn enumerate_and_filter_filesets() {
        let dir = TempDir::new().unwrap();
        for (block, volume) in [(0, 0), (0, 1), (7200, 0)] {
            write_info_file(dir.path(), &info(block, volume)).unwrap();
            fs::write(data_file_path(dir.path(), block, volume), b"x").unwrap();
        }

        let files = data_fileset_files(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(
            files[0].id,
            FilesetId { block_start: 0, volume_index: 0 }
        );
        // Info and data paths grouped per fileset.
        assert_eq!(files[0].paths.len(), 2);

        assert!(fileset_exists_at(dir.path(), 0).unwrap());
        assert!(fileset_exists_at(dir.path(), 7200).unwrap());
        assert!(!fileset_exists_at(dir.path(), 14400).unwrap());
        assert_eq!(latest_volume(dir.path(), 0).unwrap(), Some(1));
        assert_eq!(latest_volume(dir.path(), 14400).unwrap(), None);

        let before = fileset_paths_before(dir.path(), 7200).unwrap();
        assert_eq!(before.len(), 4); // two volumes of block 0, info + data each

        delete_files(&before).unwrap();
        assert!(!fileset_exists_at(dir.path(), 0).unwrap());
        assert!(fileset_exists_at(dir.path(), 7200).unwrap());
    }

    #[test]
    fn delete_missing_files_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = vec![dir.path().join("fileset_0_v00000.data")];
        delete_files(&missing).unwrap();
    }

    #[test]
    fn name_parsing_rejects_foreign_files() {
        assert!(parse_fileset_name("fileset_00000000000000000000_v00000.info").is_some());
        assert!(parse_fileset_name("fileset_00000000000000000000_v00000.data").is_some());
        assert!(parse_fileset_name("fileset_00000000000000000000_v00000.tmp").is_none());
        assert!(parse_fileset_name("manifest.bin").is_none());
        assert!(parse_fileset_name("fileset_abc_v1.data").is_none());
    }
}
