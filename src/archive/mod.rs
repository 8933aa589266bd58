//! On-disk backup container: one zip per run with two logical entries,
//! `records.json` (the captured records, order preserved) and
//! `manifest.json`. Older archives without a manifest stay readable.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::models::RunKind;
use crate::error::AppError;
use crate::kintone::types::Record;

pub const SCHEMA_VERSION: u32 = 1;

const RECORDS_ENTRY: &str = "records.json";
const MANIFEST_ENTRY: &str = "manifest.json";

/// Archive metadata. `field_schema` is a best-effort snapshot; its absence
/// never fails a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub app_id: u64,
    pub record_count: usize,
    pub captured_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_schema: Option<serde_json::Value>,
}

/// Byte accounting out of a write, for the compression-ratio field.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveStats {
    /// Uncompressed length of the record payload.
    pub raw_bytes: u64,
    /// Final size of the container on disk.
    pub compressed_bytes: u64,
}

/// Conventional archive file name: `<app_id>_<timestamp>_<kind>.zip`.
pub fn archive_file_name(app_id: u64, kind: RunKind, at: &chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "{}_{}_{}.zip",
        app_id,
        at.format("%Y%m%dT%H%M%SZ"),
        kind.as_str()
    )
}

/// Write records + manifest into a fresh container at `path`, deflated.
pub fn write_archive(
    path: &Path,
    records: &[Record],
    manifest: &Manifest,
) -> Result<ArchiveStats, AppError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let payload = serde_json::to_vec(records)?;
    let raw_bytes = payload.len() as u64;

    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(RECORDS_ENTRY, options)?;
    zip.write_all(&payload)?;

    zip.start_file(MANIFEST_ENTRY, options)?;
    zip.write_all(&serde_json::to_vec_pretty(manifest)?)?;

    zip.finish()?;

    let compressed_bytes = std::fs::metadata(path)?.len();
    Ok(ArchiveStats {
        raw_bytes,
        compressed_bytes,
    })
}

/// Read a container back. A missing manifest entry (older archives) yields
/// `None`; an unparsable one is logged and treated the same rather than
/// making the whole archive unreadable.
pub fn read_archive(path: &Path) -> Result<(Vec<Record>, Option<Manifest>), AppError> {
    let file = File::open(path)?;
    let mut zip = ZipArchive::new(file)?;

    let records: Vec<Record> = {
        let mut entry = zip.by_name(RECORDS_ENTRY)?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        serde_json::from_slice(&buf)?
    };

    let manifest = match zip.by_name(MANIFEST_ENTRY) {
        Ok(mut entry) => {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            match serde_json::from_slice(&buf) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Manifest entry unreadable; ignoring");
                    None
                }
            }
        }
        Err(zip::result::ZipError::FileNotFound) => None,
        Err(e) => return Err(e.into()),
    };

    Ok((records, manifest))
}
