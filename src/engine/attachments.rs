//! Best-effort download of file-field attachments alongside an archive.
//! A failed download is logged and skipped; it never fails the owning backup.

use std::collections::BTreeSet;
use std::path::Path;

use crate::kintone::client::KintoneClient;
use crate::kintone::types::{record_id, FieldValue, Record};

/// Outcome of one attachment sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentSummary {
    pub attempted: usize,
    pub downloaded: usize,
    pub failed: usize,
}

/// Field codes carrying attachments in the captured set.
///
/// Known limitation, preserved deliberately: by default only the FIRST record
/// is inspected, so a file field that happens to be empty on that record is
/// never discovered even when later records hold data in it. Setting
/// `scan_all` (the `scan_all_records_for_attachments` config flag) widens the
/// scan to every record.
pub fn discover_file_fields(records: &[Record], scan_all: bool) -> Vec<String> {
    let scan = if scan_all {
        records
    } else {
        &records[..records.len().min(1)]
    };

    let mut codes = BTreeSet::new();
    for record in scan {
        for (code, value) in record {
            if let FieldValue::File(files) = value {
                if !files.is_empty() {
                    codes.insert(code.clone());
                }
            }
        }
    }
    codes.into_iter().collect()
}

/// Download every attachment under the discovered fields into
/// `<dest_dir>/<record id>/<field code>/<file name>`. Failures are counted,
/// logged and skipped.
pub async fn download_all(
    client: &KintoneClient,
    records: &[Record],
    fields: &[String],
    dest_dir: &Path,
) -> AttachmentSummary {
    let mut summary = AttachmentSummary::default();

    for (idx, record) in records.iter().enumerate() {
        let record_dir = record_id(record).unwrap_or_else(|| format!("record_{idx}"));
        for code in fields {
            let Some(FieldValue::File(files)) = record.get(code) else {
                continue;
            };
            for file in files {
                summary.attempted += 1;
                let dest = dest_dir
                    .join(&record_dir)
                    .join(code)
                    .join(sanitize_file_name(&file.name));

                if let Some(parent) = dest.parent() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        tracing::warn!(file = %file.name, error = %e, "Attachment dir create failed; skipping");
                        summary.failed += 1;
                        continue;
                    }
                }
                match client.download_attachment(&file.file_key, &dest).await {
                    Ok(bytes) => {
                        tracing::debug!(file = %file.name, bytes, "Attachment downloaded");
                        summary.downloaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(file = %file.name, key = %file.file_key, error = %e, "Attachment download failed; skipping");
                        summary.failed += 1;
                    }
                }
            }
        }
    }
    summary
}

/// Keep file names from escaping their record directory.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
