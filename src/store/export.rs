//! Best-effort flat export of the work-item set.
//!
//! One JSONL line per item, written to a temp file and renamed into place so
//! readers never observe a torn file. Failures are logged, never propagated.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::domain::WorkItem;
use crate::error::Result;

/// Write the export on a detached thread.
pub(crate) fn spawn_export(path: &Path, items: Vec<WorkItem>) {
    let path = path.to_path_buf();
    std::thread::spawn(move || {
        if let Err(e) = write_export(&path, &items) {
            tracing::warn!(path = %path.display(), error = %e, "work item export failed");
        }
    });
}

/// Write all items as JSONL via temp file + rename.
pub(crate) fn write_export(path: &Path, items: &[WorkItem]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("jsonl.tmp");
    {
        let file: File = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut file = std::io::BufWriter::new(file);
        for item in items {
            let line = serde_json::to_string(item)?;
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
    }
    fs::rename(&tmp_path, path)?;

    Ok(())
}
