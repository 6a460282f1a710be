//! Temporary-file naming and the startup orphan sweep.
//!
//! Temp files live under `<root>/pgsql_tmp/` with names prefixed
//! `pgsql_tmp_`; cleanup only ever deletes names carrying that prefix, so
//! a sweep can never eat a file this layer did not create.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Directory, relative to a temp root, holding temporary files.
pub(crate) const PG_TEMP_FILES_DIR: &str = "pgsql_tmp";

/// Prefix every temporary file name starts with.
pub(crate) const PG_TEMP_FILE_PREFIX: &str = "pgsql_tmp";

/// Relative path prefix for a temp file: `pgsql_tmp/pgsql_tmp_<label>`.
fn temp_file_prefix(label: &str) -> String {
    format!("{PG_TEMP_FILES_DIR}/{PG_TEMP_FILE_PREFIX}_{label}")
}

/// Build the relative path of a temporary file.
///
/// The unique form embeds the pid and a per-process counter so concurrent
/// requests on the same host cannot collide; the shared form is
/// predictable from `(label, extent)` alone so cooperating processes can
/// open the same file.
pub(crate) fn temp_file_path(label: &str, extent: u32, unique: Option<u64>, pid: u32) -> String {
    let prefix = temp_file_prefix(label);
    match unique {
        Some(counter) => format!("{prefix}_{pid}_{extent:04}.{counter}"),
        None => format!("{prefix}.{extent:04}"),
    }
}

/// Whether a file name matches the temp-file prefix. Checked before any
/// deletion.
pub(crate) fn has_temp_file_prefix(name: &str) -> bool {
    name.starts_with(PG_TEMP_FILE_PREFIX)
}

/// Sweep one `pgsql_tmp` directory, unlinking every prefixed entry.
/// Anything else is logged and left alone. A missing directory is normal.
pub(crate) fn remove_temp_files_in_dir(tmpdir: &Path) {
    let entries = match std::fs::read_dir(tmpdir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(dir = %tmpdir.display(), error = %e, "could not open temporary-files directory");
            return;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let rm_path = tmpdir.join(&name);

        if name.to_string_lossy().starts_with(PG_TEMP_FILE_PREFIX) {
            debug!(path = %rm_path.display(), "removing orphaned temporary file");
            // Note we ignore any error here.
            let _ = std::fs::remove_file(&rm_path);
        } else {
            warn!(path = %rm_path.display(), "unexpected file found in temporary-files directory");
        }
    }
}

/// Temp directories to sweep at startup: one per database subdirectory
/// plus the top-level one under the temp root.
pub(crate) fn sweep_targets(data_dir: &Path, temp_dir: &Path) -> Vec<PathBuf> {
    let mut targets = Vec::new();

    let base = data_dir.join("base");
    if let Ok(entries) = std::fs::read_dir(&base) {
        for entry in entries.flatten() {
            targets.push(entry.path().join(PG_TEMP_FILES_DIR));
        }
    }

    targets.push(temp_dir.join(PG_TEMP_FILES_DIR));
    targets
}
