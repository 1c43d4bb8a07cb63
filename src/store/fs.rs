use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Atomically replace `path` with `content`.
///
/// Writes a sibling temporary file, syncs it to disk, then renames it over
/// the target so readers never observe a half-written store.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    std::fs::rename(&temp_path, path)
}
