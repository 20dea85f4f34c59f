//! Atomic file writes, grounded on the teacher's `fs::write_file_atomic`:
//! write to a uniquely named temp file in the same directory, then rename
//! over the target. The rename is the atomicity boundary — readers never
//! observe a partially written file.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::Result;

pub fn write_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let parent = path.parent().unwrap_or(Path::new("."));

    let mut temp_file = NamedTempFile::new_in(parent)?;
    temp_file.write_all(content)?;
    temp_file
        .persist(path)
        .map_err(|e| crate::error::OrchError::Io(e.error))?;
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_file_atomic(&path, b"{\"a\":1}").unwrap();
        let read = std::fs::read_to_string(&path).unwrap();
        assert_eq!(read, "{\"a\":1}");
    }

    #[test]
    fn overwrite_replaces_contents_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");
        write_file_atomic(&path, b"first").unwrap();
        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }
}
