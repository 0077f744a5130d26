use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::IngestError;

/// Verified unpack of a product archive into `target_dir`. Every entry is
/// fully decompressed to a sink before anything is written, so a truncated
/// or corrupt archive never leaves a partial tree behind. Returns the
/// number of files written.
pub fn unpack_archive(zip_path: &Path, target_dir: &Path) -> Result<usize, IngestError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        IngestError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| IngestError::Filesystem(err.to_string()))?;

    // Verification pass: decompressing to a sink catches truncation and
    // CRC errors, and every entry path is vetted, before the target
    // directory is touched.
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        if entry.enclosed_name().is_none() {
            return Err(IngestError::Filesystem(format!(
                "zip entry {} escapes the extraction directory",
                entry.name()
            )));
        }
        if !entry.is_dir() {
            io::copy(&mut entry, &mut io::sink())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
    }

    let mut files_written = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => continue, // vetted above
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        files_written += 1;
    }
    Ok(files_written)
}

/// Find the single file named `file_name` anywhere under `root`.
pub fn find_file(root: &Path, file_name: &str) -> Result<Option<PathBuf>, IngestError> {
    for path in walk_dir(root)? {
        if path.is_file() && path.file_name().map(|name| name == file_name).unwrap_or(false) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
