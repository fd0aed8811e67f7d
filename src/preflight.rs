use std::{fs, path::Path};

use crate::error::PreflightError;

const PROBE_FILE: &str = ".icloud-photo-export-probe";

/// Makes sure downloads can be written to `path`, creating it if needed.
pub fn check_download_dir(path: &Path) -> Result<(), PreflightError> {
    fs::create_dir_all(path).map_err(|source| PreflightError::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;

    if !path.is_dir() {
        return Err(PreflightError::NotADirectory(path.to_path_buf()));
    }

    let probe = path.join(PROBE_FILE);
    fs::write(&probe, b"").map_err(|source| PreflightError::NotWritable {
        path: path.to_path_buf(),
        source,
    })?;
    let _ = fs::remove_file(&probe);

    Ok(())
}
