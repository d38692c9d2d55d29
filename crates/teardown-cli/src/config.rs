//! Install directory contents read by the CLI
//!
//! The installer leaves `metadata.json` in the asset directory; it is the
//! only input `teardown destroy` needs besides credentials.

use std::path::{Path, PathBuf};

use teardown_destroy::ClusterMetadata;

use crate::{Error, Result};

/// File written by the installer describing the cluster
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Path of the metadata file inside `dir`
pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE_NAME)
}

/// Read and parse the cluster metadata from an install directory
pub fn load_metadata(dir: &Path) -> Result<ClusterMetadata> {
    let path = metadata_path(dir);
    if !path.is_file() {
        return Err(Error::MetadataNotFound {
            dir: dir.to_path_buf(),
        });
    }

    let raw = std::fs::read_to_string(&path)?;
    let metadata: ClusterMetadata = serde_json::from_str(&raw)?;
    Ok(metadata)
}
