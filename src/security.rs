use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Default location of the checksum file for an artifact: `<artifact>.sha256`.
pub fn checksum_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Write `sha256sum`-compatible output for `path` into `output`.
///
/// The line names the artifact by file name only so the checksum file stays
/// valid next to the artifact wherever both are downloaded.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{digest}  {name}").with_context(|| {
        format!(
            "Failed to write digest for '{}' into '{}'.",
            path.display(),
            output.display()
        )
    })?;
    Ok(digest)
}

/// Check `path` against the first digest recorded in `checksum_file`.
pub fn verify_sha256(path: &Path, checksum_file: &Path) -> Result<String> {
    let recorded = fs::read_to_string(checksum_file)
        .with_context(|| format!("Failed to read {}", checksum_file.display()))?;
    let Some(expected) = recorded.split_whitespace().next() else {
        bail!("{} contains no digest", checksum_file.display());
    };
    let actual = compute_sha256(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!(
            "Digest mismatch for {}: expected {expected}, found {actual}",
            path.display()
        );
    }
    Ok(actual)
}
