pub mod book;
pub mod run;

use std::path::Path;

use tokio::fs;

use crate::error::LedgerError;

/// Reads a JSON record. `Ok(None)` when the file does not exist; a file that
/// exists but does not parse is reported as corruption and left untouched.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, LedgerError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(LedgerError::io(path, err)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| LedgerError::Corruption {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

/// Writes `value` to a sibling temp file, then renames it over `path`, so
/// readers see either the old record or the new one.
pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), LedgerError> {
    let parent = path.parent().ok_or_else(|| {
        LedgerError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;
    fs::create_dir_all(parent)
        .await
        .map_err(|err| LedgerError::io(parent, err))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).map_err(LedgerError::Serialize)?;
    fs::write(&tmp_path, &data)
        .await
        .map_err(|err| LedgerError::io(&tmp_path, err))?;
    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(LedgerError::io(path, err));
    }
    Ok(())
}
