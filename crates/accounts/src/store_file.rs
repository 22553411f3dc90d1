//! One JSON file per account, written atomically.

use std::{io, path::PathBuf};

use {async_trait::async_trait, tokio::fs, tracing::warn};

use crate::{
    error::{Error, Result},
    store::{
        AccountRecord, CredentialStore, LoadReport, StoredAccount, file_name, parse_file_name,
    },
    types::AccountKey,
};

/// Directory-backed store. Each account lives in `<owner>_<account>.json`.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn path_for(&self, key: &AccountKey) -> PathBuf {
        self.dir.join(file_name(key))
    }

    async fn read_record(&self, name: &str) -> std::result::Result<StoredAccount, String> {
        let key = parse_file_name(name).map_err(|e| e.to_string())?;
        let raw = fs::read_to_string(self.dir.join(name))
            .await
            .map_err(|e| e.to_string())?;
        let record: AccountRecord = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        record.into_stored(key).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_all(&self) -> Result<LoadReport> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LoadReport::default()),
            Err(e) => {
                return Err(Error::persistence(
                    format!("failed to list {}", self.dir.display()),
                    e,
                ));
            },
        };

        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if let Some(name) = entry.file_name().to_str()
                        && name.ends_with(".json")
                    {
                        names.push(name.to_string());
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    return Err(Error::persistence(
                        format!("failed to list {}", self.dir.display()),
                        e,
                    ));
                },
            }
        }
        // Restore order is file-name order so the first account per owner
        // is stable across restarts.
        names.sort();

        let mut report = LoadReport::default();
        for name in names {
            match self.read_record(&name).await {
                Ok(stored) => report.records.push(stored),
                Err(reason) => {
                    warn!(file = %name, %reason, "skipping unreadable account record");
                    report.skipped += 1;
                },
            }
        }
        Ok(report)
    }

    async fn save(&self, record: &StoredAccount) -> Result<()> {
        let path = self.path_for(&record.key());
        let context = || format!("failed to write {}", path.display());

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::persistence(context(), e))?;
        let json = serde_json::to_string_pretty(&AccountRecord::from_stored(record))
            .map_err(|e| Error::persistence(context(), e))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| Error::persistence(context(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| Error::persistence(context(), e))?;
        }
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::persistence(context(), e))?;
        Ok(())
    }

    async fn delete(&self, key: &AccountKey) -> Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::persistence(
                format!("failed to delete {}", path.display()),
                e,
            )),
        }
    }
}
