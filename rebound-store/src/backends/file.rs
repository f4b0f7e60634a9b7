use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use rebound_common::{JobId, ScheduledJob, internal};
use serde::Deserialize;
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    SerializationError, StoreError, ValidationError,
    store::{JobStore, sort_jobs},
};

const TEMP_PREFIX: &str = ".tmp_";
const DELETED_SUFFIX: &str = ".deleted";

/// File-based job store
///
/// Each job is one bincode file named after its id (`{ulid}.job`).
///
/// # Atomicity
/// Writes go to `.tmp_{ulid}.job`, are synced, then renamed over the final
/// name, so a crash never leaves a half-written job behind. Deletes rename to
/// `{ulid}.job.deleted` before removing; leftovers of either kind are cleaned
/// up by [`FileJobStore::init`].
#[derive(Debug, Clone)]
pub struct FileJobStore {
    path: PathBuf,
}

impl Default for FileJobStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/rebound/jobs"),
        }
    }
}

impl<'de> Deserialize<'de> for FileJobStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileJobStoreHelper {
            path: PathBuf,
        }

        let helper = FileJobStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self { path: helper.path })
    }
}

impl FileJobStore {
    /// Validate a store path
    ///
    /// Rejects `..` components, relative paths and sensitive system directories.
    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentDirectory(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc",
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/boot",
            "/sys",
            "/proc",
            "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileJobStoreBuilder {
        FileJobStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initialise the store directory
    ///
    /// Creates the directory if needed and removes leftovers of interrupted
    /// writes and deletes.
    ///
    /// # Errors
    /// - If the directory cannot be created or read
    /// - If the path exists but is not a directory
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising job store at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        self.cleanup_orphans()
    }

    fn cleanup_orphans(&self) -> crate::Result<()> {
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.ends_with(DELETED_SUFFIX) || filename.starts_with(TEMP_PREFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from job store"
            );
        }

        Ok(())
    }

    fn job_path(&self, id: &JobId) -> PathBuf {
        self.path.join(id.filename())
    }

    fn encode(job: &ScheduledJob) -> crate::Result<Vec<u8>> {
        bincode::serde::encode_to_vec(job, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(SerializationError::Encode(e)))
    }

    fn decode(id: &JobId, bytes: &[u8]) -> crate::Result<ScheduledJob> {
        let (job, _): (ScheduledJob, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(SerializationError::Decode)?;

        if job.id != *id {
            return Err(SerializationError::Mismatch {
                file: *id,
                found: job.id,
            }
            .into());
        }

        Ok(job)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, job), fields(id = %job.id))]
    async fn put(&self, job: &ScheduledJob) -> crate::Result<()> {
        let bytes = Self::encode(job)?;
        let final_path = self.job_path(&job.id);
        let temp_path = self.path.join(format!("{TEMP_PREFIX}{}", job.id.filename()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &final_path).await?;

        internal!(level = DEBUG, "Persisted {} to {}", job.id, final_path.display());

        Ok(())
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self), fields(id = %id))]
    async fn get(&self, id: &JobId) -> crate::Result<Option<ScheduledJob>> {
        match fs::read(self.job_path(id)).await {
            Ok(bytes) => Self::decode(id, &bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self), fields(id = %id))]
    async fn delete(&self, id: &JobId) -> crate::Result<bool> {
        let path = self.job_path(id);
        let deleted_path = self.path.join(format!("{}{DELETED_SUFFIX}", id.filename()));

        match fs::rename(&path, &deleted_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        fs::remove_file(&deleted_path).await?;

        internal!(level = DEBUG, "Deleted {id} from job store");

        Ok(true)
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    async fn scan_all(&self) -> crate::Result<Vec<ScheduledJob>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut jobs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(TEMP_PREFIX) {
                continue;
            }

            let Some(id) = JobId::from_filename(&filename) else {
                continue;
            };

            let bytes = fs::read(entry.path()).await?;
            match Self::decode(&id, &bytes) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    tracing::warn!(job = %id, error = %err, "Skipping unreadable job file");
                }
            }
        }

        sort_jobs(&mut jobs);

        internal!(level = DEBUG, "Found {} jobs in store", jobs.len());

        Ok(jobs)
    }

    async fn flush(&self) -> crate::Result<()> {
        // Renames are only durable once the directory entry itself is synced.
        #[cfg(unix)]
        fs::File::open(&self.path).await?.sync_all().await?;

        Ok(())
    }
}

/// Builder for `FileJobStore`
#[derive(Debug, Default)]
pub struct FileJobStoreBuilder {
    path: PathBuf,
}

impl FileJobStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn build(self) -> crate::Result<FileJobStore> {
        FileJobStore::validate_path(&self.path)?;
        Ok(FileJobStore { path: self.path })
    }
}
