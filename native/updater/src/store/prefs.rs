use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, trace};

/// Small persisted key-value file.
///
/// The whole map lives in memory; every committed edit rewrites the file before the
/// in-memory map changes, so a failed write leaves both sides untouched.
#[derive(Debug)]
pub struct Prefs {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl Prefs {
    #[instrument(err)]
    pub fn open(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let content = fs_err::read_to_string(path).context("Failed to read status file")?;
            serde_json::from_str(&content).context("Failed to parse status file")?
        } else {
            debug!(path = %path.display(), "Status file doesn't exist, starting empty");
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), values })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .with_context(|| format!("Invalid value stored under {key}"))
            })
            .transpose()
    }

    pub fn edit(&mut self) -> Edit<'_> {
        let staged = self.values.clone();
        Edit { prefs: self, staged }
    }

    fn write(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        fs_err::create_dir_all(parent).context("Failed to create status directory")?;

        let json = serde_json::to_vec_pretty(values).context("Failed to serialize status")?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).context("Failed to create temporary file")?;
        tmp.write_all(&json).context("Failed to write temporary status file")?;
        tmp.as_file().sync_all().context("Failed to sync temporary status file")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Batch of changes applied by [`Edit::commit`].
pub struct Edit<'a> {
    prefs: &'a mut Prefs,
    staged: BTreeMap<String, Value>,
}

impl Edit<'_> {
    pub fn put(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.staged.insert(key.to_string(), value.into());
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.staged.remove(key);
        self
    }

    pub fn commit(self) -> Result<()> {
        if self.staged == self.prefs.values {
            trace!("No changes to commit");
            return Ok(());
        }
        self.prefs.write(&self.staged)?;
        self.prefs.values = self.staged;
        Ok(())
    }
}
