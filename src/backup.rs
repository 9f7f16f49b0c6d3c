use serde_json::Value;
use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};
use tracing::warn;

/// File-resident, advisory copy of whitelist membership (a JSON array of ids).
#[derive(Debug, Clone)]
pub struct BackupFile {
    path: PathBuf,
}

impl BackupFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files load as empty; they never fail the caller.
    pub async fn load(&self) -> BTreeSet<u64> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return BTreeSet::new(),
            Err(err) => {
                warn!(target = "listing_bot.backup", path = %self.path.display(), error = %err, "backup_read_failed");
                return BTreeSet::new();
            }
        };
        match parse_ids(&raw) {
            Some(ids) => ids,
            None => {
                warn!(target = "listing_bot.backup", path = %self.path.display(), "backup_unparsable_treated_as_empty");
                BTreeSet::new()
            }
        }
    }

    /// Writes to a sibling temp file and renames it over the target.
    pub async fn save(&self, ids: &BTreeSet<u64>) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec(&ids.iter().collect::<Vec<_>>())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

/// Accepts numbers and numeric strings; anything else makes the whole file invalid.
fn parse_ids(raw: &str) -> Option<BTreeSet<u64>> {
    if raw.trim().is_empty() {
        return Some(BTreeSet::new());
    }
    let values: Vec<Value> = serde_json::from_str(raw).ok()?;
    values
        .into_iter()
        .map(|value| match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        })
        .collect()
}
