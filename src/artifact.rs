//! Local data artifact: a directory holding one parquet file per data key.
//!
//! ```text
//! <root>/
//!   manifest.yaml                       # keys + id of the last writing session
//!   cause.asthma.remission.parquet
//!   population.age_bins.parquet
//! ```

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::debug;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WashoutError;

const MANIFEST: &str = "manifest.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    build_id: Option<Uuid>,
    keys: BTreeSet<String>,
}

#[derive(Debug)]
pub struct Artifact {
    root: PathBuf,
    session: Uuid,
    manifest: Manifest,
}

impl Artifact {
    /// Open the artifact at `root`, creating an empty one if missing.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, WashoutError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let manifest_path = root.join(MANIFEST);
        let manifest = if manifest_path.exists() {
            serde_yaml::from_str(&fs::read_to_string(&manifest_path)?)?
        } else {
            Manifest::default()
        };
        Ok(Self {
            root,
            session: Uuid::new_v4(),
            manifest,
        })
    }

    /// Open for a build: keep existing content when appending, otherwise
    /// start from an empty artifact.
    pub fn create<P: AsRef<Path>>(root: P, append: bool) -> Result<Self, WashoutError> {
        let root = root.as_ref();
        if !append && root.exists() {
            let existing = Self::open(root)?;
            for key in existing.keys() {
                fs::remove_file(existing.file_for(&key))?;
            }
            let manifest_path = root.join(MANIFEST);
            if manifest_path.exists() {
                fs::remove_file(manifest_path)?;
            }
        }
        Self::open(root)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Id of the session that last wrote to this artifact.
    pub fn build_id(&self) -> Option<Uuid> {
        self.manifest.build_id
    }

    pub fn keys(&self) -> Vec<String> {
        self.manifest.keys.iter().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.manifest.keys.contains(key)
    }

    pub fn load(&self, key: &str) -> Result<DataFrame, WashoutError> {
        if !self.contains(key) {
            return Err(WashoutError::DataNotFound(format!(
                "{key} in artifact {}",
                self.root.display()
            )));
        }
        let file = File::open(self.file_for(key))?;
        Ok(ParquetReader::new(file).finish()?)
    }

    /// Write a new key. Fails if the key is already present.
    pub fn write(&mut self, key: &str, df: &mut DataFrame) -> Result<(), WashoutError> {
        validate_key(key)?;
        if self.contains(key) {
            return Err(WashoutError::General(format!(
                "{key} already in artifact {}; use replace",
                self.root.display()
            )));
        }
        self.store(key, df)
    }

    pub fn replace(&mut self, key: &str, df: &mut DataFrame) -> Result<(), WashoutError> {
        validate_key(key)?;
        self.store(key, df)
    }

    pub fn remove(&mut self, key: &str) -> Result<(), WashoutError> {
        if !self.manifest.keys.remove(key) {
            return Err(WashoutError::DataNotFound(key.to_string()));
        }
        fs::remove_file(self.file_for(key))?;
        self.save_manifest()
    }

    fn store(&mut self, key: &str, df: &mut DataFrame) -> Result<(), WashoutError> {
        let file = File::create(self.file_for(key))?;
        ParquetWriter::new(file).finish(df)?;
        self.manifest.keys.insert(key.to_string());
        self.manifest.build_id = Some(self.session);
        debug!("Wrote {key} ({} rows) to {}", df.height(), self.root.display());
        self.save_manifest()
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.parquet"))
    }

    fn save_manifest(&self) -> Result<(), WashoutError> {
        let text = serde_yaml::to_string(&self.manifest)?;
        fs::write(self.root.join(MANIFEST), text)?;
        Ok(())
    }
}

/// Keys are `<type>.<measure>` or `<type>.<name>.<measure>`, with
/// `[a-z0-9_]` parts.
pub fn validate_key(key: &str) -> Result<(), WashoutError> {
    let parts: Vec<&str> = key.split('.').collect();
    let well_formed = (2..=3).contains(&parts.len())
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        });
    if well_formed {
        Ok(())
    } else {
        Err(WashoutError::InvalidData(format!(
            "Malformed artifact key {key:?}; expected <type>.<name>.<measure>"
        )))
    }
}

/// Parse `"[lo, hi)"` (any bracket style) into its bounds.
fn parse_interval(s: &str) -> Option<(f64, f64)> {
    let inner = s
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')']);
    let (lo, hi) = inner.split_once(',')?;
    Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
}

/// Replace an interval string column with `<prefix>_start` and
/// `<prefix>_end` numeric columns. Parquet has no interval type.
pub fn split_interval(
    df: DataFrame,
    interval_column: &str,
    prefix: &str,
) -> Result<DataFrame, WashoutError> {
    let intervals = df
        .column(interval_column)
        .map_err(|_| WashoutError::MissingColumn(interval_column.to_string()))?
        .cast(&DataType::String)?;

    let mut starts = Vec::with_capacity(df.height());
    let mut ends = Vec::with_capacity(df.height());
    for (i, value) in intervals.str()?.into_iter().enumerate() {
        let (lo, hi) = value.and_then(parse_interval).ok_or_else(|| {
            WashoutError::InvalidData(format!(
                "Row {i} of {interval_column} is not an interval: {value:?}"
            ))
        })?;
        starts.push(lo);
        ends.push(hi);
    }

    let mut df = df.drop(interval_column)?;
    df.with_column(Column::new(format!("{prefix}_start").into(), starts))?;
    df.with_column(Column::new(format!("{prefix}_end").into(), ends))?;
    Ok(df)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> DataFrame {
        DataFrame::new(vec![
            Column::new("age".into(), ["[0, 5)", "[5.0, 10.0)"]),
            Column::new("value".into(), [0.1, 0.2]),
        ])
        .unwrap()
    }

    #[test]
    fn test_split_interval() {
        let df = split_interval(frame(), "age", "age_group").unwrap();
        assert!(df.column("age").is_err());
        let starts: Vec<f64> = df
            .column("age_group_start")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        let ends: Vec<f64> = df
            .column("age_group_end")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(starts, vec![0.0, 5.0]);
        assert_eq!(ends, vec![5.0, 10.0]);
    }

    #[test]
    fn test_split_interval_rejects_garbage() {
        let df = DataFrame::new(vec![Column::new("year".into(), ["2000"])]).unwrap();
        assert!(matches!(
            split_interval(df, "year", "year"),
            Err(WashoutError::InvalidData(_))
        ));
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("cause.asthma.remission").is_ok());
        assert!(validate_key("population.age_bins").is_ok());
        assert!(validate_key("asthma").is_err());
        assert!(validate_key("cause..remission").is_err());
        assert!(validate_key("cause/asthma.remission").is_err());
    }

    #[test]
    fn test_write_load_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = Artifact::open(dir.path()).unwrap();
        let mut df = frame();
        artifact.write("cause.asthma.remission", &mut df).unwrap();
        assert!(artifact.write("cause.asthma.remission", &mut df).is_err());
        artifact.replace("cause.asthma.remission", &mut df).unwrap();

        let reopened = Artifact::open(dir.path()).unwrap();
        assert_eq!(reopened.keys(), vec!["cause.asthma.remission".to_string()]);
        assert_eq!(reopened.build_id(), artifact.build_id());
        let loaded = reopened.load("cause.asthma.remission").unwrap();
        assert_eq!(loaded.height(), 2);
        assert!(matches!(
            reopened.load("cause.asthma.incidence"),
            Err(WashoutError::DataNotFound(_))
        ));
    }

    #[test]
    fn test_create_without_append_clears() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut artifact = Artifact::open(dir.path()).unwrap();
            artifact.write("population.age_bins", &mut frame()).unwrap();
        }
        let kept = Artifact::create(dir.path(), true).unwrap();
        assert!(kept.contains("population.age_bins"));

        let fresh = Artifact::create(dir.path(), false).unwrap();
        assert!(fresh.keys().is_empty());
        assert!(!dir.path().join("population.age_bins.parquet").exists());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = Artifact::open(dir.path()).unwrap();
        artifact.write("population.age_bins", &mut frame()).unwrap();
        artifact.remove("population.age_bins").unwrap();
        assert!(!artifact.contains("population.age_bins"));
        assert!(artifact.remove("population.age_bins").is_err());
    }
}
