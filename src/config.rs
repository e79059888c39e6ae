//! Test data loading and player settings.

use crate::model::{HttpTestData, Prerequisite};
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Settings shared by every scenario in a run.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Prefix for relative `uri`s.
    pub base_url: Option<String>,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Keep running remaining scenarios after one fails.
    pub continue_on_failure: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
            continue_on_failure: true,
        }
    }
}

/// Every call definition found under a set of directories, keyed by
/// `_guid_`.
#[derive(Debug, Default)]
pub struct TestDataStore {
    test_data: BTreeMap<String, HttpTestData>,
}

impl TestDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every test data file under `dir`, recursively.
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> Result<&mut Self> {
        let dir = dir.as_ref();
        info!("Loading test data from directory: {}", dir.display());

        let mut files = Vec::new();
        collect_files(dir, &mut files)?;
        files.sort();

        let before = self.test_data.len();
        for path in files {
            let data = load_file(&path)?;
            self.insert(data).context(format!("In {}", path.display()))?;
        }

        info!(
            "Loaded {} test data entries from {}",
            self.test_data.len() - before,
            dir.display()
        );
        Ok(self)
    }

    /// Add one definition; a guid may only be defined once.
    pub fn insert(&mut self, data: HttpTestData) -> Result<()> {
        if self.test_data.contains_key(&data.guid) {
            bail!("Duplicate test data guid '{}'", data.guid);
        }
        debug!("Registered test data: {}", data.guid);
        self.test_data.insert(data.guid.clone(), data);
        Ok(())
    }

    pub fn get(&self, guid: &str) -> Option<&HttpTestData> {
        self.test_data.get(guid)
    }

    /// All guids, sorted.
    pub fn guids(&self) -> impl Iterator<Item = &str> {
        self.test_data.keys().map(String::as_str)
    }

    /// Guids of top-level scenarios: every definition no other
    /// definition names as a prerequisite. Sorted.
    pub fn scenario_guids(&self) -> Vec<&str> {
        let referenced: HashSet<String> = self
            .test_data
            .values()
            .flat_map(|data| data.prerequisites.iter().flat_map(Prerequisite::entries))
            .map(|(_, guid)| guid)
            .collect();
        self.guids()
            .filter(|guid| !referenced.contains(*guid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.test_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test_data.is_empty()
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)
        .context(format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if is_test_data_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn load_file(path: &Path) -> Result<HttpTestData> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read test data file: {}", path.display()))?;
    let data = if has_suffix(path, ".td.json") {
        serde_json::from_str(&content)
            .context(format!("Failed to parse JSON from {}", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .context(format!("Failed to parse YAML from {}", path.display()))?
    };
    Ok(data)
}

/// `*.td.json`, `*.td.yaml` or `*.td.yml`.
fn is_test_data_file(path: &Path) -> bool {
    [".td.json", ".td.yaml", ".td.yml"]
        .iter()
        .any(|suffix| has_suffix(path, suffix))
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(suffix))
}
