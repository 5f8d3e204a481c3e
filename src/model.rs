//! Task, Config and runtime option types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type TaskId = i64;
pub type ConfigId = i64;

/// What a task does: mirror files or analyze orphaned destinations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Main,
    Prune,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Main => "main",
            TaskType::Prune => "prune",
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(TaskType::Main),
            "prune" => Ok(TaskType::Prune),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// One source directory mirrored into one destination directory.
/// A task may repeat the same source with several destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// A named mirroring job. Persisted as one row; the filter fields are a
/// snapshot that stays self-sufficient even when `config_id` points at a
/// shared [`Config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub paths_mapping: Vec<PathMapping>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub save_mode: i64,
    pub open_cache: bool,
    pub mkdir_if_single: bool,
    pub delete_dir: bool,
    pub keep_dir_struct: bool,
    pub schedule_type: String,
    pub schedule_value: String,
    pub reverse: bool,
    pub config_name: String,
    pub config_id: ConfigId,
    pub is_watching: bool,
    pub watch_error: String,
}

/// A reusable filter/layout bundle referenced by tasks. `detail` holds a
/// [`RuntimeConfig`] JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub id: ConfigId,
    pub name: String,
    pub detail: String,
}

/// The parsed form of [`Config::detail`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub keep_dir_struct: bool,
    pub open_cache: bool,
    pub mkdir_if_single: bool,
    pub delete_dir: bool,
}

/// Resolved execution options handed to the Runner, Watcher and prune
/// analyzer. A plain record; how it was assembled does not matter to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub task_id: TaskId,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub paths_mapping: BTreeMap<PathBuf, Vec<PathBuf>>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub save_mode: i64,
    pub open_cache: bool,
    pub mkdir_if_single: bool,
    pub delete_dir: bool,
    pub keep_dir_struct: bool,
}

impl Task {
    fn grouped_mapping(&self) -> BTreeMap<PathBuf, Vec<PathBuf>> {
        let mut grouped: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for m in &self.paths_mapping {
            grouped.entry(m.source.clone()).or_default().push(m.dest.clone());
        }
        grouped
    }

    /// Options built from the task's own snapshot fields.
    pub fn to_options(&self) -> Options {
        Options {
            task_id: self.id,
            name: self.name.clone(),
            task_type: self.task_type,
            paths_mapping: self.grouped_mapping(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            save_mode: self.save_mode,
            open_cache: self.open_cache,
            mkdir_if_single: self.mkdir_if_single,
            delete_dir: self.delete_dir,
            keep_dir_struct: self.keep_dir_struct,
        }
    }

    /// Options with filter fields taken from a referenced config.
    pub fn to_options_with_config(&self, rc: &RuntimeConfig) -> Options {
        Options {
            task_id: self.id,
            name: self.name.clone(),
            task_type: self.task_type,
            paths_mapping: self.grouped_mapping(),
            include: rc.include.clone(),
            exclude: rc.exclude.clone(),
            save_mode: self.save_mode,
            open_cache: rc.open_cache,
            mkdir_if_single: rc.mkdir_if_single,
            delete_dir: rc.delete_dir,
            keep_dir_struct: rc.keep_dir_struct,
        }
    }
}

/// Aggregate result of one Run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub success: u64,
    pub fail: u64,
    pub fail_files: BTreeMap<String, Vec<String>>,
}

impl Stats {
    /// Record a per-file failure under its reason bucket.
    pub fn record_failure(&mut self, reason: &str, entry: String) {
        self.fail += 1;
        self.fail_files.entry(reason.to_string()).or_default().push(entry);
    }
}
