//! Process-wide task registry, watcher lifecycles and run management.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::cache_store::CacheStore;
use crate::db::{Db, StoreError};
use crate::logger::{Level, Logger, tracing_logger};
use crate::model::{Config, ConfigId, Options, RuntimeConfig, Task, TaskId};
use crate::runner;
use crate::store::{ConfigStore, TaskStore};
use crate::watcher::{WatchError, Watcher};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task name already in use: {0}")]
    DuplicateName(String),

    #[error("task is already running")]
    AlreadyRunning,

    #[error("task is not running")]
    NotRunning,

    #[error("invalid config detail: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

fn store_err(err: StoreError) -> ServiceError {
    match err {
        StoreError::DuplicateName(name) => ServiceError::DuplicateName(name),
        other => ServiceError::Store(other),
    }
}

/// In-memory state of one executing async run.
struct RunState {
    started_at: DateTime<Utc>,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub task_id: TaskId,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// Registry of tasks plus the live watcher and run maps. One per process.
///
/// The maps are independently locked; when both are needed the order is
/// tasks first, then watchers, never the reverse.
pub struct TaskService {
    db: Db,
    task_store: TaskStore,
    config_store: ConfigStore,
    cache_store: CacheStore,
    tasks: Mutex<HashMap<TaskId, Task>>,
    watchers: Mutex<HashMap<TaskId, Arc<Watcher>>>,
    runs: Mutex<HashMap<TaskId, RunState>>,
}

impl TaskService {
    /// Load the registry from the store. Watch-state recovery is a
    /// separate explicit step (`restore_watch_state`) so one-shot callers
    /// do not spawn watchers.
    pub fn new(db: Db) -> Result<Self, ServiceError> {
        let task_store = TaskStore::new(db.clone());
        let tasks = task_store
            .load_all()?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();
        Ok(Self {
            config_store: ConfigStore::new(db.clone()),
            cache_store: CacheStore::new(db.clone()),
            task_store,
            db,
            tasks: Mutex::new(tasks),
            watchers: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache_store
    }

    // --- registry ---

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Task> {
        self.tasks.lock().values().find(|t| t.name == name).cloned()
    }

    pub fn get_all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn add(&self, mut task: Task) -> Result<Task, ServiceError> {
        let mut tasks = self.tasks.lock();
        if tasks.values().any(|t| t.name == task.name) {
            return Err(ServiceError::DuplicateName(task.name));
        }
        task.id = self.task_store.add(&task).map_err(store_err)?;
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    /// Replace a task's row. The id is preserved from the prior row; every
    /// other field comes from `task`.
    pub fn update(&self, id: TaskId, mut task: Task) -> Result<Task, ServiceError> {
        let mut tasks = self.tasks.lock();
        if !tasks.contains_key(&id) {
            return Err(ServiceError::TaskNotFound(id));
        }
        if tasks.values().any(|t| t.id != id && t.name == task.name) {
            return Err(ServiceError::DuplicateName(task.name));
        }
        task.id = id;
        self.task_store.update(&task).map_err(store_err)?;
        tasks.insert(id, task.clone());
        Ok(task)
    }

    pub fn delete(&self, id: TaskId) -> Result<(), ServiceError> {
        self.stop_watch(id)?;
        let mut tasks = self.tasks.lock();
        if tasks.remove(&id).is_none() {
            return Err(ServiceError::TaskNotFound(id));
        }
        self.task_store.delete(id)?;
        Ok(())
    }

    // --- options resolution ---

    /// Filter set used for execution: the task's own snapshot when it has
    /// one, the referenced config when the snapshot is empty, permissive
    /// defaults otherwise.
    pub fn get_options(&self, id: TaskId) -> Result<Options, ServiceError> {
        let task = self.get(id).ok_or(ServiceError::TaskNotFound(id))?;
        Ok(self.options_for(&task))
    }

    fn options_for(&self, task: &Task) -> Options {
        if task.include.is_empty() && task.exclude.is_empty() && task.config_id != 0 {
            match self.config_store.get(task.config_id) {
                Ok(Some(config)) => {
                    match serde_json::from_str::<RuntimeConfig>(&config.detail) {
                        Ok(rc) => return task.to_options_with_config(&rc),
                        Err(e) => tracing::warn!(
                            task = %task.name,
                            config = %config.name,
                            "config detail unparsable, using snapshot: {e}"
                        ),
                    }
                }
                Ok(None) => tracing::warn!(
                    task = %task.name,
                    "config {} missing, using snapshot",
                    task.config_id
                ),
                Err(e) => tracing::warn!(task = %task.name, "config load failed: {e}"),
            }
        }
        task.to_options()
    }

    // --- watcher lifecycle ---

    pub fn start_watch(&self, id: TaskId, logger: Logger) -> Result<(), ServiceError> {
        let task = self.get(id).ok_or(ServiceError::TaskNotFound(id))?;
        if self.watchers.lock().contains_key(&id) {
            return Ok(());
        }

        let opts = self.options_for(&task);
        let cache = opts.open_cache.then(|| self.cache_store.clone());
        let watcher = Arc::new(Watcher::new(opts, logger, cache));

        match watcher.start() {
            Ok(()) => {
                self.watchers.lock().insert(id, watcher);
                self.mark_watch_state(id, true, "");
                Ok(())
            }
            Err(e) => {
                // keep the reason on the row so operators see why the
                // watcher is down without log-diving
                self.mark_watch_state(id, false, &e.to_string());
                Err(e.into())
            }
        }
    }

    pub fn stop_watch(&self, id: TaskId) -> Result<(), ServiceError> {
        let watcher = self.watchers.lock().remove(&id);
        let Some(watcher) = watcher else {
            return Ok(());
        };
        watcher.stop();
        self.mark_watch_state(id, false, "");
        Ok(())
    }

    pub fn restart_watch(&self, id: TaskId) -> Result<(), ServiceError> {
        if !self.is_watching(id) {
            return Ok(());
        }
        let task = self.get(id).ok_or(ServiceError::TaskNotFound(id))?;
        self.stop_watch(id)?;
        self.start_watch(id, tracing_logger(task.name))
    }

    pub fn is_watching(&self, id: TaskId) -> bool {
        self.watchers.lock().contains_key(&id)
    }

    /// Restart every task persisted as watching. Runs at daemon boot; each
    /// attempt is isolated and failures are reconciled onto the row.
    pub fn restore_watch_state(&self) {
        let candidates: Vec<Task> =
            self.get_all().into_iter().filter(|t| t.is_watching).collect();

        for task in candidates {
            match self.start_watch(task.id, tracing_logger(task.name.clone())) {
                Ok(()) => tracing::info!(task = %task.name, "watch restored"),
                Err(e) => tracing::error!(task = %task.name, "watch restore failed: {e}"),
            }
        }
    }

    fn mark_watch_state(&self, id: TaskId, watching: bool, error: &str) {
        let updated = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&id) else { return };
            task.is_watching = watching;
            task.watch_error = error.to_string();
            task.clone()
        };
        if let Err(e) = self.task_store.update(&updated) {
            tracing::error!(task = id, "failed to persist watch state: {e}");
        }
    }

    // --- async runs ---

    /// Launch a Run in the background. At most one per task.
    pub fn start_run(self: &Arc<Self>, id: TaskId, logger: Logger) -> Result<(), ServiceError> {
        let task = self.get(id).ok_or(ServiceError::TaskNotFound(id))?;
        let opts = self.options_for(&task);

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut runs = self.runs.lock();
            if runs.contains_key(&id) {
                return Err(ServiceError::AlreadyRunning);
            }
            runs.insert(id, RunState { started_at: Utc::now(), cancel: cancel.clone() });
        }

        let service = self.clone();
        let db = self.db.clone();
        tokio::spawn(async move {
            let log = logger.as_ref();
            log(Level::Info, "run started");

            // suppress per-file output once cancelled; the closing summary
            // below still goes through the unwrapped logger
            let quiet = cancel.clone();
            let inner_logger = logger.clone();
            let wrapped: Logger = Arc::new(move |level, msg| {
                if !quiet.load(Ordering::Relaxed) {
                    (inner_logger.as_ref())(level, msg);
                }
            });

            let run_cancel = cancel.clone();
            let result = tokio::task::spawn_blocking(move || {
                runner::run_cancellable(&db, &opts, &wrapped, &run_cancel)
            })
            .await;

            service.runs.lock().remove(&id);

            match result {
                Ok(stats) if cancel.load(Ordering::Relaxed) => log(
                    Level::Warn,
                    &format!(
                        "run cancelled (success: {}, fail: {})",
                        stats.success, stats.fail
                    ),
                ),
                Ok(stats) => log(
                    Level::Succeed,
                    &format!(
                        "run finished (success: {}, fail: {})",
                        stats.success, stats.fail
                    ),
                ),
                Err(e) => log(Level::Error, &format!("run aborted: {e}")),
            }
        });

        Ok(())
    }

    pub fn stop_run(&self, id: TaskId) -> Result<(), ServiceError> {
        let runs = self.runs.lock();
        let state = runs.get(&id).ok_or(ServiceError::NotRunning)?;
        state.cancel.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn run_status(&self, id: TaskId) -> RunStatus {
        let runs = self.runs.lock();
        match runs.get(&id) {
            Some(state) => RunStatus {
                task_id: id,
                running: true,
                started_at: Some(state.started_at),
            },
            None => RunStatus { task_id: id, running: false, started_at: None },
        }
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.runs.lock().contains_key(&id)
    }

    // --- configs ---

    pub fn get_configs(&self) -> Result<Vec<Config>, ServiceError> {
        Ok(self.config_store.load_all()?)
    }

    pub fn get_config(&self, id: ConfigId) -> Result<Option<Config>, ServiceError> {
        Ok(self.config_store.get(id)?)
    }

    pub fn add_config(&self, mut config: Config) -> Result<Config, ServiceError> {
        config.id = self.config_store.add(&config).map_err(store_err)?;
        Ok(config)
    }

    /// Rewrite a config and propagate it into every referencing task's
    /// snapshot, restarting their live watchers. One-way: tasks never push
    /// back into configs.
    pub fn update_config(&self, config: Config) -> Result<Vec<TaskId>, ServiceError> {
        self.config_store.update(&config).map_err(store_err)?;
        self.sync_config_to_tasks(config.id, &config.name, &config.detail)
    }

    pub fn delete_config(&self, id: ConfigId) -> Result<(), ServiceError> {
        Ok(self.config_store.delete(id)?)
    }

    pub fn related_tasks(&self, config_id: ConfigId) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.config_id == config_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Copy a config's fields onto every task referencing it and restart
    /// those tasks' live watchers. Returns the affected task ids.
    pub fn sync_config_to_tasks(
        &self,
        config_id: ConfigId,
        config_name: &str,
        detail: &str,
    ) -> Result<Vec<TaskId>, ServiceError> {
        let rc: RuntimeConfig = serde_json::from_str(detail)
            .map_err(|e| ServiceError::InvalidConfig(e.to_string()))?;

        let affected: Vec<Task> = {
            let mut tasks = self.tasks.lock();
            tasks
                .values_mut()
                .filter(|t| t.config_id == config_id)
                .map(|task| {
                    task.config_name = config_name.to_string();
                    task.include = rc.include.clone();
                    task.exclude = rc.exclude.clone();
                    task.keep_dir_struct = rc.keep_dir_struct;
                    task.open_cache = rc.open_cache;
                    task.mkdir_if_single = rc.mkdir_if_single;
                    task.delete_dir = rc.delete_dir;
                    task.clone()
                })
                .collect()
        };

        for task in &affected {
            self.task_store.update(task)?;
        }
        for task in &affected {
            if let Err(e) = self.restart_watch(task.id) {
                tracing::error!(task = %task.name, "watch restart after config sync failed: {e}");
            }
        }

        Ok(affected.iter().map(|t| t.id).collect())
    }

    // --- cache fan-out ---

    /// Remove cache rows and evict them from the live watcher's memory set
    /// so it cannot resurrect the entries.
    pub fn remove_cache_files(
        &self,
        task_id: TaskId,
        paths: &[String],
    ) -> Result<usize, ServiceError> {
        let removed = self.cache_store.remove(task_id, paths)?;
        if let Some(watcher) = self.watchers.lock().get(&task_id) {
            watcher.remove_from_cache(paths);
        }
        Ok(removed)
    }

    pub fn clear_cache(&self, task_id: TaskId) -> Result<usize, ServiceError> {
        let removed = self.cache_store.clear(task_id)?;
        if let Some(watcher) = self.watchers.lock().get(&task_id) {
            watcher.clear_cache();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PathMapping;
    use std::fs;
    use tempfile::tempdir;

    fn service() -> Arc<TaskService> {
        Arc::new(TaskService::new(Db::open_in_memory().unwrap()).unwrap())
    }

    fn quiet_logger() -> Logger {
        Arc::new(|_, _| {})
    }

    fn sample_task(name: &str, source: &std::path::Path, dest: &std::path::Path) -> Task {
        Task {
            name: name.to_string(),
            paths_mapping: vec![PathMapping {
                source: source.to_path_buf(),
                dest: dest.to_path_buf(),
            }],
            keep_dir_struct: true,
            ..Task::default()
        }
    }

    #[test]
    fn test_add_get_update_delete() {
        let service = service();
        let dir = tempdir().unwrap();
        let task = service
            .add(sample_task("movies", &dir.path().join("s"), &dir.path().join("d")))
            .unwrap();
        assert!(task.id > 0);

        let mut updated = task.clone();
        updated.name = "shows".to_string();
        let updated = service.update(task.id, updated).unwrap();
        assert_eq!(service.get(task.id).unwrap().name, "shows");
        assert_eq!(updated.id, task.id);

        service.delete(task.id).unwrap();
        assert!(service.get(task.id).is_none());
        assert!(matches!(
            service.delete(task.id),
            Err(ServiceError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected_on_add_and_update() {
        let service = service();
        let dir = tempdir().unwrap();
        let s = dir.path().join("s");
        let d = dir.path().join("d");
        let a = service.add(sample_task("a", &s, &d)).unwrap();
        let _b = service.add(sample_task("b", &s, &d)).unwrap();

        assert!(matches!(
            service.add(sample_task("a", &s, &d)),
            Err(ServiceError::DuplicateName(_))
        ));

        let mut renamed = a.clone();
        renamed.name = "b".to_string();
        assert!(matches!(
            service.update(a.id, renamed),
            Err(ServiceError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_update_preserves_identity() {
        let service = service();
        let dir = tempdir().unwrap();
        let task = service
            .add(sample_task("movies", &dir.path().join("s"), &dir.path().join("d")))
            .unwrap();

        let mut replacement = sample_task("renamed", &dir.path().join("s2"), &dir.path().join("d2"));
        replacement.id = 9999;
        let updated = service.update(task.id, replacement).unwrap();
        assert_eq!(updated.id, task.id);
        assert_eq!(service.get(task.id).unwrap().name, "renamed");
    }

    #[test]
    fn test_options_prefer_snapshot_then_config() {
        let service = service();
        let dir = tempdir().unwrap();
        let config = service
            .add_config(Config {
                name: "shared".to_string(),
                detail: r#"{"include":["*.mp4"],"openCache":true,"keepDirStruct":true}"#
                    .to_string(),
                ..Config::default()
            })
            .unwrap();

        // snapshot present: config ignored
        let mut task = sample_task("with-snapshot", &dir.path().join("s"), &dir.path().join("d"));
        task.include = vec!["*.mkv".to_string()];
        task.config_id = config.id;
        let task = service.add(task).unwrap();
        let opts = service.get_options(task.id).unwrap();
        assert_eq!(opts.include, vec!["*.mkv".to_string()]);
        assert!(!opts.open_cache);

        // empty snapshot: config wins
        let mut task = sample_task("no-snapshot", &dir.path().join("s"), &dir.path().join("d"));
        task.config_id = config.id;
        let task = service.add(task).unwrap();
        let opts = service.get_options(task.id).unwrap();
        assert_eq!(opts.include, vec!["*.mp4".to_string()]);
        assert!(opts.open_cache);

        // dangling config reference: permissive defaults from the snapshot
        let mut task = sample_task("dangling", &dir.path().join("s"), &dir.path().join("d"));
        task.config_id = config.id + 100;
        let task = service.add(task).unwrap();
        let opts = service.get_options(task.id).unwrap();
        assert!(opts.include.is_empty());
    }

    #[tokio::test]
    async fn test_start_watch_failure_recorded_on_row() {
        let service = service();
        let dir = tempdir().unwrap();
        // neither source nor dest exists
        let task = service
            .add(sample_task("broken", &dir.path().join("absent"), &dir.path().join("gone")))
            .unwrap();

        let err = service.start_watch(task.id, quiet_logger()).unwrap_err();
        assert!(matches!(err, ServiceError::Watch(_)));

        let row = service.get(task.id).unwrap();
        assert!(!row.is_watching);
        assert!(row.watch_error.contains("missing sources"));
        assert!(!service.is_watching(task.id));
    }

    #[tokio::test]
    async fn test_watch_lifecycle_and_idempotent_stop() {
        let service = service();
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();

        let task = service.add(sample_task("live", &source, &dest)).unwrap();
        service.start_watch(task.id, quiet_logger()).unwrap();
        assert!(service.is_watching(task.id));
        assert!(service.get(task.id).unwrap().is_watching);

        // second start is a no-op
        service.start_watch(task.id, quiet_logger()).unwrap();

        service.stop_watch(task.id).unwrap();
        assert!(!service.is_watching(task.id));
        assert!(!service.get(task.id).unwrap().is_watching);
        service.stop_watch(task.id).unwrap();
    }

    #[tokio::test]
    async fn test_restore_watch_state_isolates_failures() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();

        let db = Db::open_in_memory().unwrap();
        {
            let service = Arc::new(TaskService::new(db.clone()).unwrap());
            // rows persisted as watching, as if a previous process died
            let mut good = sample_task("good", &source, &dest);
            good.is_watching = true;
            service.add(good).unwrap();
            let mut broken = sample_task("broken", &dir.path().join("absent"), &dest);
            broken.is_watching = true;
            service.add(broken).unwrap();
        }

        let service = Arc::new(TaskService::new(db).unwrap());
        service.restore_watch_state();

        let good = service.get_by_name("good").unwrap();
        let broken = service.get_by_name("broken").unwrap();
        assert!(service.is_watching(good.id));
        assert!(!service.is_watching(broken.id));
        assert!(broken.watch_error.contains("missing sources"));
        service.stop_watch(good.id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_run_completes_and_clears_state() {
        let service = service();
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(source.join("a.txt"), b"data").unwrap();

        let task = service.add(sample_task("oneshot", &source, &dest)).unwrap();
        service.start_run(task.id, quiet_logger()).unwrap();
        assert!(service.run_status(task.id).running || !service.is_running(task.id));

        for _ in 0..100 {
            if !service.is_running(task.id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!service.is_running(task.id));
        assert!(dest.join("a.txt").exists());
        assert!(matches!(
            service.stop_run(task.id),
            Err(ServiceError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_second_start_run_conflicts() {
        let service = service();
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();

        let task = service.add(sample_task("busy", &source, &dest)).unwrap();
        service.start_run(task.id, quiet_logger()).unwrap();
        // the spawned run has not been polled yet on this runtime, so the
        // state is still present
        assert!(matches!(
            service.start_run(task.id, quiet_logger()),
            Err(ServiceError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_sync_config_rewrites_referencing_snapshots_only() {
        let service = service();
        let dir = tempdir().unwrap();
        let s = dir.path().join("s");
        let d = dir.path().join("d");

        let config = service
            .add_config(Config {
                name: "shared".to_string(),
                detail: "{}".to_string(),
                ..Config::default()
            })
            .unwrap();

        let mut linked = sample_task("linked", &s, &d);
        linked.config_id = config.id;
        let linked = service.add(linked).unwrap();
        let loner = service.add(sample_task("loner", &s, &d)).unwrap();

        let detail = r#"{"include":["*.iso"],"openCache":true}"#;
        let affected = service
            .sync_config_to_tasks(config.id, "renamed-config", detail)
            .unwrap();
        assert_eq!(affected, vec![linked.id]);

        let linked = service.get(linked.id).unwrap();
        assert_eq!(linked.include, vec!["*.iso".to_string()]);
        assert!(linked.open_cache);
        assert_eq!(linked.config_name, "renamed-config");
        assert!(service.get(loner.id).unwrap().include.is_empty());
    }

    #[test]
    fn test_cache_fan_out_without_live_watcher() {
        let service = service();
        let paths = vec!["/s/a.mkv".to_string()];
        service.cache().add(1, &paths).unwrap();
        assert_eq!(service.remove_cache_files(1, &paths).unwrap(), 1);
        service.cache().add(1, &paths).unwrap();
        assert_eq!(service.clear_cache(1).unwrap(), 1);
    }
}
