//! Row stores for tasks and configs.
//!
//! List-valued task fields (path mappings, patterns) are stored as JSON
//! text columns so the wire format survives schema drift, matching how
//! `Config.detail` is kept as one JSON document.

use rusqlite::{Row, params};

use crate::db::{Db, StoreError, map_unique_violation};
use crate::model::{Config, ConfigId, PathMapping, Task, TaskId, TaskType};

#[derive(Clone)]
pub struct TaskStore {
    db: Db,
}

impl TaskStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn load_all(&self) -> Result<Vec<Task>, StoreError> {
        let rows = self.db.with(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, task_type, paths_mapping, include, exclude, save_mode,
                        open_cache, mkdir_if_single, delete_dir, keep_dir_struct,
                        schedule_type, schedule_value, reverse, config_name, config_id,
                        is_watching, watch_error
                 FROM tasks ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], row_to_raw_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(raw_to_task).collect()
    }

    pub fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let raw = self.db.with(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, task_type, paths_mapping, include, exclude, save_mode,
                        open_cache, mkdir_if_single, delete_dir, keep_dir_struct,
                        schedule_type, schedule_value, reverse, config_name, config_id,
                        is_watching, watch_error
                 FROM tasks WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![id], row_to_raw_task)?;
            rows.next().transpose()
        })?;
        raw.map(raw_to_task).transpose()
    }

    /// Insert and return the assigned id.
    pub fn add(&self, task: &Task) -> Result<TaskId, StoreError> {
        let (mapping, include, exclude) = encode_lists(task)?;
        self.db
            .with(|conn| {
                conn.execute(
                    "INSERT INTO tasks (name, task_type, paths_mapping, include, exclude,
                                        save_mode, open_cache, mkdir_if_single, delete_dir,
                                        keep_dir_struct, schedule_type, schedule_value, reverse,
                                        config_name, config_id, is_watching, watch_error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params![
                        task.name,
                        task.task_type.as_str(),
                        mapping,
                        include,
                        exclude,
                        task.save_mode,
                        task.open_cache,
                        task.mkdir_if_single,
                        task.delete_dir,
                        task.keep_dir_struct,
                        task.schedule_type,
                        task.schedule_value,
                        task.reverse,
                        task.config_name,
                        task.config_id,
                        task.is_watching,
                        task.watch_error,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .map_err(|e| map_unique_violation(e, &task.name))
    }

    pub fn update(&self, task: &Task) -> Result<(), StoreError> {
        let (mapping, include, exclude) = encode_lists(task)?;
        let changed = self
            .db
            .with(|conn| {
                conn.execute(
                    "UPDATE tasks SET name = ?2, task_type = ?3, paths_mapping = ?4,
                                      include = ?5, exclude = ?6, save_mode = ?7,
                                      open_cache = ?8, mkdir_if_single = ?9, delete_dir = ?10,
                                      keep_dir_struct = ?11, schedule_type = ?12,
                                      schedule_value = ?13, reverse = ?14, config_name = ?15,
                                      config_id = ?16, is_watching = ?17, watch_error = ?18,
                                      updated_at = datetime('now')
                     WHERE id = ?1",
                    params![
                        task.id,
                        task.name,
                        task.task_type.as_str(),
                        mapping,
                        include,
                        exclude,
                        task.save_mode,
                        task.open_cache,
                        task.mkdir_if_single,
                        task.delete_dir,
                        task.keep_dir_struct,
                        task.schedule_type,
                        task.schedule_value,
                        task.reverse,
                        task.config_name,
                        task.config_id,
                        task.is_watching,
                        task.watch_error,
                    ],
                )
            })
            .map_err(|e| map_unique_violation(e, &task.name))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    pub fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let changed = self
            .db
            .with(|conn| conn.execute("DELETE FROM tasks WHERE id = ?1", params![id]))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ConfigStore {
    db: Db,
}

impl ConfigStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn load_all(&self) -> Result<Vec<Config>, StoreError> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT id, name, detail FROM configs ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Config { id: row.get(0)?, name: row.get(1)?, detail: row.get(2)? })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn get(&self, id: ConfigId) -> Result<Option<Config>, StoreError> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT id, name, detail FROM configs WHERE id = ?1")?;
            let mut rows = stmt.query_map(params![id], |row| {
                Ok(Config { id: row.get(0)?, name: row.get(1)?, detail: row.get(2)? })
            })?;
            rows.next().transpose()
        })
    }

    pub fn add(&self, config: &Config) -> Result<ConfigId, StoreError> {
        self.db
            .with(|conn| {
                conn.execute(
                    "INSERT INTO configs (name, detail) VALUES (?1, ?2)",
                    params![config.name, config.detail],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .map_err(|e| map_unique_violation(e, &config.name))
    }

    pub fn update(&self, config: &Config) -> Result<(), StoreError> {
        let changed = self
            .db
            .with(|conn| {
                conn.execute(
                    "UPDATE configs SET name = ?2, detail = ?3, updated_at = datetime('now')
                     WHERE id = ?1",
                    params![config.id, config.name, config.detail],
                )
            })
            .map_err(|e| map_unique_violation(e, &config.name))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("config {}", config.id)));
        }
        Ok(())
    }

    pub fn delete(&self, id: ConfigId) -> Result<(), StoreError> {
        let changed = self
            .db
            .with(|conn| conn.execute("DELETE FROM configs WHERE id = ?1", params![id]))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("config {id}")));
        }
        Ok(())
    }
}

struct RawTask {
    task: Task,
    task_type: String,
    mapping_json: String,
    include_json: String,
    exclude_json: String,
}

fn row_to_raw_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        task: Task {
            id: row.get(0)?,
            name: row.get(1)?,
            save_mode: row.get(6)?,
            open_cache: row.get(7)?,
            mkdir_if_single: row.get(8)?,
            delete_dir: row.get(9)?,
            keep_dir_struct: row.get(10)?,
            schedule_type: row.get(11)?,
            schedule_value: row.get(12)?,
            reverse: row.get(13)?,
            config_name: row.get(14)?,
            config_id: row.get(15)?,
            is_watching: row.get(16)?,
            watch_error: row.get(17)?,
            ..Task::default()
        },
        task_type: row.get(2)?,
        mapping_json: row.get(3)?,
        include_json: row.get(4)?,
        exclude_json: row.get(5)?,
    })
}

fn raw_to_task(raw: RawTask) -> Result<Task, StoreError> {
    let mut task = raw.task;
    task.task_type = raw
        .task_type
        .parse::<TaskType>()
        .map_err(StoreError::InvalidRow)?;
    task.paths_mapping = serde_json::from_str::<Vec<PathMapping>>(&raw.mapping_json)
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    task.include = serde_json::from_str(&raw.include_json)
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    task.exclude = serde_json::from_str(&raw.exclude_json)
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    Ok(task)
}

fn encode_lists(task: &Task) -> Result<(String, String, String), StoreError> {
    let mapping = serde_json::to_string(&task.paths_mapping)
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    let include = serde_json::to_string(&task.include)
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    let exclude = serde_json::to_string(&task.exclude)
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    Ok((mapping, include, exclude))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> (TaskStore, ConfigStore) {
        let db = Db::open_in_memory().unwrap();
        (TaskStore::new(db.clone()), ConfigStore::new(db))
    }

    fn sample_task(name: &str) -> Task {
        Task {
            name: name.to_string(),
            task_type: TaskType::Main,
            paths_mapping: vec![PathMapping { source: "/s".into(), dest: "/d".into() }],
            include: vec!["*.mkv".to_string()],
            open_cache: true,
            keep_dir_struct: true,
            ..Task::default()
        }
    }

    #[test]
    fn test_task_round_trip() {
        let (tasks, _) = stores();
        let mut task = sample_task("movies");
        task.id = tasks.add(&task).unwrap();

        let loaded = tasks.get(task.id).unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (tasks, _) = stores();
        tasks.add(&sample_task("movies")).unwrap();
        let err = tasks.add(&sample_task("movies")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(name) if name == "movies"));
    }

    #[test]
    fn test_update_rewrites_fields() {
        let (tasks, _) = stores();
        let mut task = sample_task("movies");
        task.id = tasks.add(&task).unwrap();

        task.name = "shows".to_string();
        task.is_watching = true;
        task.watch_error = "source gone".to_string();
        tasks.update(&task).unwrap();

        let loaded = tasks.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.name, "shows");
        assert!(loaded.is_watching);
        assert_eq!(loaded.watch_error, "source gone");
    }

    #[test]
    fn test_update_missing_task_is_not_found() {
        let (tasks, _) = stores();
        let mut task = sample_task("movies");
        task.id = 42;
        assert!(matches!(tasks.update(&task), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_then_load_all_empty() {
        let (tasks, _) = stores();
        let id = tasks.add(&sample_task("movies")).unwrap();
        tasks.delete(id).unwrap();
        assert!(tasks.load_all().unwrap().is_empty());
        assert!(matches!(tasks.delete(id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_config_round_trip_and_uniqueness() {
        let (_, configs) = stores();
        let mut config = Config {
            name: "default".to_string(),
            detail: r#"{"include":["*.mkv"],"openCache":true}"#.to_string(),
            ..Config::default()
        };
        config.id = configs.add(&config).unwrap();

        assert_eq!(configs.get(config.id).unwrap().unwrap(), config);
        let err = configs.add(&config).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(_)));

        config.detail = "{}".to_string();
        configs.update(&config).unwrap();
        assert_eq!(configs.get(config.id).unwrap().unwrap().detail, "{}");
    }
}
