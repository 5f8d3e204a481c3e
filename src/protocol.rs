//! NDJSON control protocol types.
//!
//! One request per line, one response per line. Business failures answer
//! inside the envelope with `success = false`; only transport problems
//! close the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Config, ConfigId, Task, TaskId};

/// Requests understood by the daemon.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    TaskList,
    TaskAdd {
        task: Task,
    },
    TaskUpdate {
        id: TaskId,
        task: Task,
    },
    TaskDelete {
        id: TaskId,
    },

    RunStart {
        id: TaskId,
    },
    RunStop {
        id: TaskId,
    },
    RunStatus {
        id: TaskId,
    },

    WatchStart {
        id: TaskId,
    },
    WatchStop {
        id: TaskId,
    },
    WatchStatus {
        id: TaskId,
    },

    PruneList {
        id: TaskId,
    },

    CacheList {
        task_id: TaskId,
        #[serde(default = "default_page")]
        page: u32,
        #[serde(default = "default_page_size")]
        page_size: u32,
        #[serde(default)]
        search: String,
    },
    CacheRemove {
        task_id: TaskId,
        paths: Vec<String>,
    },
    CacheClear {
        task_id: TaskId,
    },

    ConfigList,
    ConfigAdd {
        config: Config,
    },
    ConfigUpdate {
        config: Config,
    },
    ConfigDelete {
        id: ConfigId,
    },
    ConfigRelatedTasks {
        id: ConfigId,
    },
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// Uniform response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self { success: true, data: Some(value), error_message: None },
            Err(e) => Self::err(format!("response encoding failed: {e}")),
        }
    }

    pub fn ok_empty() -> Self {
        Self { success: true, data: None, error_message: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error_message: Some(message.into()) }
    }
}
