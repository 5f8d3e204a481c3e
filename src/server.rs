//! NDJSON control server over Unix socket / Windows named pipe.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::db::Db;
use crate::logger::tracing_logger;
use crate::protocol::{Request, Response};
use crate::prune;
use crate::service::{ServiceError, TaskService};
#[cfg(windows)]
use crate::transport::PIPE_NAME;
#[cfg(unix)]
use crate::transport::SOCKET_PATH;

#[tokio::main]
pub async fn run(
    socket_path: Option<String>,
    db_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    let socket_path = socket_path.unwrap_or_else(|| SOCKET_PATH.to_string());
    #[cfg(windows)]
    let socket_path = socket_path.unwrap_or_else(|| PIPE_NAME.to_string());

    // Check if another daemon is already running
    #[cfg(unix)]
    {
        if tokio::net::UnixStream::connect(&socket_path).await.is_ok() {
            return Err("another hlinkd instance is already running".into());
        }
        let _ = std::fs::remove_file(&socket_path);
    }

    let db = Db::open(&db_path)?;
    let service = Arc::new(TaskService::new(db)?);
    service.restore_watch_state();

    accept_connections(service, &socket_path).await
}

#[cfg(unix)]
async fn accept_connections(
    service: Arc<TaskService>,
    socket_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::UnixListener::bind(socket_path)?;
    info!("daemon started, listening on {}", socket_path);

    loop {
        let (stream, _) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(service, stream).await {
                debug!("connection closed: {}", e);
            }
        });
    }
}

#[cfg(windows)]
async fn accept_connections(
    service: Arc<TaskService>,
    pipe_name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    use tokio::net::windows::named_pipe::ServerOptions;

    info!("daemon started, listening on {}", pipe_name);

    let mut server = ServerOptions::new()
        .first_pipe_instance(true)
        .create(pipe_name)?;

    loop {
        server.connect().await?;
        let stream = server;

        server = ServerOptions::new()
            .first_pipe_instance(false)
            .create(pipe_name)?;

        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(service, stream).await {
                debug!("connection closed: {}", e);
            }
        });
    }
}

/// Serve one client: a request per line, a response per line.
async fn handle_connection<S>(
    service: Arc<TaskService>,
    stream: S,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(&service, request).await,
            Err(e) => Response::err(format!("invalid request: {e}")),
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

fn from_result<T: serde::Serialize>(result: Result<T, ServiceError>) -> Response {
    match result {
        Ok(data) => Response::ok(data),
        Err(e) => Response::err(e.to_string()),
    }
}

/// Dispatch one request against the service.
pub async fn handle_request(service: &Arc<TaskService>, request: Request) -> Response {
    match request {
        Request::TaskList => Response::ok(service.get_all()),
        Request::TaskAdd { task } => from_result(service.add(task)),
        Request::TaskUpdate { id, task } => from_result(service.update(id, task)),
        Request::TaskDelete { id } => from_result(service.delete(id)),

        Request::RunStart { id } => match service.get(id) {
            Some(task) => from_result(service.start_run(id, tracing_logger(task.name))),
            None => Response::err(ServiceError::TaskNotFound(id).to_string()),
        },
        Request::RunStop { id } => from_result(service.stop_run(id)),
        Request::RunStatus { id } => Response::ok(service.run_status(id)),

        Request::WatchStart { id } => match service.get(id) {
            Some(task) => from_result(service.start_watch(id, tracing_logger(task.name))),
            None => Response::err(ServiceError::TaskNotFound(id).to_string()),
        },
        Request::WatchStop { id } => from_result(service.stop_watch(id)),
        Request::WatchStatus { id } => {
            let task = service.get(id);
            Response::ok(json!({
                "taskId": id,
                "watching": service.is_watching(id),
                "watchError": task.map(|t| t.watch_error).unwrap_or_default(),
            }))
        }

        Request::PruneList { id } => match service.get_options(id) {
            Ok(opts) => {
                let analysis =
                    tokio::task::spawn_blocking(move || prune::prune_candidates(&opts)).await;
                match analysis {
                    Ok(Ok(paths)) => Response::ok(paths),
                    Ok(Err(e)) => Response::err(e.to_string()),
                    Err(e) => Response::err(format!("prune analysis aborted: {e}")),
                }
            }
            Err(e) => Response::err(e.to_string()),
        },

        Request::CacheList { task_id, page, page_size, search } => {
            match service.cache().list_paged(task_id, page, page_size, &search) {
                Ok((entries, total)) => Response::ok(json!({
                    "entries": entries,
                    "total": total,
                })),
                Err(e) => Response::err(e.to_string()),
            }
        }
        Request::CacheRemove { task_id, paths } => {
            from_result(service.remove_cache_files(task_id, &paths))
        }
        Request::CacheClear { task_id } => from_result(service.clear_cache(task_id)),

        Request::ConfigList => from_result(service.get_configs()),
        Request::ConfigAdd { config } => from_result(service.add_config(config)),
        Request::ConfigUpdate { config } => from_result(service.update_config(config)),
        Request::ConfigDelete { id } => from_result(service.delete_config(id)),
        Request::ConfigRelatedTasks { id } => Response::ok(service.related_tasks(id)),
    }
}
