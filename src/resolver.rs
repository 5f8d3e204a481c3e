//! Destination directory resolution.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("failed to absolutize {path}: {source}")]
    Absolutize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{file} is not under source root {root}")]
    OutsideRoot { file: PathBuf, root: PathBuf },
}

/// Compute the destination directory for a source file.
///
/// The directory of `source_file` relative to `source_root` decides the
/// layout: `keep_dir_struct` keeps the whole relative path, otherwise only
/// its last segment survives. `mkdir_if_single` gives files sitting directly
/// in the source root a containing directory named after the file (minus
/// extension). Deterministic for identical arguments.
pub fn resolve_dest(
    source_file: &Path,
    source_root: &Path,
    dest_root: &Path,
    keep_dir_struct: bool,
    mkdir_if_single: bool,
) -> Result<PathBuf, ResolveError> {
    let current_dir = source_file.parent().unwrap_or_else(|| Path::new(""));

    let abs_root = absolutize(source_root)?;
    let abs_dir = absolutize(current_dir)?;

    let relative = abs_dir
        .strip_prefix(&abs_root)
        .map_err(|_| ResolveError::OutsideRoot {
            file: source_file.to_path_buf(),
            root: source_root.to_path_buf(),
        })?;

    let mut parts: Vec<PathBuf> = relative
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .map(|c| PathBuf::from(c.as_os_str()))
        .collect();

    if mkdir_if_single && parts.is_empty() {
        if let Some(stem) = source_file.file_stem() {
            parts.push(PathBuf::from(stem));
        }
    }

    if !keep_dir_struct && parts.len() > 1 {
        parts = parts.split_off(parts.len() - 1);
    }

    let mut dest = dest_root.to_path_buf();
    for part in parts {
        dest.push(part);
    }
    Ok(dest)
}

fn absolutize(path: &Path) -> Result<PathBuf, ResolveError> {
    if path.as_os_str().is_empty() {
        return std::path::absolute(".").map_err(|source| ResolveError::Absolutize {
            path: path.to_path_buf(),
            source,
        });
    }
    std::path::absolute(path).map_err(|source| ResolveError::Absolutize {
        path: path.to_path_buf(),
        source,
    })
}
