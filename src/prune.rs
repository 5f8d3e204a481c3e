//! Orphan detection for destination trees.
//!
//! Inode identity is the cross-root link indicator: a destination file
//! whose inode still appears under any source root is reachable and kept.
//! Orphans that do not pass the task's filters are left alone, so foreign
//! files in the destination are never reported.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use thiserror::Error;

use crate::matcher::Matcher;
use crate::model::Options;

#[derive(Error, Debug)]
pub enum PruneError {
    #[error("prune requires inode identity, unsupported on this platform")]
    Unsupported,
}

#[cfg(unix)]
fn inode_of(md: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.ino()
}

/// Collect the inode numbers of every regular file under `roots`.
/// Walk errors are skipped; partial knowledge only shrinks the orphan set.
pub fn inode_set(roots: &[&PathBuf]) -> HashSet<u64> {
    let mut inodes = HashSet::new();
    #[cfg(unix)]
    for root in roots {
        for entry in walk(root).filter_map(Result::ok) {
            if entry.file_type().is_some_and(|t| t.is_file())
                && let Ok(md) = entry.metadata()
            {
                inodes.insert(inode_of(&md));
            }
        }
    }
    inodes
}

/// Every regular file under `roots` with its inode.
fn scan_files(roots: &[&PathBuf]) -> Vec<(PathBuf, u64)> {
    let mut files = Vec::new();
    #[cfg(unix)]
    for root in roots {
        for entry in walk(root).filter_map(Result::ok) {
            if entry.file_type().is_some_and(|t| t.is_file())
                && let Ok(md) = entry.metadata()
            {
                files.push((entry.into_path(), inode_of(&md)));
            }
        }
    }
    files
}

fn walk(root: &Path) -> ignore::Walk {
    WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .build()
}

/// Destination files whose inode no longer appears under any source root
/// and which pass the task's include/exclude filters. Reporting only; the
/// caller decides about deletion.
pub fn prune_candidates(opts: &Options) -> Result<Vec<PathBuf>, PruneError> {
    if !cfg!(unix) {
        return Err(PruneError::Unsupported);
    }

    let sources: Vec<&PathBuf> = opts.paths_mapping.keys().collect();
    let dests: Vec<&PathBuf> = opts.paths_mapping.values().flatten().collect();

    let source_inodes = inode_set(&sources);
    let matcher = Matcher::new(&opts.include, &opts.exclude);

    let mut orphans: Vec<PathBuf> = scan_files(&dests)
        .into_iter()
        .filter(|(path, inode)| {
            !source_inodes.contains(inode) && matcher.is_supported(path)
        })
        .map(|(path, _)| path)
        .collect();
    orphans.sort();
    Ok(orphans)
}

/// Remove empty directories under `roots`, deepest first. The roots
/// themselves are kept even when they end up empty.
pub fn prune_empty_dirs(roots: &[PathBuf]) -> io::Result<()> {
    for root in roots {
        remove_empty_below(root)?;
    }
    Ok(())
}

fn remove_empty_below(dir: &Path) -> io::Result<bool> {
    let mut empty = true;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_dir = entry.file_type()?.is_dir();
        if is_dir && remove_empty_below(&entry.path())? {
            fs::remove_dir(entry.path())?;
        } else {
            empty = false;
        }
    }
    Ok(empty)
}
