//! Hard-link creation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Result of one link attempt. An existing destination entry is a
/// distinguished outcome, not an error; the engine treats it as processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    AlreadyExists,
}

/// Hard-link `source_file` into `dest_dir`, creating missing ancestors.
///
/// Never overwrites an existing destination entry of any file type and
/// never copies content. Errors other than an existing target (including
/// cross-device links) propagate verbatim.
pub fn link(source_file: &Path, dest_dir: &Path) -> io::Result<(PathBuf, LinkOutcome)> {
    fs::create_dir_all(dest_dir)?;

    let name = source_file
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
    let target = dest_dir.join(name);

    // symlink_metadata so dangling symlinks still count as occupied
    if fs::symlink_metadata(&target).is_ok() {
        return Ok((target, LinkOutcome::AlreadyExists));
    }

    match fs::hard_link(source_file, &target) {
        Ok(()) => Ok((target, LinkOutcome::Linked)),
        // lost the race to another worker; same as the pre-check hit
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Ok((target, LinkOutcome::AlreadyExists))
        }
        Err(e) => Err(e),
    }
}
