//! Installing finished guides into the output directory.
//!
//! Guides are produced in the work directory's `partial/` folder, outside
//! the staged output pathspec, and only moved into place once complete. A
//! run that dies half-way therefore never leaves a truncated guide where
//! `git add` can see it.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use epgsync_shared::{EpgSyncError, Region, Result};

/// What installing a guide did to the published file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuideUpdate {
    /// Guide bytes differ from the previous file (or there was none).
    pub changed: bool,
    pub bytes: u64,
}

/// In-progress location for `region`'s guide: `<partial_dir>/US.partial.xml`.
pub fn partial_path(region: &Region, partial_dir: &Path) -> PathBuf {
    let ext = region
        .output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "xml".into());
    partial_dir.join(format!("{}.partial.{ext}", region.code))
}

/// Name looks like an in-progress guide (`*.partial` or `*.partial.*`).
pub fn is_partial_name(name: &str) -> bool {
    name.ends_with(".partial") || name.contains(".partial.")
}

/// Move a complete guide from `partial` to `output`, creating the output's
/// parent directory when needed. Reports whether the content changed.
pub fn install_guide(partial: &Path, output: &Path) -> Result<GuideUpdate> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EpgSyncError::io(parent, e))?;
    }

    let previous = file_digest(output)?;
    let current = file_digest(partial)?;
    let bytes = std::fs::metadata(partial)
        .map_err(|e| EpgSyncError::io(partial, e))?
        .len();

    if let Err(e) = std::fs::rename(partial, output) {
        // The work directory may sit on another filesystem.
        debug!(error = %e, "rename failed, copying guide instead");
        std::fs::copy(partial, output).map_err(|e| EpgSyncError::io(output, e))?;
        remove_if_exists(partial)?;
    }

    Ok(GuideUpdate {
        changed: previous != current,
        bytes,
    })
}

/// Delete in-progress guides left under `dir` by an interrupted run.
/// Returns the removed paths.
pub fn sweep_partials(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    sweep_into(dir, &mut removed)?;
    Ok(removed)
}

fn sweep_into(dir: &Path, removed: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(EpgSyncError::io(dir, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| EpgSyncError::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| EpgSyncError::io(&path, e))?;
        if file_type.is_dir() {
            sweep_into(&path, removed)?;
        } else if is_partial_name(&entry.file_name().to_string_lossy()) {
            warn!(path = %path.display(), "removing stale partial guide");
            remove_if_exists(&path)?;
            removed.push(path);
        }
    }
    Ok(())
}

/// Remove every regular file directly inside `dir`, keeping the directory.
pub fn clear_dir(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(EpgSyncError::io(dir, e)),
    };

    let mut count = 0;
    for entry in entries {
        let path = entry.map_err(|e| EpgSyncError::io(dir, e))?.path();
        if path.is_file() {
            remove_if_exists(&path)?;
            count += 1;
        }
    }
    Ok(count)
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EpgSyncError::io(path, e)),
    }
}

/// SHA-256 of a file's contents, `None` if it does not exist.
fn file_digest(path: &Path) -> Result<Option<String>> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EpgSyncError::io(path, e)),
    };
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| EpgSyncError::io(path, e))?;
    Ok(Some(format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("epgsync_guide_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn region(output: &Path) -> Region {
        Region {
            code: "US".parse().unwrap(),
            channels: "/lists/channels/US.channels.xml".into(),
            output: output.to_path_buf(),
            max_connections: 1,
            timeout_ms: 60_000,
            sources: Vec::new(),
        }
    }

    #[test]
    fn partial_path_lives_in_partial_dir() {
        let region = region(Path::new("/lists/output/epg_US.xml"));
        assert_eq!(
            partial_path(&region, Path::new("/work/partial")),
            Path::new("/work/partial/US.partial.xml")
        );

        let bare = Region {
            output: "/lists/output/guide".into(),
            ..region
        };
        assert_eq!(
            partial_path(&bare, Path::new("/w")),
            Path::new("/w/US.partial.xml")
        );
    }

    #[test]
    fn partial_names() {
        assert!(is_partial_name("epg_IN.partial.xml"));
        assert!(is_partial_name("guide.partial"));
        assert!(!is_partial_name("epg_IN.xml"));
        assert!(!is_partial_name("partial_guide.xml"));
    }

    #[test]
    fn install_creates_nested_output_dir_and_detects_changes() {
        let dir = temp_dir();
        let partial = dir.join("US.partial.xml");
        let output = dir.join("output").join("us").join("epg.xml");

        std::fs::write(&partial, "<tv>1</tv>").unwrap();
        let first = install_guide(&partial, &output).unwrap();
        assert_eq!(first, GuideUpdate { changed: true, bytes: 10 });
        assert!(!partial.exists());

        std::fs::write(&partial, "<tv>1</tv>").unwrap();
        assert!(!install_guide(&partial, &output).unwrap().changed);

        std::fs::write(&partial, "<tv>2</tv>").unwrap();
        assert!(install_guide(&partial, &output).unwrap().changed);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "<tv>2</tv>");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sweep_removes_only_partials_recursively() {
        let dir = temp_dir();
        std::fs::create_dir_all(dir.join("in")).unwrap();
        std::fs::write(dir.join("epg_US.xml"), "<tv/>").unwrap();
        std::fs::write(dir.join("epg_IN.partial.xml"), "<tv>trunc").unwrap();
        std::fs::write(dir.join("in").join("epg.partial.xml"), "<tv>trunc").unwrap();

        let removed = sweep_partials(&dir).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(dir.join("epg_US.xml").exists());
        assert!(!dir.join("epg_IN.partial.xml").exists());
        assert!(!dir.join("in").join("epg.partial.xml").exists());

        assert!(sweep_partials(&dir.join("missing")).unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clear_dir_keeps_directory() {
        let dir = temp_dir();
        std::fs::write(dir.join("a.xml"), "a").unwrap();
        std::fs::write(dir.join("b.xml"), "b").unwrap();

        assert_eq!(clear_dir(&dir).unwrap(), 2);
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
        assert_eq!(clear_dir(&dir.join("missing")).unwrap(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
