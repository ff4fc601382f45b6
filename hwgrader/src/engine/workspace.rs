/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-task file workspace and its timestamped backups.
//!
//! ```text
//! <workspace>/                      ← inputs written here, devices add outputs
//! <backup_root>/<timestamp>/<ws>/   ← whole workspace moved here after a task
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use crate::task::OutputBundle;

/// Backup directory name format (local time, microseconds).
pub const BACKUP_STAMP_FORMAT: &str = "%Y-%m-%d.%H:%M:%S%.6f";

pub fn backup_dir_name(now: DateTime<Local>) -> String {
    now.format(BACKUP_STAMP_FORMAT).to_string()
}

/// Recreate `workspace` empty and write the task's input files into it.
pub fn prepare(workspace: &Path, inputs: &HashMap<String, Vec<u8>>) -> io::Result<()> {
    match fs::remove_dir_all(workspace) {
        Ok(()) => debug!(path = %workspace.display(), "stale workspace removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(workspace)?;

    for (name, content) in inputs {
        fs::write(workspace.join(name), content)?;
    }
    Ok(())
}

/// Move `workspace` into a fresh `<backup_root>/<stamp>/` directory.
///
/// Returns the workspace's new location.  Falls back to copy-and-remove
/// when a rename is not possible (e.g. across filesystems).
pub fn backup(workspace: &Path, backup_root: &Path, now: DateTime<Local>) -> io::Result<PathBuf> {
    let task_dir = backup_root.join(backup_dir_name(now));
    fs::create_dir_all(&task_dir)?;

    let leaf = workspace
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("files"));
    let dest = task_dir.join(leaf);

    if !workspace.exists() {
        warn!(path = %workspace.display(), "workspace vanished before backup");
        fs::create_dir_all(&dest)?;
        return Ok(dest);
    }

    if let Err(e) = fs::rename(workspace, &dest) {
        debug!(error = %e, "rename failed, copying workspace instead");
        copy_dir(workspace, &dest)?;
        fs::remove_dir_all(workspace)?;
    }
    Ok(dest)
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Locate each required output inside `dir`.
pub fn collect_outputs(dir: &Path, required: &[String]) -> OutputBundle {
    let mut bundle = OutputBundle::default();
    for name in required {
        let path = dir.join(name);
        if path.is_file() {
            bundle.files.insert(name.clone(), path);
        } else {
            bundle.missing.push(name.clone());
        }
    }
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamp_has_microseconds() {
        let t = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
            + chrono::Duration::microseconds(42);
        assert_eq!(backup_dir_name(t), "2024-03-09.07:05:01.000042");
    }

    #[test]
    fn prepare_replaces_previous_contents() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("files");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("stale.txt"), b"old").unwrap();

        let inputs = HashMap::from([("waveform.txt".to_string(), b"==\n".to_vec())]);
        prepare(&ws, &inputs).unwrap();

        assert!(!ws.join("stale.txt").exists());
        assert_eq!(fs::read(ws.join("waveform.txt")).unwrap(), b"==\n");
    }

    #[test]
    fn backup_moves_workspace_and_collects_outputs() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("files");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("result.txt"), b"ok").unwrap();

        let backups = root.path().join("backups");
        let moved = backup(&ws, &backups, Local::now()).unwrap();

        assert!(!ws.exists());
        assert!(moved.starts_with(&backups));
        assert_eq!(fs::read(moved.join("result.txt")).unwrap(), b"ok");

        let bundle = collect_outputs(&moved, &["result.txt".into(), "log.txt".into()]);
        assert_eq!(bundle.files["result.txt"], moved.join("result.txt"));
        assert_eq!(bundle.missing, vec!["log.txt".to_string()]);
    }

    #[test]
    fn backup_of_missing_workspace_still_creates_directory() {
        let root = tempfile::tempdir().unwrap();
        let moved = backup(&root.path().join("files"), root.path(), Local::now()).unwrap();
        assert!(moved.is_dir());
    }
}
