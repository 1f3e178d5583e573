//! File and directory operations the controller's file browser drives.
//!
//! Everything that mutates the filesystem is safe to retry: `mkdir` means
//! "ensure the directory exists" and `delete` tolerates paths that are
//! already gone.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant, UNIX_EPOCH};

use transport::events::BackendEvent;
use transport::types::{CommandId, DirEntryInfo, TransferItem, TransferKind};
use transport::ConnectionWriter;

use crate::machine::UserError;

/// Minimum spacing of progress events per command, except the terminal one.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

pub fn get_dirs_children_info(
    paths: &[String],
    include_hidden: bool,
) -> BTreeMap<String, Option<BTreeMap<String, DirEntryInfo>>> {
    paths
        .iter()
        .map(|path| (path.clone(), single_dir_children(path, include_hidden)))
        .collect()
}

fn single_dir_children(path: &str, include_hidden: bool) -> Option<BTreeMap<String, DirEntryInfo>> {
    let effective = if path.is_empty() { "/" } else { path };
    let dir = Path::new(effective);
    if !dir.is_dir() {
        return None;
    }

    let entries = std::fs::read_dir(dir).ok()?;
    let mut result = BTreeMap::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let hidden = name.starts_with('.');
        if hidden && !include_hidden {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        result.insert(
            name,
            DirEntryInfo {
                size_bytes: if meta.is_dir() { None } else { Some(meta.len()) },
                modified_epoch: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64()),
                hidden,
            },
        );
    }
    Some(result)
}

pub fn read_file(path: &str) -> Result<String, UserError> {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| UserError::new(format!("Can't read '{path}': {e}")))
}

pub fn write_file(path: &str, content: &str) -> Result<(), UserError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| UserError::new(format!("Can't create '{}': {e}", parent.display())))?;
        }
    }
    std::fs::write(path, content).map_err(|e| UserError::new(format!("Can't write '{path}': {e}")))
}

/// Ensure-exists semantics: succeeding twice in a row is the point.
pub fn mkdir(path: &str) -> Result<(), UserError> {
    std::fs::create_dir_all(path)
        .map_err(|e| UserError::new(format!("Can't create directory '{path}': {e}")))
}

/// Removes files and directory trees; missing paths are fine (a retried
/// delete must not fail halfway).
pub fn delete(paths: &[String]) -> Result<(), UserError> {
    for path in paths {
        let p = Path::new(path);
        let result = if p.is_dir() {
            std::fs::remove_dir_all(p)
        } else {
            std::fs::remove_file(p)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(UserError::new(format!("Can't delete '{path}': {e}"))),
        }
    }
    Ok(())
}

/// Copies transfer items, reporting progress keyed by the issuing command.
/// Serves both `upload` and `download`; for a local backend the two differ
/// only in which side chose the paths.
pub fn transfer(
    items: &[TransferItem],
    command_id: Option<CommandId>,
    writer: &ConnectionWriter,
) -> Result<(), UserError> {
    let total: u64 = items.iter().filter_map(|i| i.size_bytes).sum();
    let mut done: u64 = 0;
    let mut progress = ProgressReporter::new(command_id, writer);
    progress.report(0, total.max(1), None);

    for item in items {
        match item.kind {
            TransferKind::Dir => {
                mkdir(&item.target_path)?;
            }
            TransferKind::File => {
                if let Some(parent) = Path::new(&item.target_path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            UserError::new(format!("Can't create '{}': {e}", parent.display()))
                        })?;
                    }
                }
                std::fs::copy(&item.source_path, &item.target_path).map_err(|e| {
                    UserError::new(format!(
                        "Can't copy '{}' to '{}': {e}",
                        item.source_path, item.target_path
                    ))
                })?;
                done += item.size_bytes.unwrap_or(0);
            }
        }
        progress.report(done, total.max(1), Some(&item.target_path));
    }

    progress.finish(total.max(1));
    Ok(())
}

struct ProgressReporter<'a> {
    command_id: Option<CommandId>,
    writer: &'a ConnectionWriter,
    last: Option<Instant>,
}

impl<'a> ProgressReporter<'a> {
    fn new(command_id: Option<CommandId>, writer: &'a ConnectionWriter) -> Self {
        Self {
            command_id,
            writer,
            last: None,
        }
    }

    fn report(&mut self, value: u64, maximum: u64, description: Option<&str>) {
        let Some(command_id) = self.command_id else {
            return;
        };
        let now = Instant::now();
        if value != maximum {
            if let Some(last) = self.last {
                if now.duration_since(last) < PROGRESS_INTERVAL {
                    return;
                }
            }
        }
        self.last = Some(now);
        let _ = self
            .writer
            .send_message(&transport::MessageFromBackend::Event(
                BackendEvent::InlineProgress {
                    command_id,
                    value,
                    maximum,
                    description: description.map(str::to_owned),
                },
            ));
    }

    fn finish(&mut self, maximum: u64) {
        self.last = None;
        self.report(maximum, maximum, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_twice_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        let target_str = target.to_str().unwrap();

        mkdir(target_str).expect("first mkdir");
        mkdir(target_str).expect("second mkdir");
        assert!(target.is_dir());
    }

    #[test]
    fn delete_tolerates_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "data").unwrap();

        let paths = vec![
            file.to_str().unwrap().to_owned(),
            dir.path().join("never-existed").to_str().unwrap().to_owned(),
        ];
        delete(&paths).expect("first delete");
        delete(&paths).expect("repeated delete");
        assert!(!file.exists());
    }

    #[test]
    fn roundtrip_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/out.py");
        let path_str = path.to_str().unwrap();

        write_file(path_str, "print('hi')\n").expect("writing");
        assert_eq!(read_file(path_str).expect("reading"), "print('hi')\n");
    }

    #[test]
    fn listing_marks_directories_and_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("visible.txt"), "abc").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();

        let path = dir.path().to_str().unwrap().to_owned();
        let all = get_dirs_children_info(&[path.clone()], true);
        let children = all[&path].as_ref().expect("a directory");
        assert!(children["sub"].size_bytes.is_none());
        assert_eq!(children["visible.txt"].size_bytes, Some(3));
        assert!(children[".hidden"].hidden);

        let visible_only = get_dirs_children_info(&[path.clone()], false);
        assert!(!visible_only[&path]
            .as_ref()
            .unwrap()
            .contains_key(".hidden"));
    }

    #[test]
    fn listing_a_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        let path = file.to_str().unwrap().to_owned();
        let all = get_dirs_children_info(&[path.clone()], false);
        assert!(all[&path].is_none());
    }
}
