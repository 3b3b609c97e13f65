use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const BACKOFF_BASE_MS: u64 = 200;

/// Bounded-retry delete/move primitives with lock detection. Pure
/// mechanism: the safety engine has already authorized anything that
/// reaches this layer.
pub struct RetryRecoveryLayer {
    lock_holder_names: Vec<String>,
    max_attempts: u32,
    queue: VecDeque<PathBuf>,
    queue_limit: usize,
}

impl RetryRecoveryLayer {
    pub fn new(lock_holder_names: Vec<String>, max_attempts: u32, queue_limit: usize) -> Self {
        Self {
            lock_holder_names,
            max_attempts: max_attempts.max(1),
            queue: VecDeque::new(),
            queue_limit,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Delete a file with exponential backoff. Lock errors trigger holder
    /// termination before the next attempt; the last resort is an OS-shell
    /// forced delete. An undeletable file lands in the retry queue.
    pub fn delete_file_with_retry(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let mut last_error: Option<io::Error> = None;
        for attempt in 0..self.max_attempts {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    return Ok(());
                }
                Err(e) => {
                    if is_lock_error(&e) {
                        warn!(
                            "Delete of {} blocked (attempt {}/{}): {}",
                            path.display(),
                            attempt + 1,
                            self.max_attempts,
                            e
                        );
                        self.terminate_lock_holders();
                    } else {
                        warn!(
                            "Delete of {} failed (attempt {}/{}): {}",
                            path.display(),
                            attempt + 1,
                            self.max_attempts,
                            e
                        );
                    }
                    last_error = Some(e);
                }
            }
            thread::sleep(Duration::from_millis(BACKOFF_BASE_MS << attempt));
        }

        if force_delete_via_shell(path) && !path.exists() {
            info!("Forced delete of locked file {}", path.display());
            return Ok(());
        }

        self.enqueue(path.to_path_buf());
        match last_error {
            Some(e) if !is_lock_error(&e) => Err(e.into()),
            _ => Err(Error::TransientLock {
                path: path.to_path_buf(),
                attempts: self.max_attempts,
            }),
        }
    }

    /// Double-checked folder deletion: the removability predicate is
    /// re-evaluated immediately before `remove_dir_all`, closing the
    /// window between an earlier eligibility decision and the delete.
    pub fn safe_delete_folder<F>(&mut self, path: &Path, removable: F) -> Result<bool>
    where
        F: Fn(&Path) -> bool,
    {
        if !path.exists() {
            return Ok(true);
        }

        if !removable(path) {
            info!(
                "Folder {} no longer removable at delete time; leaving it",
                path.display()
            );
            return Ok(false);
        }

        match fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(e) if is_lock_error(&e) => {
                self.terminate_lock_holders();
                thread::sleep(Duration::from_millis(BACKOFF_BASE_MS));
                fs::remove_dir_all(path)?;
            }
            Err(e) => return Err(e.into()),
        }

        if path.exists() {
            warn!("Folder {} still present after delete", path.display());
            return Ok(false);
        }
        debug!("Removed folder {}", path.display());
        Ok(true)
    }

    fn enqueue(&mut self, path: PathBuf) {
        if self.queue.len() >= self.queue_limit {
            let dropped = self.queue.pop_front();
            if let Some(dropped) = dropped {
                warn!(
                    "Retry queue full; dropping oldest entry {}",
                    dropped.display()
                );
            }
        }
        self.queue.push_back(path);
    }

    /// Replay the retry queue. Each pass attempts every queued path once;
    /// passes are separated by `wait` while anything remains.
    pub fn replay_queue(&mut self, passes: u32, wait: Duration) -> usize {
        for pass in 0..passes {
            if self.queue.is_empty() {
                break;
            }
            if pass > 0 {
                thread::sleep(wait);
            }
            let pending: Vec<PathBuf> = self.queue.drain(..).collect();
            info!(
                "Retry pass {}/{}: {} queued deletions",
                pass + 1,
                passes,
                pending.len()
            );
            for path in pending {
                if !path.exists() {
                    continue;
                }
                if fs::remove_file(&path).is_ok() {
                    debug!("Retry delete succeeded for {}", path.display());
                } else if force_delete_via_shell(&path) && !path.exists() {
                    debug!("Retry forced delete succeeded for {}", path.display());
                } else {
                    self.enqueue(path);
                }
            }
        }
        self.queue.len()
    }

    /// Kill processes from the allowlist that may be holding file locks.
    /// Matching is by process name only; nothing outside the allowlist is
    /// ever touched.
    fn terminate_lock_holders(&self) {
        if self.lock_holder_names.is_empty() {
            return;
        }
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        for process in system.processes().values() {
            let name = process.name().to_string_lossy().to_ascii_lowercase();
            let matched = self
                .lock_holder_names
                .iter()
                .any(|holder| name.starts_with(&holder.to_ascii_lowercase()));
            if matched {
                if process.kill() {
                    warn!("Terminated lock-holder process '{}'", name);
                } else {
                    warn!("Could not terminate lock-holder process '{}'", name);
                }
            }
        }
    }
}

/// Windows sharing violations surface as PermissionDenied or raw code
/// 32/33; Unix lock-ish failures as EBUSY/EPERM.
fn is_lock_error(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    matches!(e.raw_os_error(), Some(32) | Some(33) | Some(16))
}

fn force_delete_via_shell(path: &Path) -> bool {
    let status = if cfg!(windows) {
        Command::new("cmd")
            .args(["/C", "del", "/F", "/Q"])
            .arg(path)
            .status()
    } else {
        Command::new("rm").arg("-f").arg(path).status()
    };
    match status {
        Ok(status) => status.success(),
        Err(e) => {
            warn!("Shell delete of {} failed to spawn: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> RetryRecoveryLayer {
        RetryRecoveryLayer::new(Vec::new(), 3, 4)
    }

    #[test]
    fn test_delete_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("victim.bin");
        fs::write(&file, b"data").unwrap();
        layer().delete_file_with_retry(&file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_delete_missing_file_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        layer()
            .delete_file_with_retry(&tmp.path().join("ghost.bin"))
            .unwrap();
    }

    #[test]
    fn test_safe_delete_folder_respects_double_check() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("junk");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join("leftover.nfo"), b"x").unwrap();

        // Predicate says no: folder survives.
        let kept = layer().safe_delete_folder(&folder, |_| false).unwrap();
        assert!(!kept);
        assert!(folder.exists());

        // Predicate says yes: folder goes, and is verified gone.
        let removed = layer().safe_delete_folder(&folder, |_| true).unwrap();
        assert!(removed);
        assert!(!folder.exists());
    }

    #[test]
    fn test_retry_queue_is_bounded() {
        let mut layer = RetryRecoveryLayer::new(Vec::new(), 1, 2);
        layer.enqueue(PathBuf::from("/a"));
        layer.enqueue(PathBuf::from("/b"));
        layer.enqueue(PathBuf::from("/c"));
        assert_eq!(layer.queued(), 2);
    }

    #[test]
    fn test_replay_drains_deletable_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("stuck.bin");
        fs::write(&file, b"x").unwrap();

        let mut layer = layer();
        layer.enqueue(file.clone());
        let remaining = layer.replay_queue(2, Duration::from_millis(1));
        assert_eq!(remaining, 0);
        assert!(!file.exists());
    }
}
