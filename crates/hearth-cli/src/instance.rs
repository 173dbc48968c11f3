//! Single-instance guard.
//!
//! A pid file claimed with `O_EXCL`.  A file left behind by a dead process
//! is reclaimed; a live pid means another kernel owns the machine.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context};

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: PathBuf) -> anyhow::Result<Self> {
        for _ in 0..3 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("failed to write pid file {}", path.display()))?;
                    tracing::debug!(path = %path.display(), "instance lock acquired");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|raw| raw.trim().parse::<i32>().ok());

                    if let Some(pid) = owner {
                        if process_alive(pid) {
                            bail!("hearthd is already running (pid {pid})");
                        }
                    }

                    tracing::warn!(path = %path.display(), "reclaiming stale pid file");
                    std::fs::remove_file(&path).with_context(|| {
                        format!("failed to remove stale pid file {}", path.display())
                    })?;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create pid file {}", path.display()));
                }
            }
        }
        bail!("could not acquire instance lock at {}", path.display());
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearthd.pid");

        let lock = InstanceLock::acquire(path.clone()).unwrap();
        assert!(path.exists());

        // Our own pid is alive, so the second claim is refused.
        let err = InstanceLock::acquire(path.clone()).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn stale_pid_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearthd.pid");

        // A pid far above any plausible live process.
        std::fs::write(&path, "999999999\n").unwrap();

        let _lock = InstanceLock::acquire(path.clone()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn unparseable_pid_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearthd.pid");
        std::fs::write(&path, "not a pid").unwrap();

        assert!(InstanceLock::acquire(path).is_ok());
    }
}
