//! PID file handling and the `-s reload` command path.

use std::path::{ Path, PathBuf };

use nix::sys::signal::{ kill, Signal };
use nix::unistd::Pid;
use tracing::{ info, warn };

use crate::error::{ RelayError, Result };

/// The running instance's PID file; removed when dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<PidFile> {
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(|e| {
            RelayError::config(format!("cannot write pid file {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), pid = std::process::id(), "pid file written");
        Ok(PidFile { path: path.to_path_buf() })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
        }
    }
}

pub fn read_pid(path: &Path) -> Result<i32> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        RelayError::config(format!("cannot read pid file {}: {e}", path.display()))
    })?;
    text.trim()
        .parse()
        .map_err(|_| RelayError::config(format!("pid file {} is malformed", path.display())))
}

/// Send SIGHUP to the instance recorded in the pid file.
pub fn send_reload(path: &Path) -> Result<()> {
    let pid = read_pid(path)?;
    kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|e| {
        RelayError::config(format!("cannot signal pid {pid}: {e}"))
    })?;
    info!(pid, "reload signal sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_read_remove_roundtrip() {
        let path = std::env::temp_dir().join(format!("srt-relay-test-{}.pid", std::process::id()));
        {
            let _pidfile = PidFile::create(&path).unwrap();
            assert_eq!(read_pid(&path).unwrap(), std::process::id() as i32);
        }
        // Dropped: the file is gone.
        assert!(read_pid(&path).is_err());
    }

    #[test]
    fn malformed_pid_file_rejected() {
        let path = std::env::temp_dir().join(
            format!("srt-relay-test-bad-{}.pid", std::process::id())
        );
        std::fs::write(&path, "not a pid").unwrap();
        assert!(read_pid(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
