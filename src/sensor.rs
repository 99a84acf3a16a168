//! Sensor process supervision
//!
//! The sensor (an eye tracker) runs as a child process writing a CSV log into
//! a log directory. The supervisor only starts it and stops it; the log is
//! read back after the process has exited.
//!
//! Stopping sends SIGINT so the sensor can flush its log. That graceful stop
//! exists on unix only; elsewhere the process is terminated.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::command::ExternalCommand;
use crate::error::SessionError;

/// Lifecycle of the sensor process as seen by the controller
pub trait SensorProcess {
    /// Spawn the process and return immediately
    fn start(&mut self) -> Result<SensorLogHandle, SessionError>;

    /// Interrupt the process and block until it has exited
    fn stop(&mut self) -> Result<(), SessionError>;
}

/// Session-scoped reference to the log a sensor run produces
#[derive(Debug, Clone)]
pub struct SensorLogHandle {
    log_dir: PathBuf,
    /// `None` for logs of a finished session, where overlap cannot be judged
    spawned_at: Option<SystemTime>,
}

impl SensorLogHandle {
    pub fn new(log_dir: impl Into<PathBuf>, spawned_at: SystemTime) -> Self {
        Self {
            log_dir: log_dir.into(),
            spawned_at: Some(spawned_at),
        }
    }

    /// Handle on logs left by an earlier run
    pub fn existing(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            spawned_at: None,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Pick the most recently created log in the log directory.
    ///
    /// Two sessions running at the same time would both pick the newest file.
    /// That case is only reported, not prevented.
    pub fn resolve(&self) -> Result<PathBuf, SessionError> {
        let entries = fs::read_dir(&self.log_dir).map_err(|e| {
            SessionError::SensorLog(format!("{}: {}", self.log_dir.display(), e))
        })?;

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                let created = metadata.created().or_else(|_| metadata.modified())?;
                candidates.push((created, entry.path()));
            }
        }

        let fresh = self.created_since_spawn(&candidates);
        if fresh > 1 {
            warn!(
                count = fresh,
                dir = %self.log_dir.display(),
                "several sensor logs created since this session started"
            );
        }

        candidates
            .into_iter()
            .max_by_key(|(created, _)| *created)
            .map(|(_, path)| path)
            .ok_or_else(|| {
                SessionError::SensorLog(format!("no sensor log in {}", self.log_dir.display()))
            })
    }
}

impl SensorLogHandle {
    fn created_since_spawn(&self, candidates: &[(SystemTime, PathBuf)]) -> usize {
        let Some(spawned_at) = self.spawned_at else {
            return 0;
        };
        candidates
            .iter()
            .filter(|(created, _)| *created >= spawned_at)
            .count()
    }
}

/// Supervisor for a sensor launched from a configured command
#[derive(Debug)]
pub struct SensorSupervisor {
    command: ExternalCommand,
    log_dir: PathBuf,
    child: Option<Child>,
}

impl SensorSupervisor {
    pub fn new(command: ExternalCommand, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            log_dir: log_dir.into(),
            child: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

impl SensorProcess for SensorSupervisor {
    fn start(&mut self) -> Result<SensorLogHandle, SessionError> {
        if self.child.is_some() {
            return Err(SessionError::SensorProcess("sensor already running".to_string()));
        }
        let spawned_at = SystemTime::now();
        let child = self
            .command
            .spawn()
            .map_err(|e| SessionError::SensorProcess(format!("failed to spawn sensor: {}", e)))?;
        info!(pid = child.id(), "sensor process started");
        self.child = Some(child);
        Ok(SensorLogHandle::new(self.log_dir.clone(), spawned_at))
    }

    fn stop(&mut self) -> Result<(), SessionError> {
        let Some(mut child) = self.child.take() else {
            debug!("sensor stop requested but no process is running");
            return Ok(());
        };

        interrupt(&mut child)?;
        let status = child.wait()?;
        info!(pid = child.id(), %status, "sensor process exited");
        Ok(())
    }
}

/// Ask the child to shut down the way Ctrl-C would
#[cfg(unix)]
fn interrupt(child: &mut Child) -> Result<(), SessionError> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| SessionError::SensorProcess(format!("pid {} out of range", child.id())))?;
    // SAFETY: kill(2) with a pid we own and a valid signal number.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: already gone, wait() will reap it.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(SessionError::SensorProcess(format!("SIGINT failed: {}", err)));
        }
    }
    Ok(())
}

/// No SIGINT outside unix: the child is terminated outright and gets no
/// chance to flush its log. Sessions whose datasets matter must run on unix.
#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> Result<(), SessionError> {
    warn!(
        pid = child.id(),
        "no interrupt signal on this platform; terminating sensor without a flush"
    );
    child
        .kill()
        .map_err(|e| SessionError::SensorProcess(format!("terminate failed: {}", e)))
}
