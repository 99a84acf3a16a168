//! External collaborator commands
//!
//! The companion launcher, the artifact transfer and the sensor process are all
//! configured as argv lists. Arguments may contain `{placeholder}` tokens that
//! are substituted just before spawning.

use std::process::{Child, Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionError;

/// A configured argv list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalCommand {
    argv: Vec<String>,
}

impl ExternalCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Substitute `{key}` tokens in every argument
    pub fn render(&self, vars: &[(&str, &str)]) -> ExternalCommand {
        let argv = self
            .argv
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{}}}", key), value)
                })
            })
            .collect();
        ExternalCommand { argv }
    }

    fn command(&self) -> Result<Command, SessionError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| SessionError::Config("empty command".to_string()))?;
        let mut command = Command::new(program);
        command.args(args);
        Ok(command)
    }

    /// Spawn without waiting; the caller owns the child
    pub fn spawn(&self) -> Result<Child, SessionError> {
        debug!(argv = ?self.argv, "spawning external command");
        let child = self.command()?.stdin(Stdio::null()).spawn()?;
        Ok(child)
    }

    /// Run to completion, failing on a non-zero exit status
    pub fn run(&self) -> Result<(), String> {
        debug!(argv = ?self.argv, "running external command");
        let mut command = self.command().map_err(|e| e.to_string())?;
        let status = command
            .stdin(Stdio::null())
            .status()
            .map_err(|e| format!("{}: {}", self.argv[0], e))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {}", self.argv[0], status))
        }
    }
}
