//! Answer logging and evaluation

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SessionError;
use crate::problem::Problem;
use crate::rational::{ParseError, Rational};

/// Outcome of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Correct,
    Incorrect,
    /// The text was not a number; the participant may try again
    Rejected { reason: String },
}

impl AnswerOutcome {
    pub fn is_correct(&self) -> bool {
        matches!(self, AnswerOutcome::Correct)
    }

    /// Whether the sequencer moves on after this outcome
    pub fn advances(&self) -> bool {
        !matches!(self, AnswerOutcome::Rejected { .. })
    }
}

/// Compare a raw answer with the problem's solution.
///
/// Pure: the same text and problem always give the same result.
pub fn evaluate(raw: &str, problem: &Problem) -> Result<bool, ParseError> {
    let answer = Rational::parse(raw)?;
    Ok(answer == problem.solution())
}

/// Append-only log of every submission for one problem
#[derive(Debug)]
pub struct AnswerLog {
    path: PathBuf,
    file: File,
}

impl AnswerLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `<timestamp> : <raw>` and flush
    pub fn record(&mut self, at: DateTime<Utc>, raw: &str) -> Result<(), SessionError> {
        writeln!(self.file, "{} : {}", format_timestamp(at), single_line(raw))?;
        self.file.flush()?;
        Ok(())
    }
}

/// Unix seconds with microsecond fraction, e.g. `1705312800.123456`
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

// One submission per line; embedded line breaks are escaped.
fn single_line(raw: &str) -> String {
    raw.replace('\r', "\\r").replace('\n', "\\n")
}
