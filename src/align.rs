//! Session log alignment
//!
//! After the session, the device's per-problem interaction markers and the
//! sensor's continuous log are brought together: for every administered
//! problem the sensor samples recorded while the participant was touching the
//! rods are written to their own dataset.
//!
//! Pipeline: transfer device artifacts → pick sensor log → parse markers →
//! slice samples → write dataset.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::ExternalCommand;
use crate::error::SessionError;
use crate::layout::SessionLayout;
use crate::sensor::SensorLogHandle;

/// Prefix of marker lines in an interaction artifact
const MARKER_PREFIX: char = 't';

/// Default name of the sensor log's timestamp column (milliseconds)
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "Timestamp (ms)";

/// Per-problem alignment failures; the other problems are still aligned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignmentError {
    #[error("Interaction artifact unreadable: {path}: {reason}")]
    MissingArtifact { path: PathBuf, reason: String },

    #[error("Expected exactly 2 interaction markers, found {found}")]
    MarkerCount { found: usize },

    #[error("Malformed marker on line {line_no}: {line:?}")]
    MalformedMarker { line_no: usize, line: String },

    #[error("Interaction interval ends before it starts: [{start}, {end}]")]
    InvertedInterval { start: i64, end: i64 },
}

/// Whole-second bounds of a participant's interaction with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InteractionInterval {
    pub start: i64,
    pub end: i64,
}

impl InteractionInterval {
    pub fn contains(&self, second: i64) -> bool {
        (self.start..=self.end).contains(&second)
    }

    /// Parse a device artifact: exactly two `t<seconds>` lines, other lines ignored
    pub fn parse(text: &str) -> Result<Self, AlignmentError> {
        let mut markers = Vec::with_capacity(2);
        for (line_no, line) in text.lines().enumerate() {
            let Some(value) = line.strip_prefix(MARKER_PREFIX) else {
                continue;
            };
            let second = value
                .trim()
                .parse::<i64>()
                .map_err(|_| AlignmentError::MalformedMarker {
                    line_no: line_no + 1,
                    line: line.to_string(),
                })?;
            markers.push(second);
        }

        match markers[..] {
            [start, end] if start <= end => Ok(Self { start, end }),
            [start, end] => Err(AlignmentError::InvertedInterval { start, end }),
            _ => Err(AlignmentError::MarkerCount {
                found: markers.len(),
            }),
        }
    }
}

/// One row of the sensor log
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    /// Position among the log's data rows (0-based)
    pub row: usize,
    /// Timestamp floored to whole seconds
    pub second: i64,
    /// The row exactly as logged
    pub line: String,
}

/// The sensor log, kept verbatim apart from the parsed timestamp
#[derive(Debug, Clone)]
pub struct SensorStream {
    header: String,
    samples: Vec<SensorSample>,
}

impl SensorStream {
    pub fn read(path: &Path, timestamp_column: &str) -> Result<Self, SessionError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SessionError::SensorLog(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text, timestamp_column)
    }

    /// Parse a sensor log.
    ///
    /// Rows without a usable timestamp are dropped; the remaining rows keep
    /// their position among the data rows.
    pub fn parse(text: &str, timestamp_column: &str) -> Result<Self, SessionError> {
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| SessionError::SensorLog("sensor log is empty".to_string()))?;

        let column = split_fields(header)
            .iter()
            .position(|name| name == timestamp_column)
            .ok_or_else(|| {
                SessionError::SensorLog(format!("no {:?} column in sensor log", timestamp_column))
            })?;

        let mut samples = Vec::new();
        let mut dropped = Vec::new();
        for (row, line) in lines.enumerate() {
            let second = split_fields(line)
                .get(column)
                .and_then(|field| millis_to_second(field));
            match second {
                Some(second) => samples.push(SensorSample {
                    row,
                    second,
                    line: line.to_string(),
                }),
                None => dropped.push(row),
            }
        }
        if !dropped.is_empty() {
            warn!(
                count = dropped.len(),
                first_row = dropped[0],
                column = timestamp_column,
                "dropping sensor rows without a usable timestamp"
            );
        }

        Ok(Self {
            header: header.to_string(),
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples inside the interval, in log order
    pub fn slice(&self, interval: InteractionInterval) -> Vec<&SensorSample> {
        self.samples
            .iter()
            .filter(|sample| interval.contains(sample.second))
            .collect()
    }

    /// CSV text of a slice: original row index first, then the logged columns
    pub fn render(&self, samples: &[&SensorSample]) -> String {
        let mut out = format!(",{}\n", self.header);
        for sample in samples {
            out.push_str(&format!("{},{}\n", sample.row, sample.line));
        }
        out
    }
}

/// Split one CSV record; commas inside double quotes do not separate fields
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);

    fields.iter_mut().for_each(|field| *field = field.trim().to_string());
    fields
}

/// `floor(ms / 1000)`, exact for integer timestamps
fn millis_to_second(field: &str) -> Option<i64> {
    if let Ok(ms) = field.parse::<i64>() {
        return Some(ms.div_euclid(1000));
    }
    let ms = field.parse::<f64>().ok().filter(|ms| ms.is_finite())?;
    Some((ms / 1000.0).floor() as i64)
}

/// Brings the device's interaction artifacts next to the session data
pub trait ArtifactFetcher {
    fn fetch(&mut self, layout: &SessionLayout) -> Result<(), SessionError>;
}

/// Transfer through a configured command (e.g. `scp -r`).
///
/// Placeholders: `{participant}`, `{dest}` (data root), `{participant_dir}`.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    command: ExternalCommand,
}

impl CommandFetcher {
    pub fn new(command: ExternalCommand) -> Self {
        Self { command }
    }
}

impl ArtifactFetcher for CommandFetcher {
    fn fetch(&mut self, layout: &SessionLayout) -> Result<(), SessionError> {
        if self.command.is_empty() {
            warn!("no transfer command configured; using artifacts already on disk");
            return Ok(());
        }
        let participant = layout.participant().to_string();
        let dest = layout.data_root().display().to_string();
        let participant_dir = layout.participant_dir().display().to_string();
        let command = self.command.render(&[
            ("participant", participant.as_str()),
            ("dest", dest.as_str()),
            ("participant_dir", participant_dir.as_str()),
        ]);
        info!(argv = ?command.argv(), "transferring device artifacts");
        command.run().map_err(SessionError::Transfer)
    }
}

/// A dataset written for one problem
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub index: usize,
    pub path: PathBuf,
    pub interval: InteractionInterval,
    pub samples: usize,
}

/// A problem whose dataset could not be produced
#[derive(Debug, Clone, Serialize)]
pub struct SkippedProblem {
    pub index: usize,
    pub reason: String,
}

/// Result of one alignment run
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentReport {
    pub run_id: Uuid,
    pub participant: u64,
    pub sensor_log: PathBuf,
    pub sensor_samples: usize,
    pub computed_at: DateTime<Utc>,
    pub datasets: Vec<DatasetSummary>,
    pub skipped: Vec<SkippedProblem>,
}

/// Slices the sensor log into per-problem datasets
#[derive(Debug, Clone)]
pub struct SessionLogAligner {
    layout: SessionLayout,
    timestamp_column: String,
    run_id: Uuid,
}

impl SessionLogAligner {
    pub fn new(layout: SessionLayout, timestamp_column: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            layout,
            timestamp_column: timestamp_column.into(),
            run_id,
        }
    }

    /// Align problems `0..=last_administered`.
    ///
    /// Marker problems skip only their own dataset. Transfer, sensor log and
    /// write failures abort the run; artifacts already written are left as is.
    pub fn align(
        &self,
        fetcher: &mut dyn ArtifactFetcher,
        sensor_log: &SensorLogHandle,
        last_administered: usize,
    ) -> Result<AlignmentReport, SessionError> {
        fetcher.fetch(&self.layout)?;

        let log_path = sensor_log.resolve()?;
        let stream = SensorStream::read(&log_path, &self.timestamp_column)?;
        info!(
            log = %log_path.display(),
            samples = stream.len(),
            problems = last_administered + 1,
            "aligning sensor log"
        );

        let mut datasets = Vec::new();
        let mut skipped = Vec::new();

        for index in 0..=last_administered {
            let interval = match self.read_interval(index) {
                Ok(interval) => interval,
                Err(err) => {
                    warn!(index, error = %err, "skipping alignment for problem");
                    skipped.push(SkippedProblem {
                        index,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let slice = stream.slice(interval);
            let path = self.layout.aligned_dataset(index);
            fs::write(&path, stream.render(&slice))?;
            datasets.push(DatasetSummary {
                index,
                path,
                interval,
                samples: slice.len(),
            });
        }

        Ok(AlignmentReport {
            run_id: self.run_id,
            participant: self.layout.participant(),
            sensor_log: log_path,
            sensor_samples: stream.len(),
            computed_at: Utc::now(),
            datasets,
            skipped,
        })
    }

    fn read_interval(&self, index: usize) -> Result<InteractionInterval, AlignmentError> {
        let path = self.layout.interaction_artifact(index);
        let text = fs::read_to_string(&path).map_err(|e| AlignmentError::MissingArtifact {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        InteractionInterval::parse(&text)
    }
}
