//! Problem definitions and the on-disk problem set
//!
//! A problem compares two rods: the participant is told the length of the
//! reference rod and asked for the length of the target rod. Rod colours are
//! presentation only; the canonical solution is the target magnitude.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionError;
use crate::rational::Rational;

/// Extension of problem definition files
pub const PROBLEM_EXTENSION: &str = "prob";

/// Rod colours (the Cuisenaire set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RodColor {
    White,
    Red,
    LightGreen,
    Purple,
    Yellow,
    DarkGreen,
    Black,
    Brown,
    Blue,
    Orange,
}

impl RodColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            RodColor::White => "white",
            RodColor::Red => "red",
            RodColor::LightGreen => "light green",
            RodColor::Purple => "purple",
            RodColor::Yellow => "yellow",
            RodColor::DarkGreen => "dark green",
            RodColor::Black => "black",
            RodColor::Brown => "brown",
            RodColor::Blue => "blue",
            RodColor::Orange => "orange",
        }
    }
}

/// A magnitude tagged with the rod it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledMagnitude {
    pub color: RodColor,
    pub magnitude: Rational,
}

/// One comparison problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Position in the battery (0-based), assigned at load time
    #[serde(skip)]
    pub index: usize,
    /// Rod whose length is given to the participant
    pub reference: LabeledMagnitude,
    /// Rod whose length the participant must find
    pub target: LabeledMagnitude,
}

impl Problem {
    /// Parse a problem definition and check its invariants.
    pub fn from_json(index: usize, json: &str) -> Result<Self, SessionError> {
        let mut problem: Problem =
            serde_json::from_str(json).map_err(|e| SessionError::ProblemLoad {
                index,
                reason: e.to_string(),
            })?;
        problem.index = index;
        problem.validate()?;
        Ok(problem)
    }

    fn validate(&self) -> Result<(), SessionError> {
        for (role, side) in [("reference", &self.reference), ("target", &self.target)] {
            if !side.magnitude.is_positive() {
                return Err(SessionError::ProblemLoad {
                    index: self.index,
                    reason: format!("{} magnitude must be positive, got {}", role, side.magnitude),
                });
            }
        }
        Ok(())
    }

    /// The exact answer expected from the participant
    pub fn solution(&self) -> Rational {
        self.target.magnitude
    }

    /// Prompt shown on the response surface
    pub fn statement(&self) -> String {
        format!(
            "If the {} rod measures {} cm, how long is the {} rod?",
            self.reference.color.as_str(),
            self.reference.magnitude,
            self.target.color.as_str()
        )
    }

    /// Progress indicator, e.g. `3/10`
    pub fn progress_label(&self, battery_size: usize) -> String {
        format!("{}/{}", self.index + 1, battery_size)
    }
}

/// Read-only directory of `problem<i>.prob` files
#[derive(Debug, Clone)]
pub struct ProblemSet {
    dir: PathBuf,
}

impl ProblemSet {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(index: usize) -> String {
        format!("problem{}.{}", index, PROBLEM_EXTENSION)
    }

    pub fn path(&self, index: usize) -> PathBuf {
        self.dir.join(Self::file_name(index))
    }

    /// Load the problem at `index`
    pub fn load(&self, index: usize) -> Result<Problem, SessionError> {
        let path = self.path(index);
        debug!(index, path = %path.display(), "loading problem");
        let json = fs::read_to_string(&path).map_err(|e| SessionError::ProblemLoad {
            index,
            reason: format!("{}: {}", path.display(), e),
        })?;
        Problem::from_json(index, &json)
    }

    /// Copy the first `count` problem files into `dest` for archival
    pub fn archive_into(&self, dest: &Path, count: usize) -> Result<(), SessionError> {
        for index in 0..count {
            fs::copy(self.path(index), dest.join(Self::file_name(index)))?;
        }
        Ok(())
    }

    /// Indices in `0..count` whose file is missing or invalid
    pub fn check(&self, count: usize) -> Vec<(usize, String)> {
        (0..count)
            .filter_map(|index| self.load(index).err().map(|e| (index, e.to_string())))
            .collect()
    }
}
