//! File layout of a participant's data directory

use std::path::{Path, PathBuf};

/// Paths of every artifact produced for one participant
#[derive(Debug, Clone)]
pub struct SessionLayout {
    data_root: PathBuf,
    participant: u64,
}

impl SessionLayout {
    pub fn new(data_root: impl Into<PathBuf>, participant: u64) -> Self {
        Self {
            data_root: data_root.into(),
            participant,
        }
    }

    pub fn participant(&self) -> u64 {
        self.participant
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// `<data_root>/user<id>`
    pub fn participant_dir(&self) -> PathBuf {
        self.data_root.join(format!("user{}", self.participant))
    }

    pub fn answer_log(&self, index: usize) -> PathBuf {
        self.participant_dir()
            .join(format!("answer_u{}p{}.log", self.participant, index))
    }

    /// Interaction markers transferred from the device
    pub fn interaction_artifact(&self, index: usize) -> PathBuf {
        self.participant_dir()
            .join(format!("rods_u{}p{}.tap", self.participant, index))
    }

    pub fn aligned_dataset(&self, index: usize) -> PathBuf {
        self.participant_dir()
            .join(format!("eyes_u{}p{}.csv", self.participant, index))
    }
}
