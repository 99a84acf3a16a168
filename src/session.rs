//! Session controller
//!
//! Drives one participant through the problem battery:
//!
//! ```text
//! NotStarted ──start──▶ Active(0) ──advance──▶ … ──▶ Active(N-1) ──advance──▶ Ended
//! ```
//!
//! Every problem transition is synchronized with the device (`n<i>` and one
//! acknowledgment) before the next answer is accepted. Entering `Ended` runs
//! the end-of-session procedure exactly once: stop the sensor, tell the device
//! (`e`), align the logs, close the answer log and archive the problem files.

use std::fs;
use std::io::ErrorKind;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::align::{AlignmentReport, ArtifactFetcher, SessionLogAligner};
use crate::answer::{evaluate, AnswerLog, AnswerOutcome};
use crate::config::SessionConfig;
use crate::device::{DeviceLink, Frame};
use crate::error::SessionError;
use crate::layout::SessionLayout;
use crate::problem::{Problem, ProblemSet};
use crate::sensor::{SensorLogHandle, SensorProcess};

/// Where the sequencer stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "problem", rename_all = "snake_case")]
pub enum SessionPhase {
    NotStarted,
    Active(usize),
    Ended,
}

/// Static parameters of a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub participant: u64,
    pub battery_size: usize,
    pub problems: ProblemSet,
    pub layout: SessionLayout,
    pub timestamp_column: String,
}

impl SessionSettings {
    pub fn from_config(participant: u64, config: &SessionConfig) -> Self {
        Self {
            participant,
            battery_size: config.battery_size,
            problems: ProblemSet::new(config.storage.problem_dir.clone()),
            layout: SessionLayout::new(config.storage.data_root.clone(), participant),
            timestamp_column: config.sensor.timestamp_column.clone(),
        }
    }
}

/// One participant's run through the battery
pub struct SessionController<D, S, F> {
    run_id: Uuid,
    settings: SessionSettings,
    device: D,
    sensor: S,
    fetcher: F,
    phase: SessionPhase,
    ended: bool,
    current: Option<Problem>,
    answer_log: Option<AnswerLog>,
    sensor_log: Option<SensorLogHandle>,
    report: Option<AlignmentReport>,
}

impl<D, S, F> SessionController<D, S, F>
where
    D: DeviceLink,
    S: SensorProcess,
    F: ArtifactFetcher,
{
    /// The participant id comes from the caller; the controller never assigns one.
    pub fn new(settings: SessionSettings, device: D, sensor: S, fetcher: F) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            settings,
            device,
            sensor,
            fetcher,
            phase: SessionPhase::NotStarted,
            ended: false,
            current: None,
            answer_log: None,
            sensor_log: None,
            report: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn participant(&self) -> u64 {
        self.settings.participant
    }

    pub fn battery_size(&self) -> usize {
        self.settings.battery_size
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Problem currently shown to the participant
    pub fn current_problem(&self) -> Option<&Problem> {
        self.current.as_ref()
    }

    pub fn alignment_report(&self) -> Option<&AlignmentReport> {
        self.report.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    /// `NotStarted → Active(0)`
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.phase != SessionPhase::NotStarted {
            return Err(SessionError::InvalidTransition(format!(
                "start from {:?}",
                self.phase
            )));
        }

        let participant = self.settings.participant;
        self.create_participant_dir()?;

        self.sensor_log = Some(self.sensor.start()?);
        self.device.send_frame(Frame::Register(participant))?;
        info!(participant, run_id = %self.run_id, "session started");

        self.enter_problem(0)
    }

    /// `Active(i) → Active(i+1)`, or `Ended` after the last problem
    pub fn advance(&mut self) -> Result<SessionPhase, SessionError> {
        let SessionPhase::Active(index) = self.phase else {
            return Err(SessionError::InvalidTransition(format!(
                "advance from {:?}",
                self.phase
            )));
        };

        if index + 1 < self.settings.battery_size {
            self.enter_problem(index + 1)?;
        } else {
            self.end_session()?;
        }
        Ok(self.phase)
    }

    /// Log a submission, evaluate it and advance on any parsable answer.
    ///
    /// Unparsable text is logged, reported as `Rejected` and leaves the
    /// cursor where it is.
    pub fn submit_answer(&mut self, raw: &str) -> Result<AnswerOutcome, SessionError> {
        let SessionPhase::Active(index) = self.phase else {
            return Err(SessionError::InvalidTransition(format!(
                "answer submitted in {:?}",
                self.phase
            )));
        };
        let (Some(problem), Some(log)) = (self.current.as_ref(), self.answer_log.as_mut()) else {
            return Err(SessionError::InvalidTransition(format!(
                "problem {} is not loaded",
                index
            )));
        };

        log.record(Utc::now(), raw)?;

        let outcome = match evaluate(raw, problem) {
            Ok(true) => AnswerOutcome::Correct,
            Ok(false) => AnswerOutcome::Incorrect,
            Err(err) => {
                warn!(index, error = %err, "answer rejected");
                AnswerOutcome::Rejected {
                    reason: err.to_string(),
                }
            }
        };

        if outcome.advances() {
            info!(index, correct = outcome.is_correct(), "answer evaluated");
            self.advance()?;
        }
        Ok(outcome)
    }

    /// Run the end-of-session procedure once; later calls do nothing.
    ///
    /// Returns the alignment report the first time it runs.
    pub fn end_session(&mut self) -> Result<Option<AlignmentReport>, SessionError> {
        if self.ended {
            return Ok(None);
        }
        self.ended = true;

        let last_administered = match self.phase {
            SessionPhase::Active(index) => index,
            SessionPhase::NotStarted | SessionPhase::Ended => {
                self.phase = SessionPhase::Ended;
                info!(participant = self.settings.participant, "session ended before it started");
                return Ok(None);
            }
        };
        self.phase = SessionPhase::Ended;
        info!(
            participant = self.settings.participant,
            last_administered, "ending session"
        );

        self.sensor.stop()?;
        self.device.request(Frame::End)?;

        let report = match &self.sensor_log {
            Some(sensor_log) => {
                let aligner = SessionLogAligner::new(
                    self.settings.layout.clone(),
                    self.settings.timestamp_column.clone(),
                    self.run_id,
                );
                Some(aligner.align(&mut self.fetcher, sensor_log, last_administered)?)
            }
            None => None,
        };

        self.answer_log = None;
        self.current = None;
        self.settings.problems.archive_into(
            &self.settings.layout.participant_dir(),
            self.settings.battery_size,
        )?;
        info!(participant = self.settings.participant, "session archived");

        self.report = report.clone();
        Ok(report)
    }

    /// Cleanup after a fatal error: close the answer log and interrupt the
    /// sensor, without aligning or archiving anything.
    pub fn abort(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.phase = SessionPhase::Ended;
        self.answer_log = None;
        self.current = None;
        if let Err(err) = self.sensor.stop() {
            warn!(error = %err, "sensor did not stop cleanly during abort");
        }
        warn!(participant = self.settings.participant, "session aborted");
    }

    fn create_participant_dir(&self) -> Result<(), SessionError> {
        let layout = &self.settings.layout;
        fs::create_dir_all(layout.data_root())?;
        let dir = layout.participant_dir();
        match fs::create_dir(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(SessionError::DuplicateParticipant(dir))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn enter_problem(&mut self, index: usize) -> Result<(), SessionError> {
        self.answer_log = None;
        let problem = self.settings.problems.load(index)?;
        self.current = Some(problem);
        self.answer_log = Some(AnswerLog::open(self.settings.layout.answer_log(index))?);
        self.phase = SessionPhase::Active(index);

        self.device.request(Frame::Notify(index))?;
        info!(
            index,
            progress = %format!("{}/{}", index + 1, self.settings.battery_size),
            "problem loaded and synchronized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingLink;
    use pretty_assertions::assert_eq;
    use std::path::{Path, PathBuf};
    use std::time::SystemTime;
    use tempfile::TempDir;

    const BATTERY: usize = 4;

    #[derive(Debug)]
    struct FakeSensor {
        log_dir: PathBuf,
        starts: usize,
        stops: usize,
    }

    impl SensorProcess for FakeSensor {
        fn start(&mut self) -> Result<SensorLogHandle, SessionError> {
            self.starts += 1;
            Ok(SensorLogHandle::new(&self.log_dir, SystemTime::UNIX_EPOCH))
        }

        fn stop(&mut self) -> Result<(), SessionError> {
            self.stops += 1;
            Ok(())
        }
    }

    /// Writes device artifacts the way a transfer would
    struct FakeTransfer {
        calls: usize,
        broken_marker_for: Option<usize>,
    }

    impl ArtifactFetcher for FakeTransfer {
        fn fetch(&mut self, layout: &SessionLayout) -> Result<(), SessionError> {
            self.calls += 1;
            for index in 0..BATTERY {
                let markers = if Some(index) == self.broken_marker_for {
                    "t10\n".to_string()
                } else {
                    format!("t{}\nt{}\n", 10 + index, 12 + index)
                };
                fs::write(layout.interaction_artifact(index), markers)?;
            }
            Ok(())
        }
    }

    struct Fixture {
        root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let problems = root.path().join("problem_set");
            let logs = root.path().join("logs");
            fs::create_dir_all(&problems).unwrap();
            fs::create_dir_all(&logs).unwrap();

            let solutions = ["3/2", "2", "5/4", "7"];
            for (index, solution) in solutions.iter().enumerate() {
                let json = format!(
                    r#"{{"reference": {{"color": "red", "magnitude": "3"}},
                        "target": {{"color": "blue", "magnitude": "{}"}}}}"#,
                    solution
                );
                fs::write(problems.join(ProblemSet::file_name(index)), json).unwrap();
            }

            let mut log = String::from("Timestamp (ms),x,y\n");
            for ms in (9_000..20_000).step_by(1_000) {
                log.push_str(&format!("{},0.1,0.2\n", ms));
            }
            fs::write(logs.join("gaze.csv"), log).unwrap();

            Self { root }
        }

        fn path(&self) -> &Path {
            self.root.path()
        }

        fn controller(
            &self,
            participant: u64,
        ) -> SessionController<RecordingLink, FakeSensor, FakeTransfer> {
            self.controller_with(participant, RecordingLink::default(), None)
        }

        fn controller_with(
            &self,
            participant: u64,
            link: RecordingLink,
            broken_marker_for: Option<usize>,
        ) -> SessionController<RecordingLink, FakeSensor, FakeTransfer> {
            let settings = SessionSettings {
                participant,
                battery_size: BATTERY,
                problems: ProblemSet::new(self.path().join("problem_set")),
                layout: SessionLayout::new(self.path().join("user_data"), participant),
                timestamp_column: "Timestamp (ms)".to_string(),
            };
            let sensor = FakeSensor {
                log_dir: self.path().join("logs"),
                starts: 0,
                stops: 0,
            };
            let transfer = FakeTransfer {
                calls: 0,
                broken_marker_for,
            };
            SessionController::new(settings, link, sensor, transfer)
        }
    }

    #[test]
    fn test_start_registers_and_syncs_first_problem() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(7);

        session.start().unwrap();

        assert_eq!(session.phase(), SessionPhase::Active(0));
        assert_eq!(session.device().sent, vec!["u7", "n0"]);
        assert_eq!(session.device().receives, 1);
        assert_eq!(session.sensor().starts, 1);
        assert!(fixture.path().join("user_data/user7/answer_u7p0.log").exists());
        assert_eq!(session.current_problem().unwrap().index, 0);
    }

    #[test]
    fn test_walks_every_problem_then_ends() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(3);
        session.start().unwrap();

        let mut phases = vec![session.phase()];
        for _ in 1..BATTERY {
            phases.push(session.advance().unwrap());
        }
        assert_eq!(
            phases,
            vec![
                SessionPhase::Active(0),
                SessionPhase::Active(1),
                SessionPhase::Active(2),
                SessionPhase::Active(3),
            ]
        );
        assert_eq!(session.device().sent, vec!["u3", "n0", "n1", "n2", "n3"]);
        assert_eq!(session.device().receives, BATTERY);

        assert_eq!(session.advance().unwrap(), SessionPhase::Ended);
        assert_eq!(session.device().sent.last().map(String::as_str), Some("e"));
        assert_eq!(session.device().receives, BATTERY + 1);
        assert_eq!(session.sensor().stops, 1);

        let dir = fixture.path().join("user_data/user3");
        for index in 0..BATTERY {
            assert!(dir.join(format!("problem{}.prob", index)).exists());
            assert!(dir.join(format!("eyes_u3p{}.csv", index)).exists());
        }
        let report = session.alignment_report().unwrap();
        assert_eq!(report.datasets.len(), BATTERY);
        assert_eq!(report.run_id, session.run_id());
    }

    #[test]
    fn test_correct_decimal_answer_advances() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(7);
        session.start().unwrap();

        let outcome = session.submit_answer("1.5").unwrap();

        assert_eq!(outcome, AnswerOutcome::Correct);
        assert_eq!(session.phase(), SessionPhase::Active(1));
    }

    #[test]
    fn test_unparsable_answer_is_logged_and_keeps_cursor() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(7);
        session.start().unwrap();

        let outcome = session.submit_answer("abc").unwrap();

        assert!(matches!(outcome, AnswerOutcome::Rejected { .. }));
        assert_eq!(session.phase(), SessionPhase::Active(0));
        assert_eq!(session.device().sent, vec!["u7", "n0"]);

        let log = fs::read_to_string(fixture.path().join("user_data/user7/answer_u7p0.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.trim_end().ends_with(" : abc"));
    }

    #[test]
    fn test_wrong_answer_still_advances() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(7);
        session.start().unwrap();

        assert_eq!(session.submit_answer("4").unwrap(), AnswerOutcome::Incorrect);
        assert_eq!(session.phase(), SessionPhase::Active(1));

        let log = fs::read_to_string(fixture.path().join("user_data/user7/answer_u7p0.log")).unwrap();
        assert!(log.contains(" : 4"));
    }

    #[test]
    fn test_last_answer_ends_session() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(5);
        session.start().unwrap();
        for answer in ["3/2", "2", "1,25"] {
            assert_eq!(session.submit_answer(answer).unwrap(), AnswerOutcome::Correct);
        }
        assert_eq!(session.submit_answer("7").unwrap(), AnswerOutcome::Correct);

        assert_eq!(session.phase(), SessionPhase::Ended);
        assert!(session.is_ended());
        assert!(matches!(
            session.submit_answer("1"),
            Err(SessionError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_end_session_is_idempotent() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(9);
        session.start().unwrap();
        session.advance().unwrap();

        let first = session.end_session().unwrap();
        let second = session.end_session().unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(session.sensor().stops, 1);
        assert_eq!(session.device().sent.iter().filter(|f| *f == "e").count(), 1);
        assert!(matches!(session.advance(), Err(SessionError::InvalidTransition(_))));
    }

    #[test]
    fn test_early_end_aligns_only_administered_problems() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(4);
        session.start().unwrap();
        session.advance().unwrap();
        session.advance().unwrap();

        let report = session.end_session().unwrap().unwrap();

        let aligned: Vec<usize> = report.datasets.iter().map(|d| d.index).collect();
        assert_eq!(aligned, vec![0, 1, 2]);
        // Archival always covers the whole battery.
        assert!(fixture.path().join("user_data/user4/problem3.prob").exists());
    }

    #[test]
    fn test_broken_markers_skip_one_problem() {
        let fixture = Fixture::new();
        let mut session = fixture.controller_with(6, RecordingLink::default(), Some(2));
        session.start().unwrap();
        for _ in 0..BATTERY {
            session.advance().unwrap();
        }

        let report = session.alignment_report().unwrap();
        let aligned: Vec<usize> = report.datasets.iter().map(|d| d.index).collect();
        assert_eq!(aligned, vec![0, 1, 3]);
        assert_eq!(report.skipped[0].index, 2);
    }

    #[test]
    fn test_ragged_sensor_row_still_aligns_and_archives() {
        let fixture = Fixture::new();
        let log = fixture.path().join("logs/gaze.csv");
        let mut text = fs::read_to_string(&log).unwrap();
        text.push_str(",0.1,0.2\n");
        text.insert_str(text.find('\n').unwrap() + 1, "oops,0.1,0.2\n");
        fs::write(&log, text).unwrap();

        let mut session = fixture.controller(11);
        session.start().unwrap();
        for _ in 0..BATTERY {
            session.advance().unwrap();
        }

        let report = session.alignment_report().unwrap();
        assert_eq!(report.datasets.len(), BATTERY);
        assert!(report.skipped.is_empty());
        assert!(fixture.path().join("user_data/user11/problem3.prob").exists());

        // Row 0 is the ragged one; t10 starts at the second data row.
        let first = fs::read_to_string(fixture.path().join("user_data/user11/eyes_u11p0.csv")).unwrap();
        assert!(first.lines().nth(1).unwrap().starts_with("2,10000,"));
    }

    #[test]
    fn test_duplicate_participant_is_fatal() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.path().join("user_data/user7")).unwrap();
        let mut session = fixture.controller(7);

        let err = session.start().unwrap_err();

        assert!(matches!(err, SessionError::DuplicateParticipant(_)));
        assert!(session.device().sent.is_empty());
        assert_eq!(session.sensor().starts, 0);
    }

    #[test]
    fn test_advance_before_start_is_rejected() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(1);
        assert!(matches!(session.advance(), Err(SessionError::InvalidTransition(_))));
        assert!(matches!(
            session.submit_answer("1"),
            Err(SessionError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_end_before_start_has_no_side_effects() {
        let fixture = Fixture::new();
        let mut session = fixture.controller(1);
        assert!(session.end_session().unwrap().is_none());
        assert_eq!(session.phase(), SessionPhase::Ended);
        assert!(session.device().sent.is_empty());
        assert_eq!(session.sensor().stops, 0);
        assert!(matches!(session.start(), Err(SessionError::InvalidTransition(_))));
    }

    #[test]
    fn test_protocol_failure_is_fatal() {
        let fixture = Fixture::new();
        let link = RecordingLink {
            fail_on_receive: Some(2),
            ..RecordingLink::default()
        };
        let mut session = fixture.controller_with(8, link, None);
        session.start().unwrap();

        let err = session.advance().unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));

        session.abort();
        assert!(session.is_ended());
        assert_eq!(session.sensor().stops, 1);
        assert!(session.end_session().unwrap().is_none());
        assert_eq!(session.device().sent.iter().filter(|f| *f == "e").count(), 0);
    }
}
