//! Haptic Rods Session - controller for haptic rod comparison experiments
//!
//! One run administers a fixed battery of rod-length problems to a single
//! participant while coordinating three actors: the remote haptic device (a
//! line protocol over a socket), a locally spawned eye-tracking sensor, and the
//! participant's response surface. When the battery ends, the sensor log is
//! sliced into one dataset per problem using the interaction intervals the
//! device recorded.
//!
//! ## Modules
//!
//! - **Sequencing**: [`session::SessionController`] state machine
//! - **Device**: [`device::DeviceLink`] protocol and TCP transport
//! - **Sensor**: [`sensor::SensorSupervisor`] process lifecycle
//! - **Answers**: [`rational::Rational`] parsing and [`answer::evaluate`]
//! - **Alignment**: [`align::SessionLogAligner`]

pub mod align;
pub mod answer;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod layout;
pub mod problem;
pub mod rational;
pub mod sensor;
pub mod session;

pub use align::{AlignmentError, AlignmentReport, InteractionInterval, SessionLogAligner};
pub use answer::{evaluate, AnswerOutcome};
pub use config::{RunCounter, SessionConfig};
pub use device::{Ack, DeviceLink, Frame, TcpDeviceLink};
pub use error::SessionError;
pub use problem::{Problem, ProblemSet, RodColor};
pub use rational::{ParseError, Rational};
pub use sensor::{SensorLogHandle, SensorProcess, SensorSupervisor};
pub use session::{SessionController, SessionPhase, SessionSettings};

/// Controller version recorded in reports
pub const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name recorded in reports
pub const PRODUCER_NAME: &str = "haptic-rods-session";
