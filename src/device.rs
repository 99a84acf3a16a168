//! Link to the remote haptic device
//!
//! The device speaks a newline-delimited text protocol over one persistent
//! socket. The controller sends three frames:
//! - `u<participant>` registers the participant (no reply is awaited)
//! - `n<index>` announces the active problem and waits for one reply
//! - `e` announces the end of the session and waits for one reply
//!
//! Replies are acknowledgment barriers only; their content is never read.
//! Receives block without a timeout: the device is trusted, co-located
//! hardware and a stalled device stalls the session.

use std::fmt;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::ExternalCommand;
use crate::error::SessionError;

/// Delay between launching the companion process and the single retry
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// A frame sent by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Register(u64),
    Notify(usize),
    End,
}

impl Frame {
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Register(participant) => write!(f, "u{}", participant),
            Frame::Notify(index) => write!(f, "n{}", index),
            Frame::End => f.write_str("e"),
        }
    }
}

/// The device processed the previous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// Blocking line transport to the device
pub trait DeviceLink {
    /// Write one frame followed by a newline
    fn send_line(&mut self, line: &str) -> Result<(), SessionError>;

    /// Block until one reply frame arrives
    fn receive_blocking(&mut self) -> Result<Ack, SessionError>;

    fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        debug!(frame = %frame, "-> device");
        self.send_line(&frame.encode())
    }

    /// Send a frame and wait for its acknowledgment
    fn request(&mut self, frame: Frame) -> Result<Ack, SessionError> {
        self.send_frame(frame)?;
        let ack = self.receive_blocking()?;
        debug!(frame = %frame, "<- device ack");
        Ok(ack)
    }
}

/// Starts the device-side application when the first connection is refused
pub trait CompanionLauncher {
    fn launch(&mut self) -> Result<(), SessionError>;
}

/// Companion launched from a configured command, without waiting for it
#[derive(Debug, Clone)]
pub struct CommandCompanion {
    command: ExternalCommand,
}

impl CommandCompanion {
    pub fn new(command: ExternalCommand) -> Self {
        Self { command }
    }
}

impl CompanionLauncher for CommandCompanion {
    fn launch(&mut self) -> Result<(), SessionError> {
        if self.command.is_empty() {
            warn!("no companion command configured; retrying without launching");
            return Ok(());
        }
        info!(argv = ?self.command.argv(), "launching device companion");
        // Detached: the companion outlives this handle.
        self.command.spawn()?;
        Ok(())
    }
}

/// Errors after which the device app is assumed not running yet
fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

/// Connect, launching the companion and retrying exactly once on refusal.
///
/// `connect` and `sleep` are injected so the retry policy can be exercised
/// without a network or a real delay.
pub fn connect_with_retry<L, C, S>(
    endpoint: &str,
    mut connect: C,
    companion: &mut dyn CompanionLauncher,
    settle_delay: Duration,
    mut sleep: S,
) -> Result<L, SessionError>
where
    C: FnMut(&str) -> io::Result<L>,
    S: FnMut(Duration),
{
    let connection_error = |source| SessionError::Connection {
        endpoint: endpoint.to_string(),
        source,
    };

    match connect(endpoint) {
        Ok(link) => Ok(link),
        Err(first) if is_retryable(&first) => {
            warn!(endpoint, error = %first, "device refused connection; launching companion");
            companion.launch()?;
            sleep(settle_delay);
            let link = connect(endpoint).map_err(connection_error)?;
            info!(endpoint, "connected to device on retry");
            Ok(link)
        }
        Err(first) => Err(connection_error(first)),
    }
}

/// Device link over a plain TCP socket
pub struct TcpDeviceLink {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpDeviceLink {
    /// Open a connection without any retry
    pub fn open(endpoint: &str) -> io::Result<Self> {
        let writer = TcpStream::connect(endpoint)?;
        writer.set_nodelay(true)?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self { writer, reader })
    }

    /// Open a connection with the single companion-launch retry
    pub fn connect(
        endpoint: &str,
        companion: &mut dyn CompanionLauncher,
        settle_delay: Duration,
    ) -> Result<Self, SessionError> {
        let link = connect_with_retry(endpoint, Self::open, companion, settle_delay, thread::sleep)?;
        info!(endpoint, "device link established");
        Ok(link)
    }
}

impl DeviceLink for TcpDeviceLink {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(SessionError::Protocol)
    }

    fn receive_blocking(&mut self) -> Result<Ack, SessionError> {
        let mut reply = String::new();
        let read = self
            .reader
            .read_line(&mut reply)
            .map_err(SessionError::Protocol)?;
        if read == 0 {
            return Err(SessionError::DeviceClosed(
                "waiting for an acknowledgment".to_string(),
            ));
        }
        Ok(Ack)
    }
}

/// In-memory link recording every frame, for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingLink {
    pub sent: Vec<String>,
    pub receives: usize,
    /// Fail the receive with this (1-based) ordinal
    pub fail_on_receive: Option<usize>,
}

#[cfg(test)]
impl DeviceLink for RecordingLink {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.sent.push(line.to_string());
        Ok(())
    }

    fn receive_blocking(&mut self) -> Result<Ack, SessionError> {
        self.receives += 1;
        if self.fail_on_receive == Some(self.receives) {
            return Err(SessionError::Protocol(io::Error::new(
                ErrorKind::ConnectionReset,
                "scripted failure",
            )));
        }
        Ok(Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use std::net::TcpListener;

    #[derive(Default)]
    struct CountingCompanion {
        launches: usize,
    }

    impl CompanionLauncher for CountingCompanion {
        fn launch(&mut self) -> Result<(), SessionError> {
            self.launches += 1;
            Ok(())
        }
    }

    #[test]
    fn test_frame_encoding() {
        assert_eq!(Frame::Register(7).encode(), "u7");
        assert_eq!(Frame::Notify(0).encode(), "n0");
        assert_eq!(Frame::Notify(9).encode(), "n9");
        assert_eq!(Frame::End.encode(), "e");
    }

    #[test]
    fn test_connect_first_try_does_not_sleep() {
        let mut companion = CountingCompanion::default();
        let mut sleeps = Vec::new();
        let link = connect_with_retry(
            "device:8080",
            |_| Ok::<_, io::Error>(42),
            &mut companion,
            DEFAULT_SETTLE_DELAY,
            |d| sleeps.push(d),
        )
        .unwrap();

        assert_eq!(link, 42);
        assert_eq!(companion.launches, 0);
        assert!(sleeps.is_empty());
    }

    #[test]
    fn test_refused_then_accepted_retries_once() {
        let mut companion = CountingCompanion::default();
        let mut sleeps = Vec::new();
        let mut attempts = 0;
        let link = connect_with_retry(
            "device:8080",
            |_| {
                attempts += 1;
                if attempts == 1 {
                    Err(io::Error::from(ErrorKind::ConnectionRefused))
                } else {
                    Ok("link")
                }
            },
            &mut companion,
            DEFAULT_SETTLE_DELAY,
            |d| sleeps.push(d),
        )
        .unwrap();

        assert_eq!(link, "link");
        assert_eq!(attempts, 2);
        assert_eq!(companion.launches, 1);
        assert_eq!(sleeps, vec![Duration::from_secs(2)]);
    }

    #[test]
    fn test_second_refusal_is_fatal() {
        let mut companion = CountingCompanion::default();
        let mut attempts = 0;
        let result: Result<(), _> = connect_with_retry(
            "device:8080",
            |_| {
                attempts += 1;
                Err(io::Error::from(ErrorKind::ConnectionRefused))
            },
            &mut companion,
            Duration::ZERO,
            |_| {},
        );

        assert!(matches!(result, Err(SessionError::Connection { .. })));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_non_connection_error_is_not_retried() {
        let mut companion = CountingCompanion::default();
        let mut attempts = 0;
        let result: Result<(), _> = connect_with_retry(
            "device:8080",
            |_| {
                attempts += 1;
                Err(io::Error::from(ErrorKind::InvalidInput))
            },
            &mut companion,
            Duration::ZERO,
            |_| {},
        );

        assert!(matches!(result, Err(SessionError::Connection { .. })));
        assert_eq!(attempts, 1);
        assert_eq!(companion.launches, 0);
    }

    #[test]
    fn test_tcp_link_request_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let device = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut received = Vec::new();
            for _ in 0..2 {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                received.push(line.trim_end().to_string());
                writer.write_all(b"loaded\n").unwrap();
            }
            received
        });

        let mut link = TcpDeviceLink::open(&endpoint).unwrap();
        assert_eq!(link.request(Frame::Notify(3)).unwrap(), Ack);
        assert_eq!(link.request(Frame::End).unwrap(), Ack);

        assert_eq!(device.join().unwrap(), vec!["n3", "e"]);
    }

    #[test]
    fn test_tcp_link_closed_by_device() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let device = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).unwrap();
        });

        let mut link = TcpDeviceLink::open(&endpoint).unwrap();
        link.send_frame(Frame::Notify(0)).unwrap();
        device.join().unwrap();

        assert!(matches!(
            link.receive_blocking(),
            Err(SessionError::DeviceClosed(_)) | Err(SessionError::Protocol(_))
        ));
    }
}
