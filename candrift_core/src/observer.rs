use crate::frame::Frame;
use crate::generator::Candidate;
use crate::transport::{BusTransport, TransportError};
use log::{debug, trace};
use std::fmt;
use std::time::{Duration, Instant};

/// Pause after a transient receive error before polling again.
const TRANSIENT_POLL_BACKOFF: Duration = Duration::from_millis(1);

/// Bus-level problem observed while sending a candidate or listening after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusErrorKind {
    /// The frame could not be sent, even after retrying.
    SendFailed { attempts: u32, last_error: String },
    /// An error frame appeared during the quiet window.
    ErrorFrame(String),
}

impl fmt::Display for BusErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusErrorKind::SendFailed {
                attempts,
                last_error,
            } => write!(f, "send failed after {attempts} attempts: {last_error}"),
            BusErrorKind::ErrorFrame(desc) => write!(f, "error frame: {desc}"),
        }
    }
}

/// What happened on the bus after one candidate was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub candidate: Candidate,
    /// Every frame heard during the quiet window, in arrival order, unfiltered.
    pub responses: Vec<Frame>,
    pub bus_error: Option<BusErrorKind>,
    pub elapsed: Duration,
}

impl Observation {
    pub fn silent(candidate: Candidate) -> Self {
        Self {
            candidate,
            responses: Vec::new(),
            bus_error: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Frames and errors captured during one quiet window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowCapture {
    pub responses: Vec<Frame>,
    pub bus_error: Option<BusErrorKind>,
}

/// Listens to the bus for a bounded window after each transmission.
///
/// Each poll is given the time left in the window. A poll that comes back
/// empty means the bus was quiet for the rest of the window, which ends the
/// observation. The window never runs longer than configured, and at most
/// `max_responses` frames are kept so a flooding node cannot stall the loop.
#[derive(Debug, Clone, Copy)]
pub struct QuietWindowObserver {
    window: Duration,
    max_responses: usize,
}

impl QuietWindowObserver {
    pub fn new(window: Duration, max_responses: usize) -> Self {
        Self {
            window,
            max_responses: max_responses.max(1),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Collects bus traffic until the window closes.
    ///
    /// Only a fatal transport error (bus offline) is returned as `Err`.
    pub fn observe<T: BusTransport + ?Sized>(
        &self,
        transport: &mut T,
    ) -> Result<WindowCapture, TransportError> {
        let started = Instant::now();
        let mut capture = WindowCapture::default();

        while capture.responses.len() < self.max_responses {
            let Some(remaining) = self.window.checked_sub(started.elapsed()) else {
                break;
            };
            if remaining.is_zero() {
                break;
            }
            match transport.poll(remaining) {
                Ok(Some(frame)) => {
                    trace!("RX {frame}");
                    capture.responses.push(frame);
                }
                Ok(None) => break,
                Err(TransportError::ErrorFrame(desc)) => {
                    debug!("Error frame during quiet window: {desc}");
                    capture
                        .bus_error
                        .get_or_insert(BusErrorKind::ErrorFrame(desc));
                }
                Err(TransportError::Transient(e)) => {
                    debug!("Transient receive error during quiet window: {e}");
                    std::thread::sleep(TRANSIENT_POLL_BACKOFF.min(remaining));
                }
                Err(fatal @ TransportError::Offline(_)) => return Err(fatal),
            }
        }
        Ok(capture)
    }
}
