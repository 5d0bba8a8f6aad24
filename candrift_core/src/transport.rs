use crate::frame::Frame;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`BusTransport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A single send or receive failed (arbitration lost, TX buffer full, ...).
    /// Worth retrying.
    #[error("Transient bus error: {0}")]
    Transient(String),

    /// The controller reported an error frame on the bus.
    #[error("Error frame on bus: {0}")]
    ErrorFrame(String),

    /// The bus or its controller is gone (bus-off, interface down, unplugged).
    #[error("Bus offline: {0}")]
    Offline(String),
}

impl TransportError {
    /// Whether the session must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Offline(_))
    }
}

/// Handle to a CAN bus, supplied by the host.
///
/// The fuzzing loop owns its transport exclusively for the whole session; two
/// sessions must never share one instance.
pub trait BusTransport: Send {
    /// Queues `frame` for transmission.
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Waits at most `timeout` for the next frame on the bus.
    ///
    /// `Ok(None)` means the bus stayed quiet for the whole timeout.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError>;

    /// Removes and returns every frame already buffered, without waiting.
    fn drain(&mut self) -> Result<Vec<Frame>, TransportError>;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        (**self).poll(timeout)
    }

    fn drain(&mut self) -> Result<Vec<Frame>, TransportError> {
        (**self).drain()
    }
}
