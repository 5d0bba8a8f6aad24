//! In-memory CAN bus with simulated ECUs and fault injection.
//!
//! Time is simulated: `poll` never sleeps, it returns the next queued event or
//! reports a quiet bus straight away.

use crate::frame::Frame;
use crate::transport::{BusTransport, TransportError};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// A simulated ECU reacting to frames with a given arbitration ID.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct VirtualEcu {
    pub request_id: u32,
    /// Only payloads starting with these bytes trigger the ECU.
    #[serde(default)]
    pub trigger_prefix: Vec<u8>,
    #[serde(default)]
    pub response: Option<Frame>,
    /// Raise an error frame instead of (or after) responding.
    #[serde(default)]
    pub error_frame: bool,
}

impl VirtualEcu {
    pub fn responder(request_id: u32, response: Frame) -> Self {
        Self {
            request_id,
            trigger_prefix: Vec::new(),
            response: Some(response),
            error_frame: false,
        }
    }

    pub fn with_trigger_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.trigger_prefix = prefix.into();
        self
    }

    fn triggered_by(&self, frame: &Frame) -> bool {
        frame.id() == self.request_id && frame.payload().starts_with(&self.trigger_prefix)
    }
}

#[derive(Debug, Clone)]
enum RxEvent {
    Frame(Frame),
    ErrorFrame(String),
}

#[derive(Debug, Default)]
pub struct VirtualBus {
    ecus: Vec<VirtualEcu>,
    rx: VecDeque<RxEvent>,
    sent: Vec<Frame>,
    pending_send_failures: u32,
    sends_until_offline: Option<u64>,
    offline: Option<String>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ecus(ecus: impl IntoIterator<Item = VirtualEcu>) -> Self {
        Self {
            ecus: ecus.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn add_ecu(&mut self, ecu: VirtualEcu) -> &mut Self {
        self.ecus.push(ecu);
        self
    }

    /// Places a frame on the bus as if another node had sent it.
    pub fn inject(&mut self, frame: Frame) {
        self.rx.push_back(RxEvent::Frame(frame));
    }

    /// Makes the next `count` sends fail transiently.
    pub fn fail_next_sends(&mut self, count: u32) {
        self.pending_send_failures = count;
    }

    /// Takes the bus offline once `count` more frames have been sent.
    pub fn offline_after_sends(&mut self, count: u64) {
        self.sends_until_offline = Some(count);
    }

    pub fn go_offline(&mut self, reason: impl Into<String>) {
        self.offline = Some(reason.into());
    }

    /// Every frame successfully sent so far.
    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    fn check_online(&self) -> Result<(), TransportError> {
        match &self.offline {
            Some(reason) => Err(TransportError::Offline(reason.clone())),
            None => Ok(()),
        }
    }
}

impl BusTransport for VirtualBus {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.check_online()?;
        if self.sends_until_offline == Some(0) {
            self.go_offline("simulated bus-off");
            self.check_online()?;
        }
        if self.pending_send_failures > 0 {
            self.pending_send_failures -= 1;
            return Err(TransportError::Transient("simulated TX buffer full".to_string()));
        }

        trace!("virtual bus TX {frame}");
        self.sent.push(frame.clone());
        if let Some(remaining) = self.sends_until_offline.as_mut() {
            *remaining -= 1;
        }

        for ecu in self.ecus.iter().filter(|ecu| ecu.triggered_by(frame)) {
            if let Some(response) = &ecu.response {
                self.rx.push_back(RxEvent::Frame(response.clone()));
            }
            if ecu.error_frame {
                self.rx.push_back(RxEvent::ErrorFrame(format!(
                    "ECU 0x{:X} stuff error",
                    ecu.request_id
                )));
            }
        }
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Option<Frame>, TransportError> {
        match self.rx.pop_front() {
            Some(RxEvent::Frame(frame)) => Ok(Some(frame)),
            Some(RxEvent::ErrorFrame(desc)) => Err(TransportError::ErrorFrame(desc)),
            None => {
                self.check_online()?;
                Ok(None)
            }
        }
    }

    fn drain(&mut self) -> Result<Vec<Frame>, TransportError> {
        self.check_online()?;
        Ok(self
            .rx
            .drain(..)
            .filter_map(|event| match event {
                RxEvent::Frame(frame) => Some(frame),
                RxEvent::ErrorFrame(_) => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(directive: &str) -> Frame {
        Frame::parse_directive(directive).unwrap()
    }

    #[test]
    fn ecu_responds_only_to_matching_prefix() {
        let mut bus = VirtualBus::with_ecus([
            VirtualEcu::responder(0x7DF, frame("7E8#064100")).with_trigger_prefix(vec![0x02, 0x01]),
        ]);
        bus.send(&frame("7DF#0201")).unwrap();
        assert_eq!(bus.poll(Duration::ZERO).unwrap(), Some(frame("7E8#064100")));
        assert_eq!(bus.poll(Duration::ZERO).unwrap(), None);

        bus.send(&frame("7DF#0209")).unwrap();
        assert_eq!(bus.poll(Duration::ZERO).unwrap(), None);
        assert_eq!(bus.sent().len(), 2);
    }

    #[test]
    fn transient_failures_then_recovery() {
        let mut bus = VirtualBus::new();
        bus.fail_next_sends(2);
        assert!(matches!(
            bus.send(&frame("100#")),
            Err(TransportError::Transient(_))
        ));
        assert!(bus.send(&frame("100#")).is_err());
        assert!(bus.send(&frame("100#")).is_ok());
        assert_eq!(bus.sent().len(), 1);
    }

    #[test]
    fn goes_offline_after_configured_sends() {
        let mut bus = VirtualBus::new();
        bus.offline_after_sends(1);
        bus.send(&frame("100#")).unwrap();
        let err = bus.send(&frame("100#")).unwrap_err();
        assert!(err.is_fatal());
        assert!(bus.poll(Duration::ZERO).unwrap_err().is_fatal());
    }

    #[test]
    fn error_frames_surface_on_poll_but_not_drain() {
        let mut ecu = VirtualEcu::responder(0x123, frame("124#00"));
        ecu.error_frame = true;
        let mut bus = VirtualBus::with_ecus([ecu]);
        bus.send(&frame("123#")).unwrap();
        assert!(bus.poll(Duration::ZERO).unwrap().is_some());
        assert!(matches!(
            bus.poll(Duration::ZERO),
            Err(TransportError::ErrorFrame(_))
        ));

        bus.send(&frame("123#")).unwrap();
        assert_eq!(bus.drain().unwrap(), vec![frame("124#00")]);
    }
}
