use crate::frame::{Frame, FrameError, MAX_PAYLOAD_LEN};
use rand::Rng;

/// Byte values that tend to sit on ECU range checks and sign boundaries.
const INTERESTING_BYTES: [u8; 8] = [0x00, 0x01, 0x7E, 0x7F, 0x80, 0x81, 0xFE, 0xFF];

/// A `Mutator` derives a new frame from an existing one.
///
/// Mutators are the building blocks of the mutation strategy: the generator
/// picks a parent frame from the seed corpus and runs one or more mutators over
/// it. Every mutator must return a well-formed frame (ID within its addressing
/// width, at most eight payload bytes).
///
/// # Type Parameters
/// * `R`: The random number generator driving mutation decisions.
pub trait Mutator<R: Rng + ?Sized>: Send {
    /// Short identifier used in logs and candidate provenance.
    fn name(&self) -> &'static str;

    /// Produces a mutated copy of `frame`.
    fn mutate(&mut self, frame: &Frame, rng: &mut R) -> Result<Frame, FrameError>;
}

fn non_empty_payload(frame: &Frame) -> Vec<u8> {
    let mut payload = frame.payload().to_vec();
    if payload.is_empty() {
        payload.push(0);
    }
    payload
}

/// Flips a single random bit of the payload.
///
/// An empty payload is first grown to one zero byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct BitFlipMutator;

impl<R: Rng + ?Sized> Mutator<R> for BitFlipMutator {
    fn name(&self) -> &'static str {
        "bit-flip"
    }

    fn mutate(&mut self, frame: &Frame, rng: &mut R) -> Result<Frame, FrameError> {
        let mut payload = non_empty_payload(frame);
        let byte = rng.random_range(0..payload.len());
        let bit = rng.random_range(0..8u8);
        payload[byte] ^= 1 << bit;
        Frame::with_width(frame.id(), frame.width(), payload)
    }
}

/// Replaces one payload byte, either with a boundary value or a uniformly
/// random one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteSubstitutionMutator;

impl<R: Rng + ?Sized> Mutator<R> for ByteSubstitutionMutator {
    fn name(&self) -> &'static str {
        "byte-substitution"
    }

    fn mutate(&mut self, frame: &Frame, rng: &mut R) -> Result<Frame, FrameError> {
        let mut payload = non_empty_payload(frame);
        let index = rng.random_range(0..payload.len());
        payload[index] = if rng.random_bool(0.5) {
            INTERESTING_BYTES[rng.random_range(0..INTERESTING_BYTES.len())]
        } else {
            rng.random()
        };
        Frame::with_width(frame.id(), frame.width(), payload)
    }
}

/// Adds a small random value (1-15) to a single payload byte, with wrapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteNudgeMutator;

impl<R: Rng + ?Sized> Mutator<R> for ByteNudgeMutator {
    fn name(&self) -> &'static str {
        "byte-nudge"
    }

    fn mutate(&mut self, frame: &Frame, rng: &mut R) -> Result<Frame, FrameError> {
        let mut payload = non_empty_payload(frame);
        let delta = rng.random_range(1u8..=15u8);
        let index = rng.random_range(0..payload.len());
        payload[index] = payload[index].wrapping_add(delta);
        Frame::with_width(frame.id(), frame.width(), payload)
    }
}

/// Grows or shrinks the payload by one byte, staying within 0..=8.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthJitterMutator;

impl<R: Rng + ?Sized> Mutator<R> for LengthJitterMutator {
    fn name(&self) -> &'static str {
        "length-jitter"
    }

    fn mutate(&mut self, frame: &Frame, rng: &mut R) -> Result<Frame, FrameError> {
        let mut payload = frame.payload().to_vec();
        let grow = match payload.len() {
            0 => true,
            MAX_PAYLOAD_LEN => false,
            _ => rng.random_bool(0.5),
        };
        if grow {
            payload.push(rng.random());
        } else {
            payload.pop();
        }
        Frame::with_width(frame.id(), frame.width(), payload)
    }
}

/// Randomises selected hex nibbles of the arbitration ID.
///
/// Bit `n` of `nibble_mask` enables mutation of nibble `n`, counting from the
/// least significant nibble. The result is clamped to the frame's width.
#[derive(Debug, Clone, Copy)]
pub struct IdNibbleMutator {
    nibble_mask: u8,
}

impl IdNibbleMutator {
    pub fn new(nibble_mask: u8) -> Self {
        Self { nibble_mask }
    }
}

impl<R: Rng + ?Sized> Mutator<R> for IdNibbleMutator {
    fn name(&self) -> &'static str {
        "id-nibble"
    }

    fn mutate(&mut self, frame: &Frame, rng: &mut R) -> Result<Frame, FrameError> {
        let mut id = frame.id();
        for nibble in 0..8u32 {
            if self.nibble_mask & (1 << nibble) != 0 {
                let shift = nibble * 4;
                let value: u32 = rng.random_range(0..16);
                id = (id & !(0xF << shift)) | (value << shift);
            }
        }
        let width = frame.width();
        Frame::with_width(id & width.max_id(), width, frame.payload().to_vec())
    }
}
