use crate::config::ConfigError;
use crate::corpus::SeedCorpus;
use crate::frame::{Frame, FrameError, IdWidth, MAX_PAYLOAD_LEN};
use crate::mutator::{
    BitFlipMutator, ByteNudgeMutator, ByteSubstitutionMutator, IdNibbleMutator,
    LengthJitterMutator, Mutator,
};
use log::{debug, trace, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Largest payload space the `exhaustive` pattern is allowed to enumerate per ID.
pub const EXHAUSTIVE_SPACE_LIMIT: u64 = 1 << 16;

/// A frame proposed for transmission, together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub frame: Frame,
    /// Name of the strategy that produced the frame.
    pub strategy: &'static str,
    /// Zero-based position in the generator's output sequence.
    pub generation_index: u64,
    /// Index of the seed corpus entry this frame was derived from, if any.
    pub parent: Option<usize>,
}

/// A `Generator` decides which frame is sent next.
///
/// Implementations own all of their state, including their random number
/// generator, so that two generators built from the same configuration and
/// seed produce the same candidate sequence.
pub trait Generator: Send {
    fn name(&self) -> &'static str;

    /// Produces the next candidate, or `Ok(None)` once the strategy has
    /// covered its whole frame space.
    fn next_candidate(&mut self) -> Result<Option<Candidate>, FrameError>;

    /// Number of candidates still to come, `None` for unbounded strategies.
    fn remaining(&self) -> Option<u64>;

    /// Rewinds to the first candidate of the sequence.
    fn reset(&mut self);
}

/// Inclusive range of arbitration IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdRange {
    pub start: u32,
    pub end: u32,
}

impl IdRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

/// The set of arbitration IDs a strategy draws from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSelection {
    Range(IdRange),
    /// Explicit IDs, kept sorted and free of duplicates.
    List(Vec<u32>),
}

impl IdSelection {
    pub fn list(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut ids: Vec<u32> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        IdSelection::List(ids)
    }

    pub fn len(&self) -> u64 {
        match self {
            IdSelection::Range(r) if r.end >= r.start => u64::from(r.end - r.start) + 1,
            IdSelection::Range(_) => 0,
            IdSelection::List(ids) => ids.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `index`-th ID in ascending order.
    pub fn nth(&self, index: u64) -> Option<u32> {
        if index >= self.len() {
            return None;
        }
        match self {
            IdSelection::Range(r) => Some(r.start + index as u32),
            IdSelection::List(ids) => ids.get(index as usize).copied(),
        }
    }

    fn random_id(&self, rng: &mut impl Rng) -> Option<u32> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        self.nth(rng.random_range(0..len))
    }

    /// Checks that the selection is non-empty and fits `width`.
    pub fn validate(&self, width: IdWidth) -> Result<(), ConfigError> {
        if let IdSelection::Range(r) = self {
            if r.start > r.end {
                return Err(ConfigError::EmptyIdRange {
                    start: r.start,
                    end: r.end,
                });
            }
        }
        if self.is_empty() {
            return Err(ConfigError::EmptyIdList);
        }
        if let Some(highest) = self.nth(self.len() - 1) {
            if highest > width.max_id() {
                return Err(ConfigError::IdBeyondWidth { id: highest, width });
            }
        }
        Ok(())
    }
}

/// Inclusive bounds on payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LengthBounds {
    pub min: usize,
    pub max: usize,
}

impl LengthBounds {
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn fixed(len: usize) -> Self {
        Self { min: len, max: len }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max > MAX_PAYLOAD_LEN {
            return Err(ConfigError::PayloadLengthOutOfBounds(self.max));
        }
        if self.min > self.max {
            return Err(ConfigError::InvertedLengthBounds {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

impl Default for LengthBounds {
    fn default() -> Self {
        Self {
            min: 0,
            max: MAX_PAYLOAD_LEN,
        }
    }
}

/// Payload families enumerated by the brute-force strategy, per ID, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadPattern {
    /// Every byte `0x00`.
    AllZero,
    /// Every byte `0xFF`.
    AllOne,
    /// A single set bit walking from the MSB of byte 0 to the LSB of the last byte.
    WalkingBit,
    /// Every payload of the configured length, counting up big-endian.
    Exhaustive,
    /// One literal payload, independent of the configured length.
    Fixed(Vec<u8>),
}

impl PayloadPattern {
    fn count(&self, len: usize) -> u64 {
        match self {
            PayloadPattern::AllZero | PayloadPattern::AllOne | PayloadPattern::Fixed(_) => 1,
            PayloadPattern::WalkingBit => len as u64 * 8,
            PayloadPattern::Exhaustive => 1u64 << (8 * len as u32),
        }
    }

    fn payload_at(&self, len: usize, step: u64) -> Vec<u8> {
        match self {
            PayloadPattern::AllZero => vec![0x00; len],
            PayloadPattern::AllOne => vec![0xFF; len],
            PayloadPattern::WalkingBit => {
                let mut payload = vec![0u8; len];
                let byte = (step / 8) as usize;
                payload[byte] = 0x80 >> (step % 8);
                payload
            }
            PayloadPattern::Exhaustive => (0..len)
                .map(|i| (step >> (8 * (len - 1 - i))) as u8)
                .collect(),
            PayloadPattern::Fixed(bytes) => bytes.clone(),
        }
    }
}

/// Draws IDs and payloads uniformly from a seeded ChaCha stream. Never exhausts.
pub struct RandomGenerator {
    ids: IdSelection,
    width: IdWidth,
    lengths: LengthBounds,
    fixed_payload: Option<Vec<u8>>,
    seed: u64,
    rng: ChaCha8Rng,
    generated: u64,
}

impl RandomGenerator {
    pub const NAME: &'static str = "random";

    pub fn new(
        ids: IdSelection,
        width: IdWidth,
        lengths: LengthBounds,
        fixed_payload: Option<Vec<u8>>,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        ids.validate(width)?;
        lengths.validate()?;
        if let Some(payload) = &fixed_payload {
            if payload.len() > MAX_PAYLOAD_LEN {
                return Err(ConfigError::PayloadLengthOutOfBounds(payload.len()));
            }
        }
        Ok(Self {
            ids,
            width,
            lengths,
            fixed_payload,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            generated: 0,
        })
    }
}

impl Generator for RandomGenerator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn next_candidate(&mut self) -> Result<Option<Candidate>, FrameError> {
        let Some(id) = self.ids.random_id(&mut self.rng) else {
            return Ok(None);
        };
        let payload = match &self.fixed_payload {
            Some(fixed) => fixed.clone(),
            None => {
                let len = self.rng.random_range(self.lengths.min..=self.lengths.max);
                (0..len).map(|_| self.rng.random::<u8>()).collect()
            }
        };
        let candidate = Candidate {
            frame: Frame::with_width(id, self.width, payload)?,
            strategy: Self::NAME,
            generation_index: self.generated,
            parent: None,
        };
        self.generated += 1;
        Ok(Some(candidate))
    }

    fn remaining(&self) -> Option<u64> {
        None
    }

    fn reset(&mut self) {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.generated = 0;
    }
}

/// Walks IDs in ascending order and, for every ID, each payload pattern in
/// turn. A payload produced by more than one pattern is sent once per ID.
/// Exhausts after the last payload of the last ID.
pub struct BruteForceGenerator {
    ids: IdSelection,
    width: IdWidth,
    payloads: Vec<Vec<u8>>,
    id_index: u64,
    payload_index: usize,
    generated: u64,
}

impl BruteForceGenerator {
    pub const NAME: &'static str = "brute";

    pub fn new(
        ids: IdSelection,
        width: IdWidth,
        payload_len: usize,
        patterns: Vec<PayloadPattern>,
    ) -> Result<Self, ConfigError> {
        ids.validate(width)?;
        LengthBounds::fixed(payload_len).validate()?;

        let mut usable = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match &pattern {
                PayloadPattern::Fixed(bytes) if bytes.len() > MAX_PAYLOAD_LEN => {
                    return Err(ConfigError::PayloadLengthOutOfBounds(bytes.len()));
                }
                PayloadPattern::Exhaustive if payload_len > 2 => {
                    warn!(
                        "Skipping exhaustive pattern: 256^{payload_len} payloads exceed the limit of {EXHAUSTIVE_SPACE_LIMIT}"
                    );
                }
                _ => usable.push(pattern),
            }
        }

        let mut seen = HashSet::new();
        let mut payloads = Vec::new();
        for pattern in &usable {
            for step in 0..pattern.count(payload_len) {
                let payload = pattern.payload_at(payload_len, step);
                if seen.insert(payload.clone()) {
                    payloads.push(payload);
                }
            }
        }
        if payloads.is_empty() {
            return Err(ConfigError::NoPayloadPatterns);
        }
        debug!(
            "Brute force schedule: {} distinct payloads per ID over {} IDs",
            payloads.len(),
            ids.len()
        );

        Ok(Self {
            ids,
            width,
            payloads,
            id_index: 0,
            payload_index: 0,
            generated: 0,
        })
    }
}

impl Generator for BruteForceGenerator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn next_candidate(&mut self) -> Result<Option<Candidate>, FrameError> {
        if self.payload_index >= self.payloads.len() {
            self.id_index += 1;
            self.payload_index = 0;
        }
        let Some(id) = self.ids.nth(self.id_index) else {
            return Ok(None);
        };
        let Some(payload) = self.payloads.get(self.payload_index) else {
            return Ok(None);
        };

        let candidate = Candidate {
            frame: Frame::with_width(id, self.width, payload.clone())?,
            strategy: Self::NAME,
            generation_index: self.generated,
            parent: None,
        };
        self.payload_index += 1;
        self.generated += 1;
        Ok(Some(candidate))
    }

    fn remaining(&self) -> Option<u64> {
        let total = self.ids.len().saturating_mul(self.payloads.len() as u64);
        Some(total.saturating_sub(self.generated))
    }

    fn reset(&mut self) {
        self.id_index = 0;
        self.payload_index = 0;
        self.generated = 0;
    }
}

/// Derives candidates from a seed corpus with bit-flip, byte-substitution and
/// length-jitter mutations. Never exhausts.
pub struct MutationGenerator {
    corpus: SeedCorpus,
    mutation_rate: f64,
    mutators: Vec<Box<dyn Mutator<ChaCha8Rng>>>,
    id_mutator: Option<IdNibbleMutator>,
    seed: u64,
    rng: ChaCha8Rng,
    generated: u64,
}

impl MutationGenerator {
    pub const NAME: &'static str = "mutation";

    /// `id_nibble_mask` enables arbitration-ID mutation of the masked nibbles.
    pub fn new(
        corpus: SeedCorpus,
        mutation_rate: f64,
        id_nibble_mask: Option<u8>,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        if corpus.is_empty() {
            return Err(ConfigError::EmptySeedCorpus);
        }
        if !(mutation_rate > 0.0 && mutation_rate <= 1.0) {
            return Err(ConfigError::InvalidMutationRate(mutation_rate));
        }
        Ok(Self {
            corpus,
            mutation_rate,
            mutators: vec![
                Box::new(BitFlipMutator),
                Box::new(ByteSubstitutionMutator),
                Box::new(ByteNudgeMutator),
                Box::new(LengthJitterMutator),
            ],
            id_mutator: id_nibble_mask.filter(|m| *m != 0).map(IdNibbleMutator::new),
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            generated: 0,
        })
    }
}

impl Generator for MutationGenerator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn next_candidate(&mut self) -> Result<Option<Candidate>, FrameError> {
        let Some((parent, seed_frame)) = self.corpus.random_select(&mut self.rng) else {
            return Ok(None);
        };
        let mut frame = seed_frame.clone();

        let mut applied = Vec::new();
        for mutator in self.mutators.iter_mut() {
            if self.rng.random_bool(self.mutation_rate) {
                frame = mutator.mutate(&frame, &mut self.rng)?;
                applied.push(mutator.name());
            }
        }
        if applied.is_empty() {
            let pick = self.rng.random_range(0..self.mutators.len());
            frame = self.mutators[pick].mutate(&frame, &mut self.rng)?;
            applied.push(self.mutators[pick].name());
        }
        if let Some(id_mutator) = self.id_mutator.as_mut() {
            if self.rng.random_bool(self.mutation_rate) {
                frame = id_mutator.mutate(&frame, &mut self.rng)?;
                applied.push(Mutator::<ChaCha8Rng>::name(&*id_mutator));
            }
        }
        trace!("Seed #{parent} -> {frame} via {}", applied.join(", "));

        let candidate = Candidate {
            frame,
            strategy: Self::NAME,
            generation_index: self.generated,
            parent: Some(parent),
        };
        self.generated += 1;
        Ok(Some(candidate))
    }

    fn remaining(&self) -> Option<u64> {
        None
    }

    fn reset(&mut self) {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.generated = 0;
    }
}

/// Sends the frames of a directive list once, in order.
pub struct ReplayGenerator {
    frames: SeedCorpus,
    cursor: usize,
}

impl ReplayGenerator {
    pub const NAME: &'static str = "replay";

    pub fn new(frames: SeedCorpus) -> Result<Self, ConfigError> {
        if frames.is_empty() {
            return Err(ConfigError::EmptySeedCorpus);
        }
        Ok(Self { frames, cursor: 0 })
    }
}

impl Generator for ReplayGenerator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn next_candidate(&mut self) -> Result<Option<Candidate>, FrameError> {
        let Some(frame) = self.frames.get(self.cursor) else {
            return Ok(None);
        };
        let candidate = Candidate {
            frame: frame.clone(),
            strategy: Self::NAME,
            generation_index: self.cursor as u64,
            parent: Some(self.cursor),
        };
        self.cursor += 1;
        Ok(Some(candidate))
    }

    fn remaining(&self) -> Option<u64> {
        Some((self.frames.len() - self.cursor) as u64)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}
