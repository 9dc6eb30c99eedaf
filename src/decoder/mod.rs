//! Boundary to the decoding engine.
//!
//! The search itself lives outside this crate. The recognizer stage only needs
//! to reset it per utterance, feed it observations, peek at the current best
//! path, and collect the final hypotheses.

pub mod mock;
pub mod resources;

pub use mock::MockDecoder;
pub use resources::{AcousticModel, Dictionary, ResourceContext, ResourceGroup};

use crate::error::Result;
use crate::pipeline::packet::{Observation, StreamTime};

/// One word on a decoding path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathElement {
    /// Unique per utterance; used to avoid emitting an element twice.
    pub id: u64,
    pub word: String,
    pub start: StreamTime,
    pub end: StreamTime,
    pub confidence: f32,
    pub score: f64,
}

/// Snapshot of the current best partial path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Traceback {
    /// Elements no future input can change.
    pub settled: Vec<PathElement>,
    /// Elements that may still be revised.
    pub tentative: Vec<PathElement>,
}

impl Traceback {
    pub fn is_empty(&self) -> bool {
        self.settled.is_empty() && self.tentative.is_empty()
    }

    /// Settled followed by tentative elements.
    pub fn elements(&self) -> impl Iterator<Item = &PathElement> {
        self.settled.iter().chain(self.tentative.iter())
    }
}

/// A complete decoding result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Hypothesis {
    pub elements: Vec<PathElement>,
    pub score: f64,
}

impl Hypothesis {
    /// Words separated by single spaces.
    pub fn sentence(&self) -> String {
        self.elements
            .iter()
            .map(|e| e.word.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Mean element confidence; 0 for an empty path.
    pub fn confidence(&self) -> f32 {
        if self.elements.is_empty() {
            return 0.0;
        }
        self.elements.iter().map(|e| e.confidence).sum::<f32>() / self.elements.len() as f32
    }
}

/// Trait for the decoding engine driven by the recognizer.
///
/// This trait allows swapping implementations (a real search vs a mock).
pub trait Decoder: Send {
    /// Get the name of the engine.
    fn name(&self) -> &str;

    /// Length of the feature vectors the engine expects.
    fn feature_dim(&self) -> usize;

    /// Resets the search for a new utterance using `group`.
    fn begin(&mut self, group: &ResourceGroup) -> Result<()>;

    /// Advances the search by one observation.
    fn feed(&mut self, time: StreamTime, observation: &Observation) -> Result<()>;

    /// Current best partial path.
    fn traceback(&self) -> Traceback;

    /// Ends the utterance and returns up to `nbest` hypotheses, best first.
    fn finish(&mut self, nbest: usize) -> Result<Vec<Hypothesis>>;
}

impl<T: Decoder + ?Sized> Decoder for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn feature_dim(&self) -> usize {
        (**self).feature_dim()
    }

    fn begin(&mut self, group: &ResourceGroup) -> Result<()> {
        (**self).begin(group)
    }

    fn feed(&mut self, time: StreamTime, observation: &Observation) -> Result<()> {
        (**self).feed(time, observation)
    }

    fn traceback(&self) -> Traceback {
        (**self).traceback()
    }

    fn finish(&mut self, nbest: usize) -> Result<Vec<Hypothesis>> {
        (**self).finish(nbest)
    }
}
