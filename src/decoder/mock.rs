//! Deterministic decoder for tests and the command-line simulator.

use super::{Decoder, Hypothesis, PathElement, ResourceGroup, Traceback};
use crate::error::{PipelineError, Result};
use crate::pipeline::packet::{Observation, StreamTime};

/// Mock decoder that maps speech observations straight to words.
///
/// The first feature of a speech observation, rounded, indexes the active
/// group's vocabulary. Consecutive frames with the same index extend one word;
/// a silence frame or a different index closes it. Every word but the last is
/// settled.
#[derive(Debug, Clone)]
pub struct MockDecoder {
    feature_dim: usize,
    vocabulary: Vec<String>,
    path: Vec<PathElement>,
    /// Vocabulary index of the word the last frame extended, if still open.
    open: Option<usize>,
    next_id: u64,
    frames: u64,
    should_fail: bool,
}

impl MockDecoder {
    /// Create a new mock decoder expecting `feature_dim` features.
    pub fn new(feature_dim: usize) -> Self {
        Self {
            feature_dim,
            vocabulary: Vec::new(),
            path: Vec::new(),
            open: None,
            next_id: 0,
            frames: 0,
            should_fail: false,
        }
    }

    /// Configure the mock to fail on feed.
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Number of frames fed since the last `begin`.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn word_for(&self, index: usize) -> String {
        if self.vocabulary.is_empty() {
            format!("w{}", index)
        } else {
            self.vocabulary[index % self.vocabulary.len()].clone()
        }
    }

    fn push_word(&mut self, index: usize, time: StreamTime) {
        self.next_id += 1;
        let word = self.word_for(index);
        self.path.push(PathElement {
            id: self.next_id,
            word,
            start: time,
            end: time,
            confidence: 0.9,
            score: -1.0,
        });
        self.open = Some(index);
    }
}

impl Decoder for MockDecoder {
    fn name(&self) -> &str {
        "mock"
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn begin(&mut self, group: &ResourceGroup) -> Result<()> {
        self.vocabulary = group.dictionary.words.clone();
        self.path.clear();
        self.open = None;
        self.frames = 0;
        Ok(())
    }

    fn feed(&mut self, time: StreamTime, observation: &Observation) -> Result<()> {
        if self.should_fail {
            return Err(PipelineError::Decoder {
                message: "Mock decoder failure".to_string(),
            });
        }
        self.frames += 1;

        if !observation.speech {
            self.open = None;
            return Ok(());
        }
        let index = observation
            .features
            .first()
            .map(|f| f.round().max(0.0) as usize)
            .unwrap_or(0);

        match (self.open, self.path.last_mut()) {
            (Some(open), Some(last)) if open == index => {
                last.end = time;
                last.score -= 1.0;
            }
            _ => self.push_word(index, time),
        }
        Ok(())
    }

    fn traceback(&self) -> Traceback {
        match self.path.split_last() {
            Some((last, settled)) if self.open.is_some() => Traceback {
                settled: settled.to_vec(),
                tentative: vec![last.clone()],
            },
            _ => Traceback {
                settled: self.path.clone(),
                tentative: Vec::new(),
            },
        }
    }

    fn finish(&mut self, nbest: usize) -> Result<Vec<Hypothesis>> {
        self.open = None;
        let best = Hypothesis {
            score: self.path.iter().map(|e| e.score).sum(),
            elements: std::mem::take(&mut self.path),
        };
        if best.elements.is_empty() {
            return Ok(Vec::new());
        }

        let mut hypotheses = Vec::with_capacity(nbest.max(1));
        for rank in 1..nbest.max(1) {
            // Alternatives swap the final word for its vocabulary neighbours.
            let mut alt = best.clone();
            if let Some(last) = alt.elements.last_mut() {
                let index = self
                    .vocabulary
                    .iter()
                    .position(|w| *w == last.word)
                    .unwrap_or(0);
                last.word = self.word_for(index + rank);
                last.confidence *= 0.5;
            }
            alt.score -= rank as f64;
            hypotheses.push(alt);
        }
        hypotheses.insert(0, best);
        Ok(hypotheses)
    }
}
