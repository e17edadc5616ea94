//! Wake-word scoring boundary.
//!
//! Neural scorers are external collaborators; anything producing a
//! per-model score map per PCM16 chunk can drive the capture loop.

use std::collections::HashMap;

use crate::utilities;

pub trait WakeWordScorer: Send {
    /// Score one capture chunk against every loaded model.
    fn score(&mut self, chunk: &[i16]) -> HashMap<String, f32>;
}

/// Energy-based fallback scorer: the normalized RMS of the chunk is the
/// score. Any audible sound wakes the system, which is the useful
/// behavior when no trained wake-word model is installed.
pub struct EnergyScorer {
    model_name: String,
}

impl EnergyScorer {
    pub fn new() -> EnergyScorer {
        EnergyScorer {
            model_name: "energy".to_owned(),
        }
    }
}

impl Default for EnergyScorer {
    fn default() -> Self {
        EnergyScorer::new()
    }
}

impl WakeWordScorer for EnergyScorer {
    fn score(&mut self, chunk: &[i16]) -> HashMap<String, f32> {
        HashMap::from([(self.model_name.clone(), utilities::normalized_rms(chunk))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_scorer_reports_silence_below_default_threshold() {
        let mut scorer = EnergyScorer::new();
        let scores = scorer.score(&[0; 2048]);
        assert_eq!(scores.len(), 1);
        assert!(scores["energy"] < 0.01);
    }

    #[test]
    fn energy_scorer_reports_loud_audio_above_default_threshold() {
        let mut scorer = EnergyScorer::new();
        let chunk: Vec<i16> = (0..2048)
            .map(|index| if index % 2 == 0 { 8000 } else { -8000 })
            .collect();
        let scores = scorer.score(&chunk);
        assert!(scores["energy"] >= 0.01);
    }
}
