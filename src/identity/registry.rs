//! Known-face descriptor registry and the classification boundary.
//!
//! Descriptor computation is an external collaborator behind the
//! `FaceEmbedder` trait. The registry itself is built once at startup and
//! never mutated afterwards; the classifier holds it by shared reference.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::*;

use super::UNKNOWN_IDENTITY;
use crate::error::KairaResult;
use crate::fabric::envelope::Frame;

/// Computes a face descriptor for the most prominent face in a frame,
/// if one is present.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, frame: &Frame) -> Option<Vec<f32>>;
}

/// Embedder used when no face model is installed; every frame classifies
/// as Unknown.
pub struct NullFaceEmbedder;

impl FaceEmbedder for NullFaceEmbedder {
    fn embed(&mut self, _frame: &Frame) -> Option<Vec<f32>> {
        None
    }
}

/// Immutable name -> descriptor table loaded once at startup.
pub struct DescriptorRegistry {
    entries: Vec<(String, Vec<f32>)>,
    match_threshold: f32,
}

impl DescriptorRegistry {
    pub fn empty(match_threshold: f32) -> DescriptorRegistry {
        DescriptorRegistry {
            entries: Vec::new(),
            match_threshold,
        }
    }

    /// Load a JSON file mapping person name to descriptor vector.
    pub fn load(path: &Path, match_threshold: f32) -> KairaResult<DescriptorRegistry> {
        let raw = fs::read(path)?;
        let table: BTreeMap<String, Vec<f32>> = serde_json::from_slice(&raw)?;
        let entries: Vec<(String, Vec<f32>)> = table.into_iter().collect();
        info!("Loaded {} known face descriptors", entries.len());
        Ok(DescriptorRegistry {
            entries,
            match_threshold,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closest registered identity within the acceptance threshold.
    pub fn best_match(&self, descriptor: &[f32]) -> Option<&str> {
        let mut best: Option<(&str, f32)> = None;
        for (name, stored) in &self.entries {
            let distance = euclidean_distance(stored, descriptor);
            if distance < self.match_threshold
                && best.map(|(_, closest)| distance < closest).unwrap_or(true)
            {
                best = Some((name, distance));
            }
        }
        best.map(|(name, _)| name)
    }
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Per-frame classifier: opaque embedding plus registry lookup.
pub struct RegistryClassifier {
    embedder: Box<dyn FaceEmbedder>,
    registry: Arc<DescriptorRegistry>,
}

impl RegistryClassifier {
    pub fn new(embedder: Box<dyn FaceEmbedder>, registry: Arc<DescriptorRegistry>) -> RegistryClassifier {
        RegistryClassifier { embedder, registry }
    }

    pub fn classify(&mut self, frame: &Frame) -> String {
        if self.registry.is_empty() {
            return UNKNOWN_IDENTITY.to_owned();
        }
        match self.embedder.embed(frame) {
            Some(descriptor) => self
                .registry
                .best_match(&descriptor)
                .map(str::to_owned)
                .unwrap_or_else(|| UNKNOWN_IDENTITY.to_owned()),
            None => UNKNOWN_IDENTITY.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DescriptorRegistry {
        DescriptorRegistry {
            entries: vec![
                ("Ada".to_owned(), vec![0.0, 0.0, 0.0]),
                ("Grace".to_owned(), vec![1.0, 1.0, 1.0]),
            ],
            match_threshold: 0.6,
        }
    }

    #[test]
    fn nearest_descriptor_within_threshold_matches() {
        let registry = registry();
        assert_eq!(registry.best_match(&[0.1, 0.0, 0.0]), Some("Ada"));
        assert_eq!(registry.best_match(&[0.9, 1.0, 1.0]), Some("Grace"));
    }

    #[test]
    fn distances_at_or_past_the_threshold_do_not_match() {
        let registry = registry();
        // exactly the threshold away: the comparison is strict
        assert_eq!(registry.best_match(&[0.6, 0.0, 0.0]), None);
        assert_eq!(registry.best_match(&[0.5, 0.5, 0.5]), None);
    }

    #[test]
    fn dimension_mismatch_never_matches() {
        let registry = registry();
        assert_eq!(registry.best_match(&[0.0, 0.0]), None);
    }

    #[test]
    fn classifier_falls_back_to_unknown() {
        let frame = Frame::rgb8(2, 2, vec![0; 12]);

        let mut without_model = RegistryClassifier::new(
            Box::new(NullFaceEmbedder),
            Arc::new(registry()),
        );
        assert_eq!(without_model.classify(&frame), UNKNOWN_IDENTITY);

        struct FixedEmbedder(Vec<f32>);
        impl FaceEmbedder for FixedEmbedder {
            fn embed(&mut self, _frame: &Frame) -> Option<Vec<f32>> {
                Some(self.0.clone())
            }
        }

        let mut with_model = RegistryClassifier::new(
            Box::new(FixedEmbedder(vec![0.0, 0.1, 0.0])),
            Arc::new(registry()),
        );
        assert_eq!(with_model.classify(&frame), "Ada");

        let mut empty_registry = RegistryClassifier::new(
            Box::new(FixedEmbedder(vec![0.0, 0.1, 0.0])),
            Arc::new(DescriptorRegistry::empty(0.6)),
        );
        assert_eq!(empty_registry.classify(&frame), UNKNOWN_IDENTITY);
    }
}
