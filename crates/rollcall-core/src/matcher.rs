//! Template gallery matching and the recognizer contract.
//!
//! Distance semantics follow the recognizer contract: lower = more confident.
//! The session compares the reported distance against its configured maximum.

use crate::extractor::{FeatureExtractor, RecognizerError};
use crate::types::{FaceCrop, FaceTemplate, Person};

/// Result of identifying a probe against the trained gallery.
#[derive(Debug, Clone)]
pub struct Identification {
    /// Label of the nearest template, `None` when the gallery is empty.
    pub label: Option<String>,
    /// Distance to the nearest template; `f32::INFINITY` for an empty gallery.
    pub distance: f32,
}

/// Flat set of (label, template) pairs the recognizer was trained on.
///
/// Every entry is compared on each probe — no early exit, so lookup cost does
/// not leak which label matched or where it sits in the gallery.
#[derive(Default)]
pub struct TemplateGallery {
    entries: Vec<(String, FaceTemplate)>,
}

impl TemplateGallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a gallery from registered persons, one entry per stored template.
    pub fn from_persons(persons: &[Person]) -> Self {
        let entries = persons
            .iter()
            .flat_map(|p| {
                p.templates
                    .iter()
                    .map(|t| (p.name.clone(), t.clone()))
            })
            .collect::<Vec<_>>();
        Self { entries }
    }

    /// Nearest entry to the probe by template distance.
    pub fn nearest(&self, probe: &FaceTemplate) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for (label, template) in &self.entries {
            let d = probe.distance(template);
            match best {
                Some((_, prev)) if d >= prev => {}
                _ => best = Some((label.as_str(), d)),
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Feature extraction plus nearest-template lookup.
pub struct Recognizer<E> {
    extractor: E,
    gallery: TemplateGallery,
}

impl<E: FeatureExtractor> Recognizer<E> {
    pub fn new(extractor: E) -> Self {
        Self {
            extractor,
            gallery: TemplateGallery::new(),
        }
    }

    /// Replace the gallery with templates from the given persons.
    pub fn train(&mut self, persons: &[Person]) {
        self.gallery = TemplateGallery::from_persons(persons);
        tracing::info!(
            templates = self.gallery.len(),
            persons = persons.len(),
            "recognizer trained"
        );
    }

    /// Extract a template from the crop and report the nearest gallery label.
    pub fn identify(&mut self, crop: &FaceCrop) -> Result<Identification, RecognizerError> {
        let probe = self.extractor.extract(crop)?;
        Ok(match self.gallery.nearest(&probe) {
            Some((label, distance)) => Identification {
                label: Some(label.to_string()),
                distance,
            },
            None => Identification {
                label: None,
                distance: f32::INFINITY,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn template(values: Vec<f32>) -> FaceTemplate {
        FaceTemplate { values, model_version: None }
    }

    fn person(name: &str, templates: Vec<FaceTemplate>) -> Person {
        Person {
            name: name.into(),
            templates,
            registered_at: NaiveDate::from_ymd_opt(2025, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn nearest_scans_whole_gallery() {
        // Best match is the last entry — full traversal required to find it.
        let gallery = TemplateGallery::from_persons(&[
            person("decoy", vec![template(vec![0.0, 1.0, 0.0])]),
            person("decoy2", vec![template(vec![0.0, 0.0, 1.0])]),
            person("match", vec![template(vec![1.0, 0.0, 0.0])]),
        ]);

        let probe = template(vec![1.0, 0.0, 0.0]);
        let (label, distance) = gallery.nearest(&probe).unwrap();
        assert_eq!(label, "match");
        assert!(distance.abs() < 1e-6);
    }

    #[test]
    fn nearest_on_empty_gallery_is_none() {
        let gallery = TemplateGallery::new();
        assert!(gallery.nearest(&template(vec![1.0])).is_none());
    }

    #[test]
    fn one_entry_per_stored_template() {
        let gallery = TemplateGallery::from_persons(&[person(
            "alice",
            vec![template(vec![1.0, 0.0]), template(vec![0.9, 0.1])],
        )]);
        assert_eq!(gallery.len(), 2);
    }

    struct FixedExtractor(Vec<f32>);

    impl FeatureExtractor for FixedExtractor {
        fn extract(&mut self, _crop: &FaceCrop) -> Result<FaceTemplate, RecognizerError> {
            Ok(template(self.0.clone()))
        }
    }

    fn crop() -> FaceCrop {
        FaceCrop { data: vec![0u8; 4], width: 2, height: 2 }
    }

    #[test]
    fn identify_reports_nearest_label_and_distance() {
        let mut rec = Recognizer::new(FixedExtractor(vec![1.0, 0.0]));
        rec.train(&[
            person("alice", vec![template(vec![1.0, 0.0])]),
            person("bob", vec![template(vec![0.0, 1.0])]),
        ]);

        let id = rec.identify(&crop()).unwrap();
        assert_eq!(id.label.as_deref(), Some("alice"));
        assert!(id.distance.abs() < 1e-6);
    }

    #[test]
    fn identify_with_empty_gallery_is_unknown() {
        let mut rec = Recognizer::new(FixedExtractor(vec![1.0, 0.0]));
        let id = rec.identify(&crop()).unwrap();
        assert!(id.label.is_none());
        assert!(id.distance.is_infinite());
    }
}
