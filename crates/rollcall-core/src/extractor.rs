//! Face feature extraction via ONNX Runtime.
//!
//! Produces 512-dimensional L2-normalized templates from grayscale face
//! crops using an ArcFace-family embedding model. The original system fed
//! the recognizer padded detector crops resized to a fixed square, and this
//! extractor does the same — no landmark alignment stage.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::types::{FaceCrop, FaceTemplate};

const EMBED_INPUT_SIZE: usize = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
const EMBED_DIM: usize = 512;
const EMBED_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face crop is empty or inconsistent with its dimensions")]
    BadCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face crop into a [`FaceTemplate`].
///
/// Implemented by [`OnnxExtractor`] in production; tests substitute fixtures.
pub trait FeatureExtractor {
    fn extract(&mut self, crop: &FaceCrop) -> Result<FaceTemplate, RecognizerError>;
}

/// ArcFace embedding extractor backed by an ONNX session.
pub struct OnnxExtractor {
    session: Session,
}

impl OnnxExtractor {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded embedding model");

        Ok(Self { session })
    }

    /// Resize a crop to the model input square and build an NCHW tensor,
    /// replicating the grayscale channel into R, G, and B.
    fn preprocess(crop: &FaceCrop) -> Result<Array4<f32>, RecognizerError> {
        let expected = (crop.width * crop.height) as usize;
        if expected == 0 || crop.data.len() < expected {
            return Err(RecognizerError::BadCrop);
        }

        let img = GrayImage::from_raw(crop.width, crop.height, crop.data[..expected].to_vec())
            .ok_or(RecognizerError::BadCrop)?;
        let resized = imageops::resize(
            &img,
            EMBED_INPUT_SIZE as u32,
            EMBED_INPUT_SIZE as u32,
            FilterType::Triangle,
        );

        let size = EMBED_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let pixel = resized.get_pixel(x as u32, y as u32).0[0] as f32;
                let normalized = (pixel - EMBED_MEAN) / EMBED_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }
        Ok(tensor)
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn extract(&mut self, crop: &FaceCrop) -> Result<FaceTemplate, RecognizerError> {
        let input = Self::preprocess(crop)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != EMBED_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBED_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize so template distance is comparable across captures.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(FaceTemplate {
            values,
            model_version: Some(EMBED_MODEL_VERSION.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_crop(value: u8, w: u32, h: u32) -> FaceCrop {
        FaceCrop {
            data: vec![value; (w * h) as usize],
            width: w,
            height: h,
        }
    }

    #[test]
    fn preprocess_output_shape() {
        let tensor = OnnxExtractor::preprocess(&uniform_crop(128, 64, 80)).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE]);
    }

    #[test]
    fn preprocess_normalization() {
        let tensor = OnnxExtractor::preprocess(&uniform_crop(128, 112, 112)).unwrap();
        let expected = (128.0 - EMBED_MEAN) / EMBED_STD;
        let val = tensor[[0, 0, 0, 0]];
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn preprocess_replicates_channels() {
        let tensor = OnnxExtractor::preprocess(&uniform_crop(100, 50, 50)).unwrap();
        for y in 0..EMBED_INPUT_SIZE {
            for x in 0..EMBED_INPUT_SIZE {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn preprocess_rejects_inconsistent_crop() {
        let crop = FaceCrop { data: vec![0u8; 10], width: 50, height: 50 };
        assert!(matches!(
            OnnxExtractor::preprocess(&crop),
            Err(RecognizerError::BadCrop)
        ));
    }

    #[test]
    fn preprocess_rejects_empty_crop() {
        let crop = FaceCrop { data: vec![], width: 0, height: 0 };
        assert!(matches!(
            OnnxExtractor::preprocess(&crop),
            Err(RecognizerError::BadCrop)
        ));
    }
}
