//! Face detection via ONNX Runtime.
//!
//! The session treats detection as an external collaborator; this module
//! provides the [`FaceDetector`] trait plus an anchor-free, three-stride
//! detector implementation (SCRFD family, score + box heads only — the
//! downstream extractor consumes plain crops, so no landmark head is needed).

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::types::BoundingBox;

const DET_INPUT_SIZE: usize = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DET_NMS_THRESHOLD: f32 = 0.4;
const DET_STRIDES: [usize; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in a grayscale frame. Boxes come back sorted by confidence,
/// highest first.
pub trait FaceDetector {
    fn detect(&mut self, frame: &[u8], width: u32, height: u32)
        -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Coordinate de-mapping info for the letterbox resize.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Anchor-free ONNX face detector.
///
/// Expects six output tensors in positional order:
/// `[scores 8/16/32, boxes 8/16/32]`.
pub struct OnnxFaceDetector {
    session: Session,
}

impl OnnxFaceDetector {
    /// Load the detection model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        if num_outputs < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "detection model requires 6 outputs (3 strides x score/box), got {num_outputs}"
            )));
        }

        tracing::info!(path = model_path, outputs = num_outputs, "loaded detection model");

        Ok(Self { session })
    }

    /// Letterbox a grayscale frame into the square model input and build the
    /// NCHW tensor, replicating the channel into R, G, B. Padding uses the
    /// model mean, which normalizes to 0.
    fn preprocess(frame: &[u8], width: u32, height: u32) -> (Array4<f32>, Letterbox) {
        let target = DET_INPUT_SIZE as u32;
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).max(1);
        let new_h = ((height as f32 * scale).round() as u32).max(1);
        let pad_x = (target - new_w) as f32 / 2.0;
        let pad_y = (target - new_h) as f32 / 2.0;

        let pixels = (width * height) as usize;
        let data = if frame.len() >= pixels {
            frame[..pixels].to_vec()
        } else {
            vec![0u8; pixels]
        };
        let img = GrayImage::from_raw(width, height, data)
            .unwrap_or_else(|| GrayImage::new(1, 1));
        let resized = imageops::resize(&img, new_w, new_h, FilterType::Triangle);

        let x_off = pad_x.floor() as u32;
        let y_off = pad_y.floor() as u32;

        let mut tensor =
            Array4::<f32>::from_elem((1, 3, DET_INPUT_SIZE, DET_INPUT_SIZE), 0.0);
        for y in 0..DET_INPUT_SIZE as u32 {
            for x in 0..DET_INPUT_SIZE as u32 {
                let inside = y >= y_off && y < y_off + new_h && x >= x_off && x < x_off + new_w;
                let pixel = if inside {
                    resized.get_pixel(x - x_off, y - y_off).0[0] as f32
                } else {
                    DET_MEAN
                };
                let normalized = (pixel - DET_MEAN) / DET_STD;
                let (yi, xi) = (y as usize, x as usize);
                tensor[[0, 0, yi, xi]] = normalized;
                tensor[[0, 1, yi, xi]] = normalized;
                tensor[[0, 2, yi, xi]] = normalized;
            }
        }

        (tensor, Letterbox { scale, pad_x, pad_y })
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = Self::preprocess(frame, width, height);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in DET_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[pos]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[pos + DET_STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                boxes,
                stride,
                &letterbox,
                DET_CONFIDENCE_THRESHOLD,
            ));
        }

        let mut kept = nms(candidates, DET_NMS_THRESHOLD);
        kept.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(kept)
    }
}

/// Decode one stride level: each grid cell carries [`DET_ANCHORS_PER_CELL`]
/// anchors whose box head holds distances (left, top, right, bottom) from the
/// cell center, in stride units.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = DET_INPUT_SIZE / stride;
    let num_anchors = grid * grid * DET_ANCHORS_PER_CELL;
    let mut out = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / DET_ANCHORS_PER_CELL;
        let center_x = (cell % grid) as f32 * stride as f32;
        let center_y = (cell / grid) as f32 * stride as f32;

        let off = idx * 4;
        let Some(dists) = boxes.get(off..off + 4) else {
            continue;
        };
        let x1 = center_x - dists[0] * stride as f32;
        let y1 = center_y - dists[1] * stride as f32;
        let x2 = center_x + dists[2] * stride as f32;
        let y2 = center_y + dists[3] * stride as f32;

        // Map from letterboxed space back to frame space.
        let fx1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let fy1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let fx2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let fy2 = (y2 - letterbox.pad_y) / letterbox.scale;

        out.push(BoundingBox {
            x: fx1,
            y: fy1,
            width: fx2 - fx1,
            height: fy2 - fy1,
            confidence: score,
        });
    }

    out
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Non-maximum suppression, keeping the highest-confidence box per cluster.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf }
    }

    #[test]
    fn iou_identical_boxes() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint_boxes() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // intersection 50, union 150
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn nms_suppresses_overlapping_lower_confidence() {
        let dets = vec![
            bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            bbox(1.0, 1.0, 10.0, 10.0, 0.8), // overlaps the first heavily
            bbox(100.0, 100.0, 10.0, 10.0, 0.7),
        ];
        let kept = nms(dets, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_everything_below_threshold() {
        let dets = vec![
            bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            bbox(50.0, 50.0, 10.0, 10.0, 0.8),
        ];
        assert_eq!(nms(dets, 0.4).len(), 2);
    }

    #[test]
    fn decode_stride_maps_back_to_frame_space() {
        // One confident anchor at cell (1, 1) of stride 32, everything else zero.
        let grid = DET_INPUT_SIZE / 32;
        let num_anchors = grid * grid * DET_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; num_anchors];
        let mut boxes = vec![0.0f32; num_anchors * 4];

        let cell = grid + 1; // row 1, col 1
        let idx = cell * DET_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        // 1 stride-unit in each direction → 64px square centered on (32, 32)
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        // Identity letterbox: frame already 640x640
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(&scores, &boxes, 32, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 0.0).abs() < 1e-3);
        assert!((d.y - 0.0).abs() < 1e-3);
        assert!((d.width - 64.0).abs() < 1e-3);
        assert!((d.height - 64.0).abs() < 1e-3);
    }

    #[test]
    fn decode_stride_respects_threshold() {
        let grid = DET_INPUT_SIZE / 32;
        let num_anchors = grid * grid * DET_ANCHORS_PER_CELL;
        let scores = vec![0.3f32; num_anchors];
        let boxes = vec![1.0f32; num_anchors * 4];
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &boxes, 32, &lb, 0.5).is_empty());
    }

    #[test]
    fn preprocess_shape_and_padding() {
        // Wide frame: letterbox pads top and bottom with the mean (→ 0.0).
        let (tensor, lb) = OnnxFaceDetector::preprocess(&vec![200u8; 640 * 320], 640, 320);
        assert_eq!(tensor.shape(), &[1, 3, DET_INPUT_SIZE, DET_INPUT_SIZE]);
        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert!((lb.pad_y - 160.0).abs() < 1e-6);
        // Top padding row normalizes to zero.
        assert!(tensor[[0, 0, 0, 0]].abs() < 1e-6);
        // Center row holds real pixels.
        let center = tensor[[0, 0, 320, 320]];
        let expected = (200.0 - DET_MEAN) / DET_STD;
        assert!((center - expected).abs() < 1e-3);
    }
}
