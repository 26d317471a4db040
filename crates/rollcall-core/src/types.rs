use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Date format used in durable records and the CSV export.
///
/// Reporting consumers parse this exact layout; changing it breaks them.
pub const DATE_FORMAT: &str = "%d-%m-%Y";

/// Time-of-day format used in durable records and the CSV export.
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Bounding box for a detected face in frame coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// A grayscale face crop cut out of a camera frame.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    /// Grayscale pixel data, row-major, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl FaceCrop {
    /// Cut a face region out of a grayscale frame, expanded by `padding`
    /// pixels on each side and clamped to the frame bounds.
    pub fn from_gray(frame: &[u8], frame_w: u32, frame_h: u32, bbox: &BoundingBox, padding: u32) -> Option<Self> {
        let pad = padding as f32;
        let x0 = (bbox.x - pad).max(0.0) as u32;
        let y0 = (bbox.y - pad).max(0.0) as u32;
        let x1 = ((bbox.x + bbox.width + pad) as u32).min(frame_w);
        let y1 = ((bbox.y + bbox.height + pad) as u32).min(frame_h);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let (w, h) = (x1 - x0, y1 - y0);
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in y0..y1 {
            let row_start = (y * frame_w + x0) as usize;
            let row_end = row_start + w as usize;
            data.extend_from_slice(frame.get(row_start..row_end)?);
        }

        Some(Self { data, width: w, height: h })
    }
}

/// Face feature vector produced by the extractor, L2-normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceTemplate {
    pub values: Vec<f32>,
    /// Model version that produced this template (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl FaceTemplate {
    /// Euclidean distance between two templates. Lower = more similar;
    /// for L2-normalized vectors the range is [0, 2].
    pub fn distance(&self, other: &FaceTemplate) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Serialize values as a little-endian f32 blob for storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.values.len() * 4);
        for v in &self.values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    /// Deserialize a little-endian f32 blob. Trailing partial words are ignored.
    pub fn from_le_bytes(blob: &[u8], model_version: Option<String>) -> Self {
        let values = blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self { values, model_version }
    }
}

/// A registered person with their captured face templates.
#[derive(Debug, Clone)]
pub struct Person {
    pub name: String,
    pub templates: Vec<FaceTemplate>,
    pub registered_at: NaiveDateTime,
}

/// On-time vs late classification for an accepted attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    OnTime,
    Late,
}

impl Status {
    /// Canonical text used in durable rows and the CSV export.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::OnTime => "On Time",
            Status::Late => "Late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "On Time" => Some(Status::OnTime),
            "Late" => Some(Status::Late),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per-frame recognition hit, before any policy is applied.
#[derive(Debug, Clone)]
pub struct AttendanceEvent {
    pub person_name: String,
    pub observed_at: NaiveDateTime,
    /// Recognizer distance; lower = more confident.
    pub distance: f32,
}

/// A durable attendance row. At most one exists per (person, date).
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub person_name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: Status,
}

impl AttendanceRecord {
    pub fn date_string(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    pub fn time_string(&self) -> String {
        self.time.format(TIME_FORMAT).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_distance_identical_is_zero() {
        let a = FaceTemplate { values: vec![1.0, 0.0, 0.0], model_version: None };
        let b = FaceTemplate { values: vec![1.0, 0.0, 0.0], model_version: None };
        assert!(a.distance(&b).abs() < 1e-6);
    }

    #[test]
    fn template_distance_orthogonal_unit_vectors() {
        let a = FaceTemplate { values: vec![1.0, 0.0], model_version: None };
        let b = FaceTemplate { values: vec![0.0, 1.0], model_version: None };
        assert!((a.distance(&b) - std::f32::consts::SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn template_blob_round_trip() {
        let t = FaceTemplate {
            values: vec![0.25, -1.5, 3.75],
            model_version: Some("w600k_r50".into()),
        };
        let blob = t.to_le_bytes();
        assert_eq!(blob.len(), 12);
        let back = FaceTemplate::from_le_bytes(&blob, t.model_version.clone());
        assert_eq!(back.values, t.values);
    }

    #[test]
    fn crop_clamps_to_frame_bounds() {
        // 4x4 frame, bbox near the corner with padding that would overflow
        let frame: Vec<u8> = (0..16).collect();
        let bbox = BoundingBox { x: 2.0, y: 2.0, width: 2.0, height: 2.0, confidence: 0.9 };
        let crop = FaceCrop::from_gray(&frame, 4, 4, &bbox, 10).unwrap();
        assert_eq!((crop.width, crop.height), (4, 4));
        assert_eq!(crop.data.len(), 16);
    }

    #[test]
    fn crop_extracts_expected_pixels() {
        // 4x2 frame: rows [0,1,2,3] and [4,5,6,7]
        let frame: Vec<u8> = (0..8).collect();
        let bbox = BoundingBox { x: 1.0, y: 0.0, width: 2.0, height: 2.0, confidence: 1.0 };
        let crop = FaceCrop::from_gray(&frame, 4, 2, &bbox, 0).unwrap();
        assert_eq!((crop.width, crop.height), (2, 2));
        assert_eq!(crop.data, vec![1, 2, 5, 6]);
    }

    #[test]
    fn crop_degenerate_box_is_none() {
        let frame = vec![0u8; 16];
        let bbox = BoundingBox { x: 10.0, y: 10.0, width: 2.0, height: 2.0, confidence: 1.0 };
        assert!(FaceCrop::from_gray(&frame, 4, 4, &bbox, 0).is_none());
    }

    #[test]
    fn status_text_round_trip() {
        assert_eq!(Status::parse("On Time"), Some(Status::OnTime));
        assert_eq!(Status::parse("Late"), Some(Status::Late));
        assert_eq!(Status::parse("late"), None);
        assert_eq!(Status::OnTime.to_string(), "On Time");
    }

    #[test]
    fn record_formats_match_export_layout() {
        let rec = AttendanceRecord {
            person_name: "Alice".into(),
            date: NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(),
            time: NaiveTime::from_hms_opt(8, 59, 0).unwrap(),
            status: Status::OnTime,
        };
        assert_eq!(rec.date_string(), "07-03-2025");
        assert_eq!(rec.time_string(), "08:59:00");
    }
}
