//! Monitored regions and the reference ("empty lot") frame.

use crate::capture::Frame;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::info;

/// One parking slot, in frame-pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// A region clamped to concrete frame bounds. `x1`/`y1` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

impl Region {
    pub fn new(id: impl Into<String>, x: f64, y: f64, w: f64, h: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            w,
            h,
        }
    }

    /// Clamp to a `width` x `height` frame.
    ///
    /// Coordinates are truncated toward zero before clamping. Returns `None`
    /// when nothing of the region is left inside the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        let (x0, x1) = clamp_span(self.x, self.w, width);
        let (y0, y1) = clamp_span(self.y, self.h, height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(PixelRect { x0, y0, x1, y1 })
    }
}

fn clamp_span(start: f64, len: f64, limit: u32) -> (u32, u32) {
    let limit = limit as i64;
    // `as` saturates on overflow and maps NaN to 0
    let lo = (start.trunc() as i64).clamp(0, limit);
    let hi = ((start + len).trunc() as i64).clamp(0, limit);
    (lo as u32, hi as u32)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Int(n) => n.to_string(),
        Id::Float(n) => n.to_string(),
    })
}

/// Snapshot of the "empty" scene used as the comparison baseline.
#[derive(Debug, Clone)]
pub struct ReferenceFrame {
    pub image: Arc<Frame>,
    pub captured_at: DateTime<Utc>,
}

impl ReferenceFrame {
    pub fn new(image: Frame) -> Self {
        Self {
            image: Arc::new(image),
            captured_at: Utc::now(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Current region set and reference frame, replaced wholesale on update.
#[derive(Default)]
pub struct RegionRegistry {
    regions: RwLock<Arc<Vec<Region>>>,
    reference: RwLock<Option<ReferenceFrame>>,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole region set. Returns the new region count.
    pub fn replace_regions(&self, regions: Vec<Region>) -> usize {
        let count = regions.len();
        *self.regions.write() = Arc::new(regions);
        info!(slots = count, "Updated regions");
        count
    }

    pub fn regions(&self) -> Arc<Vec<Region>> {
        self.regions.read().clone()
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    pub fn set_reference(&self, frame: Frame) -> ReferenceFrame {
        let reference = ReferenceFrame::new(frame);
        let (width, height) = reference.dimensions();
        *self.reference.write() = Some(reference.clone());
        info!(width = width, height = height, "Reference frame captured");
        reference
    }

    /// Drop the reference frame, disabling detection until a new capture.
    pub fn clear_reference(&self) {
        if self.reference.write().take().is_some() {
            info!("Reference frame cleared");
        }
    }

    pub fn reference(&self) -> Option<ReferenceFrame> {
        self.reference.read().clone()
    }
}
