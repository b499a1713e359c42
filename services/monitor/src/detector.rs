//! Occupancy classification by intensity difference against a reference frame.
//!
//! For every region the detector counts pixels whose luma difference from the
//! reference is above a fixed delta, and calls the region occupied when that
//! count is above a fixed fraction of the region. Classification is a pure
//! function of the frame, the regions and the reference.

use crate::capture::Frame;
use crate::config::DetectionConfig;
use crate::region_registry::{PixelRect, Region};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Per-region verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Occupancy {
    Empty,
    Occupied,
}

/// Region id to verdict, ordered by id.
pub type OccupancyMap = BTreeMap<String, Occupancy>;

/// Tunable classification constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// A pixel is changed when its luma difference is strictly above this
    pub pixel_threshold: u8,
    /// A region is occupied when its changed ratio is strictly above this
    pub occupied_ratio: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            pixel_threshold: 30,
            occupied_ratio: 0.05,
        }
    }
}

impl From<&DetectionConfig> for DetectionParams {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            pixel_threshold: config.pixel_threshold,
            occupied_ratio: config.occupied_ratio,
        }
    }
}

/// Whether a reference frame can be compared with a live frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceCheck {
    Absent,
    /// Dimensions differ, e.g. the source changed after the capture
    Stale {
        reference: (u32, u32),
        frame: (u32, u32),
    },
    Usable,
}

impl ReferenceCheck {
    pub fn of(frame: &Frame, reference: Option<&Frame>) -> Self {
        match reference {
            None => ReferenceCheck::Absent,
            Some(r) if r.dimensions() != frame.dimensions() => ReferenceCheck::Stale {
                reference: r.dimensions(),
                frame: frame.dimensions(),
            },
            Some(_) => ReferenceCheck::Usable,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OccupancyDetector {
    params: DetectionParams,
}

impl OccupancyDetector {
    pub fn new(params: DetectionParams) -> Self {
        Self { params }
    }

    /// Classify every region.
    ///
    /// Without a frame, a reference, or a reference matching the frame's
    /// dimensions, every region is reported empty.
    pub fn classify(
        &self,
        frame: Option<&Frame>,
        regions: &[Region],
        reference: Option<&Frame>,
    ) -> OccupancyMap {
        let all_empty = || {
            regions
                .iter()
                .map(|r| (r.id.clone(), Occupancy::Empty))
                .collect::<OccupancyMap>()
        };

        let (frame, reference) = match (frame, reference) {
            (Some(frame), Some(reference)) if !regions.is_empty() => (frame, reference),
            _ => return all_empty(),
        };

        if let ReferenceCheck::Stale {
            reference: (ref_w, ref_h),
            frame: (frame_w, frame_h),
        } = ReferenceCheck::of(frame, Some(reference))
        {
            warn!(
                reference = format!("{}x{}", ref_w, ref_h),
                frame = format!("{}x{}", frame_w, frame_h),
                "Reference frame is stale, reporting all regions empty"
            );
            return all_empty();
        }

        let (width, height) = frame.dimensions();
        regions
            .iter()
            .map(|region| {
                let verdict = match region.clamp_to(width, height) {
                    Some(rect) => {
                        let ratio = self.change_ratio(frame, reference, rect);
                        trace!(region = %region.id, ratio = ratio, "Region change ratio");
                        self.verdict(ratio)
                    }
                    None => Occupancy::Empty,
                };
                (region.id.clone(), verdict)
            })
            .collect()
    }

    /// Fraction of pixels in `rect` that changed beyond the pixel threshold.
    ///
    /// Both frames must contain `rect`.
    pub fn change_ratio(&self, frame: &Frame, reference: &Frame, rect: PixelRect) -> f64 {
        let total = rect.area();
        if total == 0 {
            return 0.0;
        }

        let mut changed = 0u64;
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                let a = frame.get_pixel(x, y).0;
                let b = reference.get_pixel(x, y).0;
                if luma_of_difference(a, b) > self.params.pixel_threshold {
                    changed += 1;
                }
            }
        }

        changed as f64 / total as f64
    }

    pub fn verdict(&self, ratio: f64) -> Occupancy {
        if ratio > self.params.occupied_ratio {
            Occupancy::Occupied
        } else {
            Occupancy::Empty
        }
    }
}

/// BT.601 luma of the per-channel absolute difference, in 14-bit fixed point.
fn luma_of_difference(a: [u8; 3], b: [u8; 3]) -> u8 {
    const R: u32 = 4899;
    const G: u32 = 9617;
    const B: u32 = 1868;

    let dr = a[0].abs_diff(b[0]) as u32;
    let dg = a[1].abs_diff(b[1]) as u32;
    let db = a[2].abs_diff(b[2]) as u32;

    ((dr * R + dg * G + db * B + (1 << 13)) >> 14) as u8
}
