//! Region of interest structures
//!
//! This module defines the boxes exchanged between the proposal collaborators,
//! the per-ROI engine and label reconstruction.

use std::fmt;

/// A rectangular region in image pixel coordinates.
///
/// Bounds are half-open: a ROI covers columns `x1..x2` and rows `y1..y2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Integer bounds of a ROI on some grid, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridBox {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

impl GridBox {
    pub fn height(&self) -> usize {
        self.y2.saturating_sub(self.y1)
    }

    pub fn width(&self) -> usize {
        self.x2.saturating_sub(self.x1)
    }

    /// True when the box is at least `size` cells in both directions
    pub fn fits(&self, size: usize) -> bool {
        self.height() >= size && self.width() >= size
    }
}

impl Roi {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// True when the ROI is ordered and lies inside a `height` x `width` image
    pub fn is_within(&self, height: usize, width: usize) -> bool {
        self.x1 >= 0.0
            && self.y1 >= 0.0
            && self.x1 <= self.x2
            && self.y1 <= self.y2
            && self.x2 <= width as f32
            && self.y2 <= height as f32
    }

    /// Pixel bounds, truncating toward zero.
    ///
    /// Only meaningful for ROIs that passed [`Roi::is_within`].
    pub fn pixel_box(&self) -> GridBox {
        GridBox {
            x1: self.x1 as usize,
            y1: self.y1 as usize,
            x2: self.x2 as usize,
            y2: self.y2 as usize,
        }
    }

    /// Bounds on the score map grid: coordinates divided by the stride and floored.
    pub fn feature_box(&self, feat_stride: usize) -> GridBox {
        let s = feat_stride as f32;
        GridBox {
            x1: (self.x1 / s) as usize,
            y1: (self.y1 / s) as usize,
            x2: (self.x2 / s) as usize,
            y2: (self.y2 / s) as usize,
        }
    }

    /// Intersection over union with another ROI
    pub fn iou(&self, other: &Roi) -> f32 {
        let iw = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let ih = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = iw * ih;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.1}, {:.1}, {:.1}, {:.1}]",
            self.x1, self.y1, self.x2, self.y2
        )
    }
}

/// A ROI tagged with the index of the image it belongs to in the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedRoi {
    pub batch_index: usize,
    pub roi: Roi,
}

impl IndexedRoi {
    pub fn new(batch_index: usize, roi: Roi) -> Self {
        Self { batch_index, roi }
    }
}

/// Ground-truth box derived from an instance label map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GtBox {
    pub roi: Roi,
    /// Instance id in the instance label map
    pub instance_id: i32,
    /// Semantic class of the instance
    pub class_id: u32,
}

/// Size of the image handed to the proposal collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageInfo {
    pub height: usize,
    pub width: usize,
    pub scale: f32,
}

impl ImageInfo {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            scale: 1.0,
        }
    }
}
