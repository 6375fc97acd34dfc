//! Ground-truth helpers on label maps
//!
//! Derives ground-truth boxes from an instance label map, matches ROIs to
//! instances and resizes masks between pixel and score map resolution.

use std::collections::BTreeMap;

use log::debug;
use ndarray::{s, Array2, ArrayView2, Zip};

use crate::roi::{GridBox, GtBox, Roi};

/// Ground-truth class and mask of one ROI.
#[derive(Debug, Clone)]
pub struct RoiLabel {
    /// Class of the matched instance, 0 when the ROI is background
    pub class_id: u32,
    /// Instance id the ROI was matched to
    pub instance_id: Option<i32>,
    /// Instance mask cropped to the ROI pixel bounds, all zero for background
    pub mask: Array2<u8>,
}

#[derive(Debug, Default)]
struct InstanceStats {
    x1: usize,
    y1: usize,
    x2: usize,
    y2: usize,
    area: usize,
    class_votes: BTreeMap<i32, usize>,
}

/// Collect bounding box, area and class votes of every instance id.
fn instance_stats(
    lbl_ins: ArrayView2<i32>,
    lbl_cls: ArrayView2<i32>,
    ignore: &[i32],
) -> BTreeMap<i32, InstanceStats> {
    let mut stats: BTreeMap<i32, InstanceStats> = BTreeMap::new();
    for ((y, x), &id) in lbl_ins.indexed_iter() {
        if ignore.contains(&id) {
            continue;
        }
        let entry = stats.entry(id).or_insert_with(|| InstanceStats {
            x1: x,
            y1: y,
            x2: x + 1,
            y2: y + 1,
            ..Default::default()
        });
        entry.x1 = entry.x1.min(x);
        entry.y1 = entry.y1.min(y);
        entry.x2 = entry.x2.max(x + 1);
        entry.y2 = entry.y2.max(y + 1);
        entry.area += 1;
        *entry.class_votes.entry(lbl_cls[[y, x]]).or_default() += 1;
    }
    stats
}

/// Majority class among the instance pixels, ties to the lower class id.
/// Negative (ignored) class labels never win.
fn majority_class(votes: &BTreeMap<i32, usize>) -> u32 {
    votes
        .iter()
        .filter(|&(&cls, _)| cls >= 0)
        .fold(None, |best: Option<(i32, usize)>, (&cls, &n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((cls, n)),
        })
        .map(|(cls, _)| cls as u32)
        .unwrap_or(0)
}

/// Derive one ground-truth box per instance id.
///
/// A box spans every pixel carrying the id, so disconnected regions of the
/// same id produce a single box. Ids listed in `ignore` are skipped. Boxes
/// are returned by ascending instance id.
pub fn label_to_bboxes(
    lbl_ins: ArrayView2<i32>,
    lbl_cls: ArrayView2<i32>,
    ignore: &[i32],
) -> Vec<GtBox> {
    assert_eq!(lbl_ins.dim(), lbl_cls.dim(), "Label map sizes must match");
    instance_stats(lbl_ins, lbl_cls, ignore)
        .into_iter()
        .map(|(id, st)| GtBox {
            roi: Roi::new(st.x1 as f32, st.y1 as f32, st.x2 as f32, st.y2 as f32),
            instance_id: id,
            class_id: majority_class(&st.class_votes),
        })
        .collect()
}

/// Label each ROI with the instance it covers best.
///
/// Coverage is the fraction of the instance's pixels inside the ROI. The
/// instance with the highest coverage wins, ties go to the higher box IoU
/// and then to the lower id. A ROI whose best coverage is below
/// `overlap_thresh` is background.
pub fn label_rois(
    rois: &[Roi],
    lbl_ins: ArrayView2<i32>,
    lbl_cls: ArrayView2<i32>,
    ignore_label: i32,
    overlap_thresh: f32,
) -> Vec<RoiLabel> {
    assert_eq!(lbl_ins.dim(), lbl_cls.dim(), "Label map sizes must match");
    let stats = instance_stats(lbl_ins, lbl_cls, &[ignore_label, 0]);

    rois.iter()
        .map(|roi| {
            let pb = roi.pixel_box();
            let crop = lbl_ins.slice(s![pb.y1..pb.y2, pb.x1..pb.x2]);

            let mut inside: BTreeMap<i32, usize> = BTreeMap::new();
            for &id in crop.iter() {
                if stats.contains_key(&id) {
                    *inside.entry(id).or_default() += 1;
                }
            }

            let mut best: Option<(i32, f32, f32)> = None;
            for (&id, &n) in &inside {
                let st = &stats[&id];
                let coverage = n as f32 / st.area as f32;
                let bbox = Roi::new(st.x1 as f32, st.y1 as f32, st.x2 as f32, st.y2 as f32);
                let iou = roi.iou(&bbox);
                let better = match best {
                    None => true,
                    Some((_, c, i)) => coverage > c || (coverage == c && iou > i),
                };
                if better {
                    best = Some((id, coverage, iou));
                }
            }

            match best {
                Some((id, coverage, _)) if coverage >= overlap_thresh => {
                    let class_id = majority_class(&stats[&id].class_votes);
                    debug!("roi {roi} -> instance {id} class {class_id} (coverage {coverage:.2})");
                    RoiLabel {
                        class_id,
                        instance_id: Some(id),
                        mask: crop.mapv(|v| u8::from(v == id)),
                    }
                }
                _ => RoiLabel {
                    class_id: 0,
                    instance_id: None,
                    mask: Array2::zeros((pb.height(), pb.width())),
                },
            }
        })
        .collect()
}

/// Nearest-neighbour resize of a 2D array.
///
/// Output cell `(y, x)` samples input cell `(y * in_h / out_h, x * in_w / out_w)`.
pub fn resize_nearest<T: Copy + Default>(src: ArrayView2<T>, size: (usize, usize)) -> Array2<T> {
    let (in_h, in_w) = src.dim();
    let (out_h, out_w) = size;
    if in_h == 0 || in_w == 0 {
        return Array2::from_elem(size, T::default());
    }
    Array2::from_shape_fn(size, |(y, x)| src[[y * in_h / out_h, x * in_w / out_w]])
}

/// Paste `mask` into `canvas` at `at`, keeping only cells where `mask` is set
/// and the canvas is still unassigned (zero). Returns the number of cells written.
pub fn paste_unassigned(
    canvas: &mut Array2<i32>,
    at: &GridBox,
    mask: ArrayView2<bool>,
    value: i32,
) -> usize {
    let mut written = 0;
    let mut region = canvas.slice_mut(s![at.y1..at.y2, at.x1..at.x2]);
    Zip::from(&mut region).and(mask).for_each(|c, &m| {
        if m && *c == 0 {
            *c = value;
            written += 1;
        }
    });
    written
}
