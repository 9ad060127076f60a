//! Box arithmetic: overlap, clipping, and mapping boxes from an augmented pass
//! back into original-image pixel space.

use crate::types::BoundingBox;

/// Intersection-over-Union with inclusive pixel counting.
///
/// Returns 0.0 for disjoint boxes and for a zero union.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_w = x2 - x1 + 1;
    let inter_h = y2 - y1 + 1;
    if inter_w <= 0 || inter_h <= 0 {
        return 0.0;
    }

    let inter_area = inter_w as f64 * inter_h as f64;
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        (inter_area / union_area) as f32
    } else {
        0.0
    }
}

/// Round float corners to pixels and clip them to `[0, width-1] × [0, height-1]`.
///
/// Returns `None` when the clipped box is degenerate.
pub fn clip_box(x1: f64, y1: f64, x2: f64, y2: f64, width: u32, height: u32) -> Option<BoundingBox> {
    if width == 0 || height == 0 {
        return None;
    }
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    let clip = |v: f64, max: f64| -> i32 {
        if v.is_nan() {
            0
        } else {
            v.round().clamp(0.0, max) as i32
        }
    };

    let bbox = BoundingBox::new(clip(x1, max_x), clip(y1, max_y), clip(x2, max_x), clip(y2, max_y));
    (!bbox.is_degenerate()).then_some(bbox)
}

/// Image dimensions as (width, height).
pub type Dims = (u32, u32);

/// The chain of transforms applied to produce one detection pass.
///
/// Forward order: original → resize-to-max-side (working) → pass scale → optional
/// horizontal flip. [`PassTransform::to_original`] undoes them in reverse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassTransform {
    pub original: Dims,
    pub working: Dims,
    pub pass: Dims,
    pub flipped: bool,
}

impl PassTransform {
    /// Map a box from pass-image coordinates into the original image, clipped.
    pub fn to_original(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> Option<BoundingBox> {
        let (mut x1, mut y1, mut x2, mut y2) = (x1 as f64, y1 as f64, x2 as f64, y2 as f64);

        if self.flipped {
            let w = self.pass.0 as f64;
            let (fx1, fx2) = (w - x2, w - x1);
            x1 = fx1;
            x2 = fx2;
        }

        if self.pass != self.working {
            let sx = self.working.0 as f64 / self.pass.0 as f64;
            let sy = self.working.1 as f64 / self.pass.1 as f64;
            x1 *= sx;
            x2 *= sx;
            y1 *= sy;
            y2 *= sy;
        }

        if self.working != self.original {
            let sx = self.original.0 as f64 / self.working.0 as f64;
            let sy = self.original.1 as f64 / self.working.1 as f64;
            x1 *= sx;
            x2 *= sx;
            y1 *= sy;
            y2 *= sy;
        }

        clip_box(x1, y1, x2, y2, self.original.0, self.original.1)
    }
}

/// Dimensions after scaling by `factor`, rounded, never below one pixel.
pub fn scaled_dims((w, h): Dims, factor: f64) -> Dims {
    let sw = (w as f64 * factor).round().max(1.0) as u32;
    let sh = (h as f64 * factor).round().max(1.0) as u32;
    (sw, sh)
}

/// Scale factor that brings the longer side down to `max_side`, or `None` if it already fits.
pub fn max_side_factor((w, h): Dims, max_side: u32) -> Option<f64> {
    let long_side = w.max(h);
    (long_side > max_side).then(|| max_side as f64 / long_side as f64)
}
