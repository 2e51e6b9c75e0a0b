//! Intersection-over-union for axis-aligned boxes.

use crate::BoundingBox;

/// IoU of two boxes, always in `[0, 1]`.
///
/// Degenerate or non-finite input yields `0.0`; this never panics.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f64 {
    if a.is_degenerate() || b.is_degenerate() {
        return 0.0;
    }

    let inter_w = a.x2.min(b.x2) - a.x1.max(b.x1);
    let inter_h = a.y2.min(b.y2) - a.y1.max(b.y1);
    if inter_w <= 0.0 || inter_h <= 0.0 {
        return 0.0;
    }
    let intersection = inter_w * inter_h;

    if a == b {
        return 1.0;
    }

    // Huge finite coordinates can overflow the areas to inf, and the
    // union to NaN.
    let union = a.area() + b.area() - intersection;
    if !(union > 0.0) || !union.is_finite() {
        return 0.0;
    }
    let ratio = intersection / union;
    if !ratio.is_finite() {
        return 0.0;
    }
    ratio.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x1: f64, y1: f64, x2: f64, y2: f64) -> BoundingBox {
        BoundingBox::from_corners(x1, y1, x2, y2)
    }

    #[test]
    fn identical_boxes_are_exactly_one() {
        let a = bx(0.1, 0.2, 0.7, 0.9);
        assert_eq!(iou(&a, &a), 1.0);
        let b = bx(13.0, 7.0, 113.0, 307.0);
        assert_eq!(iou(&b, &b), 1.0);
        let huge = bx(0.0, 0.0, 1e200, 1e200);
        assert_eq!(iou(&huge, &huge), 1.0);
    }

    #[test]
    fn disjoint_and_touching_boxes_are_zero() {
        assert_eq!(iou(&bx(0.0, 0.0, 1.0, 1.0), &bx(2.0, 2.0, 3.0, 3.0)), 0.0);
        // Shared edge has zero area.
        assert_eq!(iou(&bx(0.0, 0.0, 1.0, 1.0), &bx(1.0, 0.0, 2.0, 1.0)), 0.0);
    }

    #[test]
    fn half_overlap_is_one_third() {
        let a = bx(0.0, 0.0, 2.0, 1.0);
        let b = bx(1.0, 0.0, 3.0, 1.0);
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn symmetric_and_bounded() {
        let boxes = [
            bx(0.0, 0.0, 10.0, 10.0),
            bx(5.0, 5.0, 15.0, 15.0),
            bx(2.0, 3.0, 4.0, 9.0),
            bx(-3.0, -3.0, 1.0, 1.0),
            bx(0.0, 0.0, 0.0, 10.0),
            bx(0.0, 0.0, 1e200, 1e200),
            bx(0.0, 0.0, 1e200, 2e200),
            bx(-1e300, -1e300, 1e300, 1e300),
        ];
        for a in &boxes {
            for b in &boxes {
                let ab = iou(a, b);
                assert_eq!(ab, iou(b, a));
                assert!((0.0..=1.0).contains(&ab));
            }
        }
    }

    #[test]
    fn degenerate_input_is_zero_not_panic() {
        let good = bx(0.0, 0.0, 1.0, 1.0);
        assert_eq!(iou(&good, &bx(0.0, 0.0, 0.0, 1.0)), 0.0);
        assert_eq!(iou(&good, &bx(0.0, 1.0, 1.0, 0.0)), 0.0);
        assert_eq!(iou(&good, &bx(f64::NAN, 0.0, 1.0, 1.0)), 0.0);
        let flat = bx(0.5, 0.5, 0.5, 0.5);
        assert_eq!(iou(&flat, &flat), 0.0);
    }

    #[test]
    fn overflowing_areas_are_zero_not_nan() {
        let a = bx(0.0, 0.0, 1e200, 1e200);
        let b = bx(0.0, 0.0, 1e200, 2e200);
        assert_eq!(iou(&a, &b), 0.0);
    }
}
