//! Fingertip detection and identity tracking over the foreground mask.
//!
//! Fingertips are curvature peaks: convex-hull extremities whose contour
//! neighbourhood stays inside an empirical angle envelope. Detected tips
//! are matched against short-lived tracking memory so a finger keeps its
//! identity while it moves.

use anyhow::Result;
use opencv::core::{Mat, Point, Point2f, Rect, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::helpers::signed_angle_between;

/// Contours below this area are noise.
const MIN_CONTOUR_AREA: f64 = 500.0;

/// Minimum accepted arc score for a candidate tip.
const ARC_MIN_SCORE: i32 = 50;
/// Maximum symmetric walk length of the arc test.
const ARC_TEST_LENGTH: i32 = 450;
/// Squared pixel distance binding consecutive hull points into a cluster.
const NONMAX_PROXIMITY: i64 = 500;
/// Contour offset of the two points averaged into the centre of mass.
const COM_OFFSET: i64 = 15;

/// Squared distance within which a candidate continues a tracked finger.
const MAX_TRACKING_RANGE: i64 = 75;
/// Frames an unmatched tracked finger survives.
const MAX_TRACKING_LIFE: i32 = 10;
/// Detection calls before a focused tracking region resets to the frame.
const FOCUS_RESET_TIME: i32 = 10;

/// A tracked fingertip in view coordinates.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fingertip {
    /// Contour point at the tip of the finger.
    pub point: Point,
    /// Mean of the two contour points at fixed offsets from the tip.
    pub com: Point,
    /// Consecutive frames this fingertip has been tracked.
    pub age: usize,
    /// Tracker-unique identity, never reused.
    pub id: u64,
}

/// Candidate tip found by the arc test, before identity assignment.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    tip: Point,
    com: Point,
}

pub struct FingerTracker {
    view_size: Size,
    tracking_region: Rect,
    tracking_reset_timer: i32,
    next_id: u64,
    candidates: Vec<Candidate>,
    tracking_memory: Vec<(Fingertip, i32)>,
}

impl FingerTracker {
    pub fn new(view_size: Size) -> Self {
        Self {
            view_size,
            tracking_region: Rect::new(0, 0, view_size.width, view_size.height),
            tracking_reset_timer: 0,
            next_id: 0,
            candidates: Vec::new(),
            tracking_memory: Vec::new(),
        }
    }

    /// Detects fingertips in the foreground mask and resolves their
    /// identities against the tracking memory.
    pub fn detect(&mut self, foreground_mask: &Mat) -> Result<Vec<Fingertip>> {
        // Fall back to the whole frame once the focus window expires.
        self.tracking_reset_timer -= 1;
        if self.tracking_reset_timer <= 0 {
            self.tracking_region =
                Rect::new(0, 0, foreground_mask.cols(), foreground_mask.rows());
        }

        // Contours are kept unapproximated; the arc test walks them
        // point by point.
        let mut contours: Vector<Vector<Point>> = Vector::new();
        imgproc::find_contours(
            &Mat::roi(foreground_mask, self.tracking_region)?,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_NONE,
            Point::new(self.tracking_region.x, self.tracking_region.y),
        )?;

        for contour in &contours {
            if imgproc::contour_area(&contour, false)? < MIN_CONTOUR_AREA {
                continue;
            }
            self.collect_candidates(&contour)?;
        }

        let fingertips = self.track();
        self.update_tracking_memory(&fingertips);
        Ok(fingertips)
    }

    /// Narrows detection to a square around `point` for the next
    /// [`FOCUS_RESET_TIME`] frames. Focusing stabilizes identity while a
    /// finger is actively driving the pointer.
    pub fn focus(&mut self, point: Point, size: Size) {
        let half_width = size.width / 2;
        let half_height = size.height / 2;

        let tl = Point::new((point.x - half_width).max(0), (point.y - half_height).max(0));
        let br = Point::new(
            (point.x + half_width).min(self.view_size.width - 1),
            (point.y + half_height).min(self.view_size.height - 1),
        );

        self.tracking_region = Rect::new(tl.x, tl.y, br.x - tl.x, br.y - tl.y);
        self.tracking_reset_timer = FOCUS_RESET_TIME;
    }

    /// Finds fingertip candidates on a single contour. Hull extremities
    /// are clustered by proximity and each cluster emits its best-scoring
    /// point.
    fn collect_candidates(&mut self, contour: &Vector<Point>) -> Result<()> {
        // Hull points are the extremities of the mask; a pointing finger
        // always sits at one.
        let mut extremities = Vector::<i32>::new();
        imgproc::convex_hull(contour, &mut extremities, false, false)?;
        if extremities.is_empty() {
            return Ok(());
        }

        let pts = contour.to_vec();
        let hull: Vec<usize> = extremities.iter().map(|i| i as usize).collect();

        // Start the walk at a hull point on the region edge so a cluster
        // is never split across the hull's wraparound.
        let offset = hull.iter().position(|&i| self.edge_test(pts[i])).unwrap_or(0);

        let mut last = pts[hull[offset % hull.len()]];
        let mut best: Option<usize> = None;
        let mut best_score = ARC_MIN_SCORE;

        for i in 0..hull.len() {
            let index = hull[(offset + i) % hull.len()];
            let score = self.arc_score(&pts, index);

            // A gap beyond the cluster radius closes the current cluster.
            let v = pts[index] - last;
            if i64::from(v.x) * i64::from(v.x) + i64::from(v.y) * i64::from(v.y)
                > NONMAX_PROXIMITY
            {
                self.emit_candidate(&pts, best.take());
                best_score = ARC_MIN_SCORE;
            }
            last = pts[index];

            if score > best_score {
                best_score = score;
                best = Some(index);
            }
        }

        // The final cluster is not followed by a gap; emit it explicitly.
        self.emit_candidate(&pts, best);
        Ok(())
    }

    fn emit_candidate(&mut self, pts: &[Point], best: Option<usize>) {
        let Some(best) = best else { return };

        let n = pts.len() as i64;
        let ahead = pts[((best as i64 + COM_OFFSET).rem_euclid(n)) as usize];
        let behind = pts[((best as i64 - COM_OFFSET).rem_euclid(n)) as usize];

        self.candidates.push(Candidate {
            tip: pts[best],
            com: Point::new((ahead.x + behind.x) / 2, (ahead.y + behind.y) / 2),
        });
    }

    /// Counts how many symmetric contour offsets from `index` stay inside
    /// the fingertip angle envelope. Points on the region edge cannot be
    /// arcs, and the walk ends where the contour leaves the region.
    fn arc_score(&self, pts: &[Point], index: usize) -> i32 {
        let reference = pts[index];
        if self.edge_test(reference) {
            return 0;
        }

        let n = pts.len() as i64;
        let mut score = 0;
        for k in 4..ARC_TEST_LENGTH + 4 {
            let prev = pts[(index as i64 - i64::from(k)).rem_euclid(n) as usize];
            let next = pts[(index as i64 + i64::from(k)).rem_euclid(n) as usize];

            if self.edge_test(prev) || self.edge_test(next) {
                break;
            }

            let angle = (360.0
                + signed_angle_between(
                    Point2f::new((next.x - reference.x) as f32, (next.y - reference.y) as f32),
                    Point2f::new((prev.x - reference.x) as f32, (prev.y - reference.y) as f32),
                ))
                % 360.0;

            if angle < arc_envelope_min(k) || angle > arc_envelope_max(k) {
                break;
            }
            score += 1;
        }

        score
    }

    /// Matches candidates against the tracking memory. Matched entries
    /// keep their identity and gain age; leftovers become new fingertips
    /// with a fresh id.
    fn track(&mut self) -> Vec<Fingertip> {
        let mut fingertips = Vec::new();

        let mut m = 0;
        while m < self.tracking_memory.len() {
            let (finger, _) = self.tracking_memory[m];

            let mut match_index = None;
            let mut closest_distance_sqr = MAX_TRACKING_RANGE * MAX_TRACKING_RANGE;
            for (c, candidate) in self.candidates.iter().enumerate() {
                let offset = finger.point - candidate.tip;
                let distance_sqr =
                    i64::from(offset.x) * i64::from(offset.x)
                        + i64::from(offset.y) * i64::from(offset.y);
                if distance_sqr < closest_distance_sqr {
                    closest_distance_sqr = distance_sqr;
                    match_index = Some(c);
                }
            }

            if let Some(c) = match_index {
                let candidate = self.candidates.swap_remove(c);
                fingertips.push(Fingertip {
                    point: candidate.tip,
                    com: candidate.com,
                    age: finger.age + 1,
                    id: finger.id,
                });
                self.tracking_memory.swap_remove(m);
            } else {
                m += 1;
            }
        }

        for candidate in self.candidates.drain(..) {
            fingertips.push(Fingertip {
                point: candidate.tip,
                com: candidate.com,
                age: 1,
                id: self.next_id,
            });
            self.next_id += 1;
        }

        fingertips
    }

    /// Ages out unmatched memory and re-inserts this frame's fingertips.
    fn update_tracking_memory(&mut self, fingertips: &[Fingertip]) {
        self.tracking_memory.retain_mut(|(_, life)| {
            *life -= 1;
            *life > 0
        });

        for &finger in fingertips {
            self.tracking_memory.push((finger, MAX_TRACKING_LIFE));
        }
    }

    fn edge_test(&self, pt: Point) -> bool {
        pt.x == self.tracking_region.x
            || pt.y == self.tracking_region.y
            || pt.x == self.tracking_region.x + self.tracking_region.width - 1
            || pt.y == self.tracking_region.y + self.tracking_region.height - 1
    }
}

/// Upper angle bound of the fingertip envelope at offset `k`.
fn arc_envelope_max(k: i32) -> f32 {
    let k = k as f32;
    if k < 40.0 {
        -0.05 * k * k + 175.0
    } else {
        -0.001 * k * k + 75.0
    }
}

/// Lower angle bound of the fingertip envelope, floored at 10 degrees.
fn arc_envelope_min(k: i32) -> f32 {
    let k = k as f32;
    (-0.1 * k * k + 50.0).max(10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{self, Scalar};

    fn candidate(x: i32, y: i32) -> Candidate {
        Candidate {
            tip: Point::new(x, y),
            com: Point::new(x, y + 20),
        }
    }

    #[test]
    fn envelope_switches_shape_at_forty() {
        assert!((arc_envelope_max(0) - 175.0).abs() < 1e-4);
        assert!((arc_envelope_max(39) - 98.95).abs() < 1e-2);
        assert!((arc_envelope_max(40) - 73.4).abs() < 1e-2);
        assert!((arc_envelope_min(0) - 50.0).abs() < 1e-4);
        assert_eq!(arc_envelope_min(20), 10.0);
        assert_eq!(arc_envelope_min(100), 10.0);
    }

    #[test]
    fn region_edge_points_score_zero() {
        let tracker = FingerTracker::new(Size::new(100, 100));
        let pts = vec![
            Point::new(0, 50),
            Point::new(10, 40),
            Point::new(20, 50),
            Point::new(10, 60),
        ];
        assert_eq!(tracker.arc_score(&pts, 0), 0);
    }

    #[test]
    fn identity_survives_small_displacement() {
        let mut tracker = FingerTracker::new(Size::new(640, 480));

        tracker.candidates.push(candidate(100, 100));
        let first = tracker.track();
        tracker.update_tracking_memory(&first);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, 0);
        assert_eq!(first[0].age, 1);

        // Moves 10 px: still the same finger.
        tracker.candidates.push(candidate(110, 100));
        let second = tracker.track();
        tracker.update_tracking_memory(&second);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, 0);
        assert_eq!(second[0].age, 2);
    }

    #[test]
    fn distant_candidate_gets_a_fresh_id() {
        let mut tracker = FingerTracker::new(Size::new(640, 480));

        tracker.candidates.push(candidate(100, 100));
        let first = tracker.track();
        tracker.update_tracking_memory(&first);

        tracker.candidates.push(candidate(300, 300));
        let second = tracker.track();
        tracker.update_tracking_memory(&second);

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, 1);
        assert_eq!(second[0].age, 1);

        // The lost finger is still remembered, one life down.
        let remembered = tracker
            .tracking_memory
            .iter()
            .find(|(f, _)| f.id == 0)
            .unwrap();
        assert_eq!(remembered.1, MAX_TRACKING_LIFE - 1);
    }

    #[test]
    fn candidate_com_averages_offset_contour_points() {
        let mut tracker = FingerTracker::new(Size::new(640, 480));

        // A synthetic closed contour of 60 points on a circle.
        let pts: Vec<Point> = (0..60)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::TAU / 60.0;
                Point::new(
                    100 + (40.0 * angle.cos()) as i32,
                    100 + (40.0 * angle.sin()) as i32,
                )
            })
            .collect();

        tracker.emit_candidate(&pts, Some(0));

        let candidate = tracker.candidates[0];
        assert_eq!(candidate.tip, pts[0]);
        let expected = Point::new(
            (pts[15].x + pts[45].x) / 2,
            (pts[15].y + pts[45].y) / 2,
        );
        assert_eq!(candidate.com, expected);
    }

    #[test]
    fn unmatched_memory_decays_to_nothing() {
        let mut tracker = FingerTracker::new(Size::new(640, 480));

        tracker.candidates.push(candidate(100, 100));
        let first = tracker.track();
        tracker.update_tracking_memory(&first);

        for _ in 0..MAX_TRACKING_LIFE {
            let none = tracker.track();
            assert!(none.is_empty());
            tracker.update_tracking_memory(&none);
        }

        assert!(tracker.tracking_memory.is_empty());
    }

    #[test]
    fn focus_clamps_to_the_view() {
        let mut tracker = FingerTracker::new(Size::new(640, 480));
        tracker.focus(Point::new(10, 10), Size::new(100, 100));

        assert_eq!(tracker.tracking_region.x, 0);
        assert_eq!(tracker.tracking_region.y, 0);
        assert_eq!(tracker.tracking_region.width, 60);
        assert_eq!(tracker.tracking_region.height, 60);
    }

    #[test]
    fn focus_resets_after_ten_detections() {
        let mut tracker = FingerTracker::new(Size::new(64, 64));
        tracker.focus(Point::new(32, 32), Size::new(16, 16));

        let empty = Mat::new_rows_cols_with_default(64, 64, core::CV_8UC1, Scalar::default())
            .unwrap();

        for _ in 0..FOCUS_RESET_TIME - 1 {
            tracker.detect(&empty).unwrap();
            assert_eq!(tracker.tracking_region.width, 16);
        }

        tracker.detect(&empty).unwrap();
        assert_eq!(tracker.tracking_region, Rect::new(0, 0, 64, 64));
    }
}
