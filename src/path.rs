//! Edge geometry: vertical cubic bezier paths between ports, dangling
//! preview end points, and point-to-curve distance for hit testing.

use crate::model::Point;

/// Below this length an edge is drawn as a straight segment.
const STRAIGHT_THRESHOLD: f64 = 10.0;

/// Cubic bezier leaving its start downwards and entering its end from above.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicBezier {
    pub p0: Point,
    pub p1: Point,
    pub p2: Point,
    pub p3: Point,
}

impl CubicBezier {
    /// Build the curve between two ports.
    ///
    /// Control points extend vertically by half the vertical distance, but
    /// never less than `min_offset`.
    pub fn vertical(start: Point, end: Point, min_offset: f64) -> Self {
        if start.distance_sq(&end) < STRAIGHT_THRESHOLD * STRAIGHT_THRESHOLD {
            return CubicBezier {
                p0: start,
                p1: start,
                p2: end,
                p3: end,
            };
        }
        let offset = ((end.y - start.y).abs() * 0.5).max(min_offset);
        CubicBezier {
            p0: start,
            p1: start.offset(0.0, offset),
            p2: end.offset(0.0, -offset),
            p3: end,
        }
    }

    fn is_straight(&self) -> bool {
        self.p0 == self.p1 && self.p2 == self.p3
    }

    pub fn eval(&self, t: f64) -> Point {
        let mt = 1.0 - t;
        let a = mt * mt * mt;
        let b = 3.0 * mt * mt * t;
        let c = 3.0 * mt * t * t;
        let d = t * t * t;
        Point::new(
            a * self.p0.x + b * self.p1.x + c * self.p2.x + d * self.p3.x,
            a * self.p0.y + b * self.p1.y + c * self.p2.y + d * self.p3.y,
        )
    }

    /// SVG path commands, e.g. `M 0 40 C 0 90 100 150 100 200`.
    pub fn to_commands(&self) -> String {
        if self.is_straight() {
            return format!("M {} {} L {} {}", self.p0.x, self.p0.y, self.p3.x, self.p3.y);
        }
        format!(
            "M {} {} C {} {} {} {} {} {}",
            self.p0.x, self.p0.y, self.p1.x, self.p1.y, self.p2.x, self.p2.y, self.p3.x, self.p3.y
        )
    }
}

/// SVG path commands of an edge from `start` to `end`.
pub fn edge_path(start: Point, end: Point, min_offset: f64) -> String {
    CubicBezier::vertical(start, end, min_offset).to_commands()
}

/// Free end of a dangling preview line.
///
/// A single line drops straight down by `length`; the lines of a branch
/// group fan out horizontally, `spread` apart and centered under the source.
pub fn preview_end_point(source: Point, index: usize, count: usize, length: f64, spread: f64) -> Point {
    if count <= 1 {
        return source.offset(0.0, length);
    }
    let center = (count as f64 - 1.0) / 2.0;
    source.offset((index as f64 - center) * spread, length)
}

fn distance_to_segment_sq(point: Point, a: Point, b: Point) -> f64 {
    let abx = b.x - a.x;
    let aby = b.y - a.y;
    let len_sq = abx * abx + aby * aby;
    if len_sq < f64::EPSILON {
        return point.distance_sq(&a);
    }
    let t = (((point.x - a.x) * abx + (point.y - a.y) * aby) / len_sq).clamp(0.0, 1.0);
    point.distance_sq(&Point::new(a.x + t * abx, a.y + t * aby))
}

/// Approximate distance from `point` to the curve by sampling it into
/// `samples` segments (20 when zero).
pub fn distance_to_bezier(point: Point, bezier: &CubicBezier, samples: usize) -> f64 {
    let samples = if samples == 0 { 20 } else { samples };
    let mut best = f64::MAX;
    let mut prev = bezier.eval(0.0);
    for i in 1..=samples {
        let curr = bezier.eval(i as f64 / samples as f64);
        best = best.min(distance_to_segment_sq(point, prev, curr));
        prev = curr;
    }
    best.sqrt()
}
