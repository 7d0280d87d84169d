//! The per-cell evaluators.
//!
//! Every algorithm reduces to one pure function of
//! `(options, points, qx, qy, extras)`; the driver calls it once per
//! output cell. Dispatch is a `match` on the [`Evaluator`] tag selected
//! at context creation, not a function pointer: the compiler sees every
//! arm and the selection logic stays in one place.
//!
//! The evaluation state is split in two. [`SharedExtras`] holds the
//! read-only acceleration structures (quadtree, triangulation, initial
//! search radius) shared by all workers; [`WorkerExtras`] holds the
//! mutable per-worker pieces (the Delaunay walk hint and a candidate
//! scratch buffer) so workers never contend on them.

use crate::delaunay::Delaunay;
use crate::ellipse::SearchEllipse;
use crate::options::{
    GridOptions, InverseDistanceOptions, LinearOptions, NearestNeighborOptions,
};
use crate::quadtree::{QuadTree, Rect};
use crate::simd::{self, SimdKernel, SimdPoints};
use crate::GridError;

/// Squared distance under which the query counts as coinciding with a
/// sample, returning the sample's value outright.
const EPSILON: f64 = 1e-13;

/// Which per-cell routine the context selected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Evaluator {
    InverseDistance,
    /// Inverse distance without a search ellipse; also chosen for
    /// `invdist` when both radii are zero.
    InverseDistanceNoSearch,
    /// Vectorized no-search inverse distance (power 2, no smoothing).
    Simd(SimdKernel),
    MovingAverage,
    Nearest,
    Minimum,
    Maximum,
    Range,
    Count,
    AverageDistance,
    AverageDistancePts,
    Linear,
}

/// Read-only acceleration state owned by the context and shared by all
/// workers.
#[derive(Default, Debug)]
pub struct SharedExtras {
    pub quadtree: Option<QuadTree>,
    /// Starting nearest-neighbor search radius when the options leave
    /// the radii unset: the typical inter-point spacing
    /// `√(bbox_area / N)`.
    pub initial_search_radius: f64,
    pub triangulation: Option<Delaunay>,
}

/// Mutable per-worker evaluation state. Each worker owns one by value.
#[derive(Clone, Default)]
pub struct WorkerExtras {
    /// Facet where this worker's previous Delaunay walk ended.
    pub facet_hint: usize,
    /// Scratch buffer for quadtree candidate lists.
    candidates: Vec<u32>,
}

/// Everything an evaluator needs that is constant across a process run.
pub struct EvalContext<'a> {
    pub evaluator: Evaluator,
    pub options: &'a GridOptions,
    pub x: &'a [f64],
    pub y: &'a [f64],
    pub z: &'a [f64],
    pub shared: &'a SharedExtras,
    pub simd_points: Option<&'a SimdPoints>,
    ellipse: SearchEllipse,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        evaluator: Evaluator,
        options: &'a GridOptions,
        x: &'a [f64],
        y: &'a [f64],
        z: &'a [f64],
        shared: &'a SharedExtras,
        simd_points: Option<&'a SimdPoints>,
    ) -> Self {
        let ellipse = match options {
            GridOptions::InverseDistance(o) => SearchEllipse::new(o.radius1, o.radius2, o.angle),
            GridOptions::MovingAverage(o) => SearchEllipse::new(o.radius1, o.radius2, o.angle),
            GridOptions::Nearest(o) => SearchEllipse::new(o.radius1, o.radius2, o.angle),
            GridOptions::Metric(o) => SearchEllipse::new(o.radius1, o.radius2, o.angle),
            GridOptions::NoSearch(_) | GridOptions::Linear(_) => SearchEllipse::new(0.0, 0.0, 0.0),
        };
        Self { evaluator, options, x, y, z, shared, simd_points, ellipse }
    }

    /// Evaluate one output cell centered at `(qx, qy)`.
    ///
    /// The standard algorithms never fail; the error arm exists for the
    /// dispatch invariants (an evaluator paired with a foreign option
    /// record or missing acceleration state cannot produce a value).
    pub fn evaluate(
        &self,
        qx: f64,
        qy: f64,
        worker: &mut WorkerExtras,
    ) -> Result<f64, GridError> {
        match (self.evaluator, self.options) {
            (Evaluator::InverseDistance, GridOptions::InverseDistance(o)) => {
                Ok(self.inverse_distance(o, qx, qy))
            }
            (Evaluator::InverseDistanceNoSearch, GridOptions::NoSearch(o)) => {
                Ok(self.inverse_distance_no_search(o.power, o.smoothing, o.nodata, qx, qy))
            }
            (Evaluator::InverseDistanceNoSearch, GridOptions::InverseDistance(o)) => {
                Ok(self.inverse_distance_no_search(o.power, o.smoothing, o.nodata, qx, qy))
            }
            (Evaluator::Simd(kernel), _) => match self.simd_points {
                Some(points) => {
                    Ok(simd::evaluate(kernel, points, qx, qy, self.options.nodata()))
                }
                None => Err(GridError::EvaluatorFailure),
            },
            (Evaluator::MovingAverage, GridOptions::MovingAverage(o)) => {
                let (sum, n) = self.fold_in_ellipse(qx, qy, (0.0, 0u32), |(s, n), i, _| {
                    (s + self.z[i], n + 1)
                });
                if n < o.min_points || n == 0 {
                    Ok(o.nodata)
                } else {
                    Ok(sum / n as f64)
                }
            }
            (Evaluator::Nearest, GridOptions::Nearest(o)) => {
                Ok(self.nearest(o, &self.ellipse, qx, qy, worker))
            }
            (Evaluator::Minimum, GridOptions::Metric(o)) => {
                let (min, n) = self.fold_in_ellipse(qx, qy, (f64::INFINITY, 0u32), |(m, n), i, _| {
                    (m.min(self.z[i]), n + 1)
                });
                if n < o.min_points || n == 0 {
                    Ok(o.nodata)
                } else {
                    Ok(min)
                }
            }
            (Evaluator::Maximum, GridOptions::Metric(o)) => {
                let (max, n) =
                    self.fold_in_ellipse(qx, qy, (f64::NEG_INFINITY, 0u32), |(m, n), i, _| {
                        (m.max(self.z[i]), n + 1)
                    });
                if n < o.min_points || n == 0 {
                    Ok(o.nodata)
                } else {
                    Ok(max)
                }
            }
            (Evaluator::Range, GridOptions::Metric(o)) => {
                let (min, max, n) = self.fold_in_ellipse(
                    qx,
                    qy,
                    (f64::INFINITY, f64::NEG_INFINITY, 0u32),
                    |(min, max, n), i, _| (min.min(self.z[i]), max.max(self.z[i]), n + 1),
                );
                if n < o.min_points || n == 0 {
                    Ok(o.nodata)
                } else {
                    Ok(max - min)
                }
            }
            (Evaluator::Count, GridOptions::Metric(o)) => {
                let n = self.fold_in_ellipse(qx, qy, 0u32, |n, _, _| n + 1);
                if n < o.min_points {
                    Ok(o.nodata)
                } else {
                    Ok(n as f64)
                }
            }
            (Evaluator::AverageDistance, GridOptions::Metric(o)) => {
                let (sum, n) = self.fold_in_ellipse(qx, qy, (0.0, 0u32), |(s, n), _, r2| {
                    (s + r2.sqrt(), n + 1)
                });
                if n < o.min_points || n == 0 {
                    Ok(o.nodata)
                } else {
                    Ok(sum / n as f64)
                }
            }
            (Evaluator::AverageDistancePts, GridOptions::Metric(o)) => {
                Ok(self.average_distance_pts(o.min_points, o.nodata, qx, qy))
            }
            (Evaluator::Linear, GridOptions::Linear(o)) => match &self.shared.triangulation {
                Some(tri) => Ok(self.linear(o, tri, qx, qy, worker)),
                None => Err(GridError::EvaluatorFailure),
            },
            _ => Err(GridError::EvaluatorFailure),
        }
    }

    /// Fold `f(acc, sample_index, r²)` over the samples inside the
    /// search ellipse. `r²` is the plain squared distance to the query.
    #[inline]
    fn fold_in_ellipse<A>(&self, qx: f64, qy: f64, init: A, mut f: impl FnMut(A, usize, f64) -> A) -> A {
        let mut acc = init;
        for i in 0..self.x.len() {
            let rx = self.x[i] - qx;
            let ry = self.y[i] - qy;
            if self.ellipse.contains(rx, ry) {
                acc = f(acc, i, rx * rx + ry * ry);
            }
        }
        acc
    }

    fn inverse_distance(&self, o: &InverseDistanceOptions, qx: f64, qy: f64) -> f64 {
        let power_div_2 = o.power / 2.0;
        let smoothing2 = o.smoothing * o.smoothing;
        let mut num = 0.0;
        let mut den = 0.0;
        let mut n = 0u32;

        for i in 0..self.x.len() {
            let rx = self.x[i] - qx;
            let ry = self.y[i] - qy;
            let r2 = rx * rx + ry * ry + smoothing2;
            if !self.ellipse.contains(rx, ry) {
                continue;
            }
            // A sample on the grid node would make the weight singular;
            // its value wins outright.
            if r2 < EPSILON {
                return self.z[i];
            }
            let w = r2.powf(power_div_2);
            num += self.z[i] / w;
            den += 1.0 / w;
            n += 1;
            if o.max_points > 0 && n >= o.max_points {
                break;
            }
        }

        if n < o.min_points || den == 0.0 {
            o.nodata
        } else {
            num / den
        }
    }

    fn inverse_distance_no_search(
        &self,
        power: f64,
        smoothing: f64,
        nodata: f64,
        qx: f64,
        qy: f64,
    ) -> f64 {
        let smoothing2 = smoothing * smoothing;
        let mut num = 0.0;
        let mut den = 0.0;

        if power == 2.0 {
            if smoothing2 > 0.0 {
                // The smoothing term bounds r² away from zero, so the
                // singular-point test is unnecessary here.
                for i in 0..self.x.len() {
                    let rx = self.x[i] - qx;
                    let ry = self.y[i] - qy;
                    let r2 = rx * rx + ry * ry + smoothing2;
                    num += self.z[i] / r2;
                    den += 1.0 / r2;
                }
            } else {
                for i in 0..self.x.len() {
                    let rx = self.x[i] - qx;
                    let ry = self.y[i] - qy;
                    let r2 = rx * rx + ry * ry;
                    if r2 < EPSILON {
                        return self.z[i];
                    }
                    num += self.z[i] / r2;
                    den += 1.0 / r2;
                }
            }
        } else {
            let power_div_2 = power / 2.0;
            for i in 0..self.x.len() {
                let rx = self.x[i] - qx;
                let ry = self.y[i] - qy;
                let r2 = rx * rx + ry * ry + smoothing2;
                if r2 < EPSILON {
                    return self.z[i];
                }
                let w = r2.powf(power_div_2);
                num += self.z[i] / w;
                den += 1.0 / w;
            }
        }

        if den == 0.0 {
            nodata
        } else {
            num / den
        }
    }

    /// Nearest-neighbor lookup. The ellipse is passed in rather than
    /// taken from the context because the linear algorithm re-enters
    /// here with its own fallback radius.
    fn nearest(
        &self,
        o: &NearestNeighborOptions,
        ellipse: &SearchEllipse,
        qx: f64,
        qy: f64,
        worker: &mut WorkerExtras,
    ) -> f64 {
        // Best sample so far: strictly smaller squared distance wins,
        // so the first sample encountered at the minimum is kept.
        let mut best: Option<(f64, f64)> = None;

        let circular = o.radius1 == o.radius2;
        if let (Some(tree), true, true) =
            (&self.shared.quadtree, circular, self.shared.initial_search_radius > 0.0)
        {
            let limit = if o.radius1 > 0.0 { o.radius1 * o.radius1 } else { f64::INFINITY };
            let mut search_radius =
                if o.radius1 > 0.0 { o.radius1 } else { self.shared.initial_search_radius };
            loop {
                let aoi = Rect {
                    min_x: qx - search_radius,
                    min_y: qy - search_radius,
                    max_x: qx + search_radius,
                    max_y: qy + search_radius,
                };
                tree.query(self.x, self.y, &aoi, &mut worker.candidates);
                if !worker.candidates.is_empty() {
                    for &i in &worker.candidates {
                        let i = i as usize;
                        let rx = self.x[i] - qx;
                        let ry = self.y[i] - qy;
                        let r2 = rx * rx + ry * ry;
                        if r2 <= limit && best.map_or(true, |(br2, _)| r2 < br2) {
                            best = Some((r2, self.z[i]));
                        }
                    }
                    break;
                }
                if o.radius1 > 0.0 {
                    // Fixed radius and the AOI is empty: nothing to find.
                    break;
                }
                search_radius *= 2.0;
                tracing::debug!(search_radius, "nearest: growing initial search radius");
                if !search_radius.is_finite() {
                    break;
                }
            }
        } else {
            for i in 0..self.x.len() {
                let rx = self.x[i] - qx;
                let ry = self.y[i] - qy;
                if ellipse.contains(rx, ry) {
                    let r2 = rx * rx + ry * ry;
                    if best.map_or(true, |(br2, _)| r2 < br2) {
                        best = Some((r2, self.z[i]));
                    }
                }
            }
        }

        best.map_or(o.nodata, |(_, z)| z)
    }

    fn average_distance_pts(&self, min_points: u32, nodata: f64, qx: f64, qy: f64) -> f64 {
        let n_points = self.x.len();
        let mut sum = 0.0;
        let mut n = 0u32;

        // O(k²) over the in-ellipse subset: for every anchor inside the
        // ellipse, pair it with each later in-ellipse sample.
        for i in 0..n_points.saturating_sub(1) {
            let rx1 = self.x[i] - qx;
            let ry1 = self.y[i] - qy;
            if !self.ellipse.contains(rx1, ry1) {
                continue;
            }
            for j in (i + 1)..n_points {
                let rx2 = self.x[j] - qx;
                let ry2 = self.y[j] - qy;
                if !self.ellipse.contains(rx2, ry2) {
                    continue;
                }
                let dx = self.x[j] - self.x[i];
                let dy = self.y[j] - self.y[i];
                sum += (dx * dx + dy * dy).sqrt();
                n += 1;
            }
        }

        if n < min_points || n == 0 {
            nodata
        } else {
            sum / n as f64
        }
    }

    fn linear(
        &self,
        o: &LinearOptions,
        tri: &Delaunay,
        qx: f64,
        qy: f64,
        worker: &mut WorkerExtras,
    ) -> f64 {
        let (facet, found) = tri.locate(worker.facet_hint, qx, qy);
        // The driver scans row-major, so the found (or last hull) facet
        // is the best start for this worker's next cell.
        worker.facet_hint = facet;

        if found {
            let (l1, l2, l3) = tri.barycentric(facet, qx, qy);
            let [v1, v2, v3] = tri.vertices(facet);
            return l1 * self.z[v1 as usize]
                + l2 * self.z[v2 as usize]
                + l3 * self.z[v3 as usize];
        }

        if o.radius == 0.0 {
            return o.nodata;
        }
        let clamp = if o.radius < 0.0 { 0.0 } else { o.radius };
        let fallback = NearestNeighborOptions {
            radius1: clamp,
            radius2: clamp,
            angle: 0.0,
            nodata: o.nodata,
        };
        let circle = SearchEllipse::new(clamp, clamp, 0.0);
        self.nearest(&fallback, &circle, qx, qy, worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DataMetricsOptions, MovingAverageOptions, NoSearchOptions};

    fn ctx<'a>(
        evaluator: Evaluator,
        options: &'a GridOptions,
        x: &'a [f64],
        y: &'a [f64],
        z: &'a [f64],
        shared: &'a SharedExtras,
    ) -> EvalContext<'a> {
        EvalContext::new(evaluator, options, x, y, z, shared, None)
    }

    fn eval(c: &EvalContext<'_>, qx: f64, qy: f64) -> f64 {
        c.evaluate(qx, qy, &mut WorkerExtras::default()).unwrap()
    }

    #[test]
    fn invdist_exact_hit_returns_sample() {
        let x = [0.0, 3.0];
        let y = [0.0, 3.0];
        let z = [7.0, 100.0];
        let opts = GridOptions::InverseDistance(InverseDistanceOptions::default());
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::InverseDistanceNoSearch, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&c, 0.0, 0.0), 7.0);
        assert_eq!(eval(&c, 3.0, 3.0), 100.0);
    }

    #[test]
    fn invdist_weights_pull_toward_near_sample() {
        let x = [0.0, 10.0];
        let y = [0.0, 0.0];
        let z = [0.0, 10.0];
        let opts = GridOptions::InverseDistance(InverseDistanceOptions::default());
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::InverseDistanceNoSearch, &opts, &x, &y, &z, &shared);
        let v = eval(&c, 2.0, 0.0);
        // Nearer to z=0, so below the midpoint value.
        assert!(v < 5.0 && v > 0.0, "got {v}");
        // Symmetric query point: exactly the mean.
        assert!((eval(&c, 5.0, 0.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn invdist_max_points_admits_exactly_k() {
        // Three samples on a line; with max_points=2 only the first two
        // scanned samples contribute.
        let x = [1.0, 2.0, 3.0];
        let y = [0.0, 0.0, 0.0];
        let z = [10.0, 20.0, 30.0];
        let opts = GridOptions::InverseDistance(InverseDistanceOptions {
            max_points: 2,
            ..Default::default()
        });
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::InverseDistance, &opts, &x, &y, &z, &shared);
        let got = eval(&c, 0.0, 0.0);
        let (w1, w2) = (1.0, 1.0 / 4.0);
        let want = (10.0 * w1 + 20.0 * w2) / (w1 + w2);
        assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
    }

    #[test]
    fn invdist_min_points_yields_nodata() {
        let x = [0.0];
        let y = [0.0];
        let z = [5.0];
        let opts = GridOptions::InverseDistance(InverseDistanceOptions {
            radius1: 1.0,
            radius2: 1.0,
            min_points: 2,
            nodata: -999.0,
            ..Default::default()
        });
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::InverseDistance, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&c, 0.5, 0.0), -999.0);
    }

    #[test]
    fn no_search_smoothing_skips_singular_rule() {
        let x = [0.0];
        let y = [0.0];
        let z = [8.0];
        let opts = GridOptions::NoSearch(NoSearchOptions {
            smoothing: 1.0,
            ..Default::default()
        });
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::InverseDistanceNoSearch, &opts, &x, &y, &z, &shared);
        // Query on the sample: with smoothing the weight is finite and
        // the single sample still dominates completely.
        assert!((eval(&c, 0.0, 0.0) - 8.0).abs() < 1e-12);
    }

    #[test]
    fn average_is_bounded_by_sample_extremes() {
        let x = [0.0, 1.0, 2.0];
        let y = [0.0, 0.0, 0.0];
        let z = [1.0, 5.0, 9.0];
        let opts = GridOptions::MovingAverage(MovingAverageOptions {
            radius1: 10.0,
            radius2: 10.0,
            ..Default::default()
        });
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::MovingAverage, &opts, &x, &y, &z, &shared);
        let v = eval(&c, 1.0, 0.0);
        assert!((1.0..=9.0).contains(&v));
        assert!((v - 5.0).abs() < 1e-12);
    }

    #[test]
    fn nearest_scan_keeps_first_of_tied_samples() {
        // Spec scenario: three samples all √50 from the query.
        let x = [0.0, 10.0, 0.0];
        let y = [0.0, 0.0, 10.0];
        let z = [10.0, 20.0, 30.0];
        let opts = GridOptions::Nearest(NearestNeighborOptions::default());
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::Nearest, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&c, 5.0, 5.0), 10.0);
    }

    #[test]
    fn nearest_quadtree_and_scan_agree() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0xfaceu64);
        let n = 300;
        let x: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..50.0)).collect();
        let y: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..50.0)).collect();
        let z: Vec<f64> = (0..n).map(|_| rng.gen_range(-5.0..5.0)).collect();

        let build_shared = || {
            let tree = crate::quadtree::QuadTree::build(&x, &y);
            let bounds = tree.bounds();
            let area = (bounds.max_x - bounds.min_x) * (bounds.max_y - bounds.min_y);
            SharedExtras {
                quadtree: Some(tree),
                initial_search_radius: (area / n as f64).sqrt(),
                triangulation: None,
            }
        };

        // Fixed equal radii: the square AOI is a superset of the search
        // circle, so both paths see exactly the same neighborhood and
        // must agree bit for bit.
        let opts = GridOptions::Nearest(NearestNeighborOptions {
            radius1: 7.5,
            radius2: 7.5,
            nodata: f64::NAN,
            ..Default::default()
        });
        let scan_shared = SharedExtras::default();
        let indexed_shared = build_shared();
        let scan = ctx(Evaluator::Nearest, &opts, &x, &y, &z, &scan_shared);
        let indexed = ctx(Evaluator::Nearest, &opts, &x, &y, &z, &indexed_shared);
        for _ in 0..100 {
            let qx = rng.gen_range(-5.0..55.0);
            let qy = rng.gen_range(-5.0..55.0);
            let a = eval(&scan, qx, qy);
            let b = eval(&indexed, qx, qy);
            assert!(
                a == b || (a.is_nan() && b.is_nan()),
                "mismatch at ({qx}, {qy}): scan {a}, quadtree {b}"
            );
        }

        // Unset radii: the growing search stops at the first non-empty
        // square AOI, whose nearest member may differ from the global
        // nearest; it must still always produce some sample.
        let opts = GridOptions::Nearest(NearestNeighborOptions {
            nodata: f64::NAN,
            ..Default::default()
        });
        let indexed_shared = build_shared();
        let indexed = ctx(Evaluator::Nearest, &opts, &x, &y, &z, &indexed_shared);
        for _ in 0..100 {
            let qx = rng.gen_range(-200.0..200.0);
            let qy = rng.gen_range(-200.0..200.0);
            assert!(eval(&indexed, qx, qy).is_finite());
        }
    }

    #[test]
    fn metrics_over_the_ellipse() {
        let x = [0.0, 1.0, 2.0, 50.0];
        let y = [0.0, 0.0, 0.0, 0.0];
        let z = [4.0, -2.0, 10.0, 1000.0];
        let opts = GridOptions::Metric(DataMetricsOptions {
            radius1: 5.0,
            radius2: 5.0,
            nodata: -1.0,
            ..Default::default()
        });
        let shared = SharedExtras::default();

        let min = ctx(Evaluator::Minimum, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&min, 1.0, 0.0), -2.0);
        let max = ctx(Evaluator::Maximum, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&max, 1.0, 0.0), 10.0);
        let range = ctx(Evaluator::Range, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&range, 1.0, 0.0), 12.0);
        let count = ctx(Evaluator::Count, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&count, 1.0, 0.0), 3.0);
        // The far sample is outside every ellipse above.
    }

    #[test]
    fn count_in_ellipse_scenario() {
        // Four samples at the unit-circle cardinal points.
        let x = [1.0, 0.0, -1.0, 0.0];
        let y = [0.0, 1.0, 0.0, -1.0];
        let z = [1.0; 4];
        let shared = SharedExtras::default();

        let small = GridOptions::Metric(DataMetricsOptions {
            radius1: 0.5,
            radius2: 0.5,
            ..Default::default()
        });
        let c = ctx(Evaluator::Count, &small, &x, &y, &z, &shared);
        assert_eq!(eval(&c, 0.0, 0.0), 0.0);

        let large = GridOptions::Metric(DataMetricsOptions {
            radius1: 1.5,
            radius2: 1.5,
            ..Default::default()
        });
        let c = ctx(Evaluator::Count, &large, &x, &y, &z, &shared);
        assert_eq!(eval(&c, 0.0, 0.0), 4.0);
    }

    #[test]
    fn average_distance_of_known_layout() {
        let x = [3.0, -4.0];
        let y = [4.0, 3.0];
        let z = [0.0; 2];
        let opts = GridOptions::Metric(DataMetricsOptions::default());
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::AverageDistance, &opts, &x, &y, &z, &shared);
        // Both samples sit at distance 5 from the origin.
        assert!((eval(&c, 0.0, 0.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn average_distance_pts_counts_pairs() {
        // Unit square corners: 4 sides of length 1, 2 diagonals of √2.
        let x = [0.0, 1.0, 1.0, 0.0];
        let y = [0.0, 0.0, 1.0, 1.0];
        let z = [0.0; 4];
        let opts = GridOptions::Metric(DataMetricsOptions::default());
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::AverageDistancePts, &opts, &x, &y, &z, &shared);
        let want = (4.0 + 2.0 * 2f64.sqrt()) / 6.0;
        assert!((eval(&c, 0.5, 0.5) - want).abs() < 1e-12);
    }

    #[test]
    fn average_distance_pts_handles_tiny_sets() {
        let opts = GridOptions::Metric(DataMetricsOptions { nodata: -7.0, ..Default::default() });
        let shared = SharedExtras::default();
        let c = ctx(Evaluator::AverageDistancePts, &opts, &[], &[], &[], &shared);
        assert_eq!(eval(&c, 0.0, 0.0), -7.0);
        let x = [1.0];
        let y = [1.0];
        let z = [1.0];
        let c = ctx(Evaluator::AverageDistancePts, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&c, 0.0, 0.0), -7.0);
    }

    #[test]
    fn linear_inside_and_outside_the_hull() {
        let x = [0.0, 4.0, 0.0];
        let y = [0.0, 0.0, 4.0];
        let z = [0.0, 4.0, 8.0];
        let shared = SharedExtras {
            triangulation: Some(crate::delaunay::Delaunay::build(&x, &y).unwrap()),
            ..Default::default()
        };

        // Inside: barycentric weights (0.5, 0.25, 0.25) → 3.0.
        let opts = GridOptions::Linear(LinearOptions { radius: 0.0, nodata: -9.0 });
        let c = ctx(Evaluator::Linear, &opts, &x, &y, &z, &shared);
        assert!((eval(&c, 1.0, 1.0) - 3.0).abs() < 1e-12);
        // Outside with radius=0: nodata.
        assert_eq!(eval(&c, 5.0, 5.0), -9.0);

        // Outside with unlimited fallback: nearest vertex value.
        let opts = GridOptions::Linear(LinearOptions { radius: -1.0, nodata: -9.0 });
        let c = ctx(Evaluator::Linear, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&c, 5.0, 5.0), 4.0);

        // Outside with a clamp too small to reach any sample: nodata.
        let opts = GridOptions::Linear(LinearOptions { radius: 0.5, nodata: -9.0 });
        let c = ctx(Evaluator::Linear, &opts, &x, &y, &z, &shared);
        assert_eq!(eval(&c, 50.0, 50.0), -9.0);
    }

    #[test]
    fn linear_walk_hint_advances() {
        let x = [0.0, 4.0, 0.0, 4.0];
        let y = [0.0, 0.0, 4.0, 4.0];
        let z = [0.0, 1.0, 2.0, 3.0];
        let tri = crate::delaunay::Delaunay::build(&x, &y).unwrap();
        assert_eq!(tri.facet_count(), 2);
        let shared = SharedExtras { triangulation: Some(tri), ..Default::default() };
        let opts = GridOptions::Linear(LinearOptions::default());
        let c = ctx(Evaluator::Linear, &opts, &x, &y, &z, &shared);

        let mut worker = WorkerExtras::default();
        c.evaluate(0.5, 0.5, &mut worker).unwrap();
        let first = worker.facet_hint;
        c.evaluate(3.5, 3.5, &mut worker).unwrap();
        assert_ne!(first, worker.facet_hint);
    }
}
