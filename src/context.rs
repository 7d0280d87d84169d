//! The gridding context: options, point arrays, and the acceleration
//! structures derived from them.
//!
//! A [`GridContext`] is created once per (algorithm, options, points)
//! triple and then drives any number of [`process`](GridContext::process)
//! calls over different output windows. Creation is where every
//! selection decision happens: which evaluator runs (including the
//! SIMD inverse-distance kernels), whether a quadtree is worth
//! building, and the Delaunay triangulation for the linear algorithm.
//! After creation the context is read-only during processing and can
//! be shared freely across the driver's workers; dropping it releases
//! everything it owns.

use crate::blit::GridBuffer;
use crate::driver::{self, GridWindow, ProgressFn};
use crate::evaluators::{EvalContext, Evaluator, SharedExtras};
use crate::options::{parse_spec, Algorithm, GridOptions};
use crate::quadtree::QuadTree;
use crate::simd::{self, SimdPoints};
use crate::{delaunay::Delaunay, GridError};

/// Worker-count request, resolved against the host at process start.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// One worker per logical CPU.
    AllCpus,
    /// A fixed count; values of 0 or 1 process inline.
    Fixed(usize),
}

/// Configuration knobs, read once at context creation and never
/// re-read during processing.
#[derive(Clone, Debug)]
pub struct GridConfig {
    /// `NUM_THREADS`: worker count or `ALL_CPUS` (the default).
    pub num_threads: ThreadCount,
    /// `USE_SSE`: allow the 128-bit inverse-distance kernel.
    pub use_sse: bool,
    /// `USE_AVX`: allow the 256-bit inverse-distance kernel.
    pub use_avx: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { num_threads: ThreadCount::AllCpus, use_sse: true, use_avx: true }
    }
}

impl GridConfig {
    /// Read the knobs from the process environment.
    pub fn from_env() -> Self {
        let num_threads = match std::env::var("NUM_THREADS") {
            Err(_) => ThreadCount::AllCpus,
            Ok(s) if s.eq_ignore_ascii_case("ALL_CPUS") => ThreadCount::AllCpus,
            // Unparsable counts collapse to 0, i.e. inline processing.
            Ok(s) => ThreadCount::Fixed(s.trim().parse().unwrap_or(0)),
        };
        Self {
            num_threads,
            use_sse: env_boolean("USE_SSE"),
            use_avx: env_boolean("USE_AVX"),
        }
    }

    fn resolved_threads(&self) -> usize {
        match self.num_threads {
            ThreadCount::AllCpus => num_cpus::get(),
            ThreadCount::Fixed(n) => n,
        }
    }
}

/// Unset and unrecognized values are true; only the explicit negatives
/// disable a knob.
fn env_boolean(name: &str) -> bool {
    match std::env::var(name) {
        Err(_) => true,
        Ok(s) => !matches!(
            s.trim().to_ascii_uppercase().as_str(),
            "NO" | "FALSE" | "OFF" | "0"
        ),
    }
}

/// The context either borrows the caller's arrays or owns deep copies.
#[derive(Debug)]
enum PointStore<'a> {
    Borrowed { x: &'a [f64], y: &'a [f64], z: &'a [f64] },
    Owned { x: Vec<f64>, y: Vec<f64>, z: Vec<f64> },
}

impl PointStore<'_> {
    fn slices(&self) -> (&[f64], &[f64], &[f64]) {
        match self {
            PointStore::Borrowed { x, y, z } => (x, y, z),
            PointStore::Owned { x, y, z } => (x, y, z),
        }
    }
}

/// A sealed gridding setup: algorithm, option record, point set, and
/// whatever indices the combination calls for.
#[derive(Debug)]
pub struct GridContext<'a> {
    algorithm: Algorithm,
    options: GridOptions,
    evaluator: Evaluator,
    points: PointStore<'a>,
    shared: SharedExtras,
    simd_points: Option<SimdPoints>,
    config: GridConfig,
}

impl<'a> GridContext<'a> {
    /// Create a context borrowing the caller's arrays for its lifetime.
    pub fn borrowed(
        algorithm: Algorithm,
        options: GridOptions,
        x: &'a [f64],
        y: &'a [f64],
        z: &'a [f64],
    ) -> Result<Self, GridError> {
        Self::with_config(algorithm, options, x, y, z, true, GridConfig::from_env())
    }

    /// Create a context that deep-copies the arrays, leaving the caller
    /// free to drop them.
    pub fn owned(
        algorithm: Algorithm,
        options: GridOptions,
        x: &[f64],
        y: &[f64],
        z: &[f64],
    ) -> Result<GridContext<'static>, GridError> {
        if x.len() != y.len() || x.len() != z.len() {
            return Err(GridError::MismatchedArrays);
        }
        let store = PointStore::Owned { x: try_copy(x)?, y: try_copy(y)?, z: try_copy(z)? };
        GridContext::from_store(algorithm, options, store, GridConfig::from_env())
    }

    /// [`Self::borrowed`] with explicit configuration instead of the
    /// environment knobs.
    pub fn with_config(
        algorithm: Algorithm,
        options: GridOptions,
        x: &'a [f64],
        y: &'a [f64],
        z: &'a [f64],
        borrow: bool,
        config: GridConfig,
    ) -> Result<Self, GridError> {
        if x.len() != y.len() || x.len() != z.len() {
            return Err(GridError::MismatchedArrays);
        }
        let store = if borrow {
            PointStore::Borrowed { x, y, z }
        } else {
            PointStore::Owned { x: try_copy(x)?, y: try_copy(y)?, z: try_copy(z)? }
        };
        GridContext::from_store(algorithm, options, store, config)
    }

    fn from_store(
        algorithm: Algorithm,
        options: GridOptions,
        points: PointStore<'a>,
        config: GridConfig,
    ) -> Result<Self, GridError> {
        let (evaluator, build_quadtree, simd_points) = {
            let (x, y, z) = points.slices();
            let (evaluator, build_quadtree) =
                select_evaluator(algorithm, &options, &config, x.len())?;
            let simd_points = match evaluator {
                Evaluator::Simd(kernel) => {
                    tracing::debug!(?kernel, "using vectorized inverse-distance kernel");
                    Some(SimdPoints::new(x, y, z)?)
                }
                _ => None,
            };
            (evaluator, build_quadtree, simd_points)
        };

        let mut ctx = GridContext {
            algorithm,
            options,
            evaluator,
            points,
            shared: SharedExtras::default(),
            simd_points,
            config,
        };

        if build_quadtree {
            ctx.build_quadtree();
        }
        if algorithm == Algorithm::Linear {
            let (x, y, _) = ctx.points.slices();
            ctx.shared.triangulation =
                Some(Delaunay::build(x, y).map_err(|_| GridError::DegenerateTriangulation)?);
        }

        Ok(ctx)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn options(&self) -> &GridOptions {
        &self.options
    }

    /// Grid one output window into `buffer`.
    ///
    /// The buffer must hold exactly `nx · ny` cells of its element
    /// type. On error, rows not yet written are unspecified; completed
    /// rows remain as written.
    pub fn process(
        &mut self,
        window: &GridWindow,
        buffer: &mut GridBuffer<'_>,
        progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<(), GridError> {
        if window.nx == 0 || window.ny == 0 {
            return Err(GridError::EmptyWindow);
        }
        let cells = window.nx as usize * window.ny as usize;
        if buffer.cell_capacity() != cells {
            return Err(GridError::BufferSize { expected: cells, got: buffer.cell_capacity() });
        }

        // For linear gridding, probe the window perimeter first: if any
        // border cell falls outside the triangulation, interior cells
        // may too, and the nearest-neighbor fallback deserves an index.
        if self.algorithm == Algorithm::Linear
            && self.shared.quadtree.is_none()
            && self.perimeter_escapes_hull(window)
        {
            tracing::debug!("window leaves the convex hull; building quadtree for the fallback");
            self.build_quadtree();
        }

        let (x, y, z) = self.points.slices();
        let eval = EvalContext::new(
            self.evaluator,
            &self.options,
            x,
            y,
            z,
            &self.shared,
            self.simd_points.as_ref(),
        );
        driver::run(&eval, window, buffer, self.config.resolved_threads(), progress)
    }

    fn build_quadtree(&mut self) {
        let (x, y, _) = self.points.slices();
        if x.is_empty() {
            return;
        }
        let tree = QuadTree::build(x, y);
        let b = tree.bounds();
        // Typical spacing of a roughly uniform point distribution; the
        // starting radius for unbounded nearest-neighbor searches.
        self.shared.initial_search_radius =
            ((b.max_x - b.min_x) * (b.max_y - b.min_y) / x.len() as f64).sqrt();
        self.shared.quadtree = Some(tree);
    }

    /// Walk the window perimeter through the triangulation. If every
    /// border cell lands in a facet, so does every interior cell (the
    /// hull is convex), and no fallback index is needed.
    fn perimeter_escapes_hull(&self, window: &GridWindow) -> bool {
        let tri = match &self.shared.triangulation {
            Some(tri) => tri,
            None => return false,
        };
        let x_first = window.cell_x(0);
        let x_last = window.cell_x(window.nx - 1);
        let mut hint_left = 0;
        let mut hint_right = 0;
        for j in 0..window.ny {
            let cy = window.cell_y(j);
            let (facet, found) = tri.locate(hint_left, x_first, cy);
            hint_left = facet;
            if !found {
                return true;
            }
            let (facet, found) = tri.locate(hint_right, x_last, cy);
            hint_right = facet;
            if !found {
                return true;
            }
        }

        let y_first = window.cell_y(0);
        let y_last = window.cell_y(window.ny - 1);
        let mut hint_top = 0;
        let mut hint_bottom = 0;
        for i in 1..window.nx.saturating_sub(1) {
            let cx = window.cell_x(i);
            let (facet, found) = tri.locate(hint_top, cx, y_first);
            hint_top = facet;
            if !found {
                return true;
            }
            let (facet, found) = tri.locate(hint_bottom, cx, y_last);
            hint_bottom = facet;
            if !found {
                return true;
            }
        }
        false
    }
}

/// Map (algorithm, options) to the evaluator that will run, plus
/// whether a nearest-neighbor quadtree pays off.
fn select_evaluator(
    algorithm: Algorithm,
    options: &GridOptions,
    config: &GridConfig,
    n_points: usize,
) -> Result<(Evaluator, bool), GridError> {
    let evaluator = match (algorithm, options) {
        (Algorithm::InverseDistanceToAPower, GridOptions::InverseDistance(o)) => {
            if o.radius1 == 0.0 && o.radius2 == 0.0 {
                // No search ellipse: take the streamlined path, and the
                // vector kernels when the parameters allow.
                no_search_evaluator(o.power, o.smoothing, config)
            } else {
                Evaluator::InverseDistance
            }
        }
        (Algorithm::InverseDistanceNoSearch, GridOptions::NoSearch(o)) => {
            no_search_evaluator(o.power, o.smoothing, config)
        }
        (Algorithm::MovingAverage, GridOptions::MovingAverage(_)) => Evaluator::MovingAverage,
        (Algorithm::NearestNeighbor, GridOptions::Nearest(_)) => Evaluator::Nearest,
        (Algorithm::MetricMinimum, GridOptions::Metric(_)) => Evaluator::Minimum,
        (Algorithm::MetricMaximum, GridOptions::Metric(_)) => Evaluator::Maximum,
        (Algorithm::MetricRange, GridOptions::Metric(_)) => Evaluator::Range,
        (Algorithm::MetricCount, GridOptions::Metric(_)) => Evaluator::Count,
        (Algorithm::MetricAverageDistance, GridOptions::Metric(_)) => Evaluator::AverageDistance,
        (Algorithm::MetricAverageDistancePts, GridOptions::Metric(_)) => {
            Evaluator::AverageDistancePts
        }
        (Algorithm::Linear, GridOptions::Linear(_)) => Evaluator::Linear,
        _ => return Err(GridError::OptionsMismatch),
    };

    let build_quadtree = match (algorithm, options) {
        (Algorithm::NearestNeighbor, GridOptions::Nearest(o)) => {
            n_points > 100 && o.radius1 == o.radius2
        }
        _ => false,
    };

    Ok((evaluator, build_quadtree))
}

fn no_search_evaluator(power: f64, smoothing: f64, config: &GridConfig) -> Evaluator {
    if power == 2.0 && smoothing == 0.0 {
        if let Some(kernel) = simd::select_kernel(config.use_sse, config.use_avx) {
            return Evaluator::Simd(kernel);
        }
    }
    Evaluator::InverseDistanceNoSearch
}

fn try_copy(src: &[f64]) -> Result<Vec<f64>, GridError> {
    let mut out = Vec::new();
    out.try_reserve_exact(src.len()).map_err(|_| GridError::OutOfMemory)?;
    out.extend_from_slice(src);
    Ok(out)
}

/// One-shot gridding: create a context over borrowed arrays, process a
/// single window, release everything.
#[allow(clippy::too_many_arguments)]
pub fn grid_create(
    algorithm: Algorithm,
    options: GridOptions,
    x: &[f64],
    y: &[f64],
    z: &[f64],
    window: &GridWindow,
    buffer: &mut GridBuffer<'_>,
    progress: Option<&mut ProgressFn<'_>>,
) -> Result<(), GridError> {
    let mut ctx = GridContext::borrowed(algorithm, options, x, y, z)?;
    ctx.process(window, buffer, progress)
}

/// Happy-path one-shot: parse a textual algorithm spec and grid with it.
pub fn grid_create_from_spec(
    spec: &str,
    x: &[f64],
    y: &[f64],
    z: &[f64],
    window: &GridWindow,
    buffer: &mut GridBuffer<'_>,
) -> anyhow::Result<()> {
    let (algorithm, options) =
        parse_spec(spec).map_err(|e| anyhow::anyhow!("parse algorithm spec `{spec}`: {e}"))?;
    grid_create(algorithm, options, x, y, z, window, buffer, None)
        .map_err(|e| anyhow::anyhow!("gridding with `{spec}` failed: {e}"))
}
