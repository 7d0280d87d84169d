//! Crate root: public surface and engine-wide invariants
//!
//! `scattergrid` turns an unordered set of samples `(x_i, y_i, z_i)`
//! into a regular raster: for every cell of a caller-described output
//! window it evaluates one of eleven interpolation or data-metric
//! algorithms and converts the result into the caller's buffer element
//! type.
//!
//! ## Shape of the engine
//!
//! - **Parse.** [`parse_spec`] resolves `name:key=value:…` strings
//!   into an [`Algorithm`] tag and a typed [`GridOptions`] record with
//!   defaults filled in.
//! - **Create.** [`GridContext`] seals the options with the point
//!   arrays (borrowed or deep-copied) and builds whatever acceleration
//!   state the combination needs: a point quadtree for indexed
//!   nearest-neighbor searches, a Delaunay triangulation for linear
//!   interpolation, aligned f32 shadow arrays for the vectorized
//!   inverse-distance kernels.
//! - **Process.** [`GridContext::process`] sweeps an output window
//!   with interleaved row stripes across worker threads, reporting
//!   progress through a callback that can cancel the run.
//!
//! ## Invariants
//!
//! - A context is immutable while a process call runs; every structure
//!   it owns is shared read-only across workers. The only read-write
//!   shared state is the progress counter and stop flag inside the
//!   driver, guarded by one mutex.
//! - Workers own their Delaunay walk hint by value; hints are never
//!   shared between stripes.
//! - Evaluation is f64 end to end, except the explicitly selected SIMD
//!   inverse-distance path, which trades f32 precision for throughput
//!   and is not bit-identical to the scalar result.
//! - Failure is always a precise [`GridError`]; on error the output
//!   buffer keeps completed rows and leaves the rest unspecified.

/// Typed output buffers and the f64 row blit.
pub mod blit;
/// Context creation, processing, configuration knobs, one-shot helpers.
pub mod context;
/// Delaunay triangulation, barycentric coefficients, directed walk.
pub mod delaunay;
/// The parallel tile driver and output-window geometry.
pub mod driver;
/// The rotated search-ellipse membership predicate.
pub mod ellipse;
/// The per-cell evaluators and their dispatch.
pub mod evaluators;
/// Algorithm tags, option records, and the algorithm-string parser.
pub mod options;
/// The bulk-loaded 2D point index.
pub mod quadtree;
/// Aligned f32 buffers and vectorized inverse-distance kernels.
pub mod simd;

pub use blit::GridBuffer;
pub use context::{grid_create, grid_create_from_spec, GridConfig, GridContext, ThreadCount};
pub use driver::{GridWindow, ProgressFn};
pub use options::{
    parse_spec, Algorithm, DataMetricsOptions, GridOptions, InverseDistanceOptions, LinearOptions,
    MovingAverageOptions, NearestNeighborOptions, NoSearchOptions, ParseError,
};

/// Errors surfaced by context creation and processing.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// An allocation failed; partially built state has been released.
    #[error("out of memory")]
    OutOfMemory,
    /// The linear algorithm needs at least three distinct,
    /// non-collinear points.
    #[error("cannot triangulate the point set (collinear or fewer than 3 distinct points)")]
    DegenerateTriangulation,
    /// The progress callback declined to continue.
    #[error("gridding cancelled by the progress callback")]
    Cancelled,
    /// An evaluator could not produce a value for a cell. None of the
    /// built-in algorithms report this; it guards dispatch invariants.
    #[error("evaluator failed")]
    EvaluatorFailure,
    /// The output window has a zero dimension.
    #[error("output raster dimensions must be non-zero")]
    EmptyWindow,
    /// The output buffer does not hold exactly `nx · ny` cells.
    #[error("output buffer holds {got} cells, window needs {expected}")]
    BufferSize { expected: usize, got: usize },
    /// The X, Y, and Z arrays differ in length.
    #[error("point arrays must have equal lengths")]
    MismatchedArrays,
    /// The option record does not belong to the requested algorithm.
    #[error("option record does not match the requested algorithm")]
    OptionsMismatch,
    /// A spec string failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),
}
