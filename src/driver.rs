//! The tile driver: sweeps an output window with worker threads.
//!
//! The Y axis is partitioned into interleaved stripes, `ny_step` equal
//! to the worker count: worker `k` owns rows `k, k + n, k + 2n, …`.
//! Interleaving keeps consecutive rows (and with them the Delaunay
//! walk locality) spread evenly across workers whatever the point
//! distribution looks like. Within a row, cells are evaluated left to
//! right into an f64 scratch row, then blitted into the output buffer
//! in one conversion pass.
//!
//! Progress is a single completed-row counter under a mutex paired
//! with a condition variable: workers bump and signal after each row,
//! the driving thread wakes, reports `counter / ny` to the callback,
//! and flips the shared stop flag if the callback declines to
//! continue. Workers observe the flag after every row, so
//! cancellation latency is one row per worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::blit::{GridBuffer, RowWriter};
use crate::evaluators::{EvalContext, WorkerExtras};
use crate::GridError;

/// Progress callback: receives the completed fraction in `[0, 1]` and
/// returns whether to continue.
pub type ProgressFn<'a> = dyn FnMut(f64) -> bool + 'a;

/// Geometry of the output raster window. Cell `(i, j)` is evaluated at
/// its center, `(x_min + (i + 0.5)·dx, y_min + (j + 0.5)·dy)`.
#[derive(Copy, Clone, Debug)]
pub struct GridWindow {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub nx: u32,
    pub ny: u32,
}

impl GridWindow {
    #[inline]
    pub fn delta_x(&self) -> f64 {
        (self.x_max - self.x_min) / self.nx as f64
    }

    #[inline]
    pub fn delta_y(&self) -> f64 {
        (self.y_max - self.y_min) / self.ny as f64
    }

    #[inline]
    pub fn cell_x(&self, i: u32) -> f64 {
        self.x_min + (i as f64 + 0.5) * self.delta_x()
    }

    #[inline]
    pub fn cell_y(&self, j: u32) -> f64 {
        self.y_min + (j as f64 + 0.5) * self.delta_y()
    }
}

/// Cap the requested worker count: never more than 128, and no worker
/// shall own fewer than two rows.
pub(crate) fn effective_threads(requested: usize, ny: u32) -> usize {
    let mut n = requested.min(128);
    if n >= (ny / 2) as usize {
        n = (ny / 2) as usize;
    }
    n
}

/// Shared progress/cancellation state, all guarded by one mutex (the
/// stop flag is atomic so workers can also read it without the lock).
struct ProgressState {
    completed_rows: Mutex<u32>,
    progress: Condvar,
    stop: AtomicBool,
}

impl ProgressState {
    fn new() -> Self {
        Self { completed_rows: Mutex::new(0), progress: Condvar::new(), stop: AtomicBool::new(false) }
    }

    /// Record one finished row, wake the driving thread, and report
    /// whether the run has been stopped.
    fn row_done(&self) -> bool {
        let mut completed = self.completed_rows.lock().unwrap();
        *completed += 1;
        self.progress.notify_one();
        drop(completed);
        self.stop.load(Ordering::SeqCst)
    }

    /// Halt the run and make sure the driving thread notices.
    fn halt(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _guard = self.completed_rows.lock().unwrap();
        self.progress.notify_one();
    }
}

/// Grid the window into `buffer`, using up to `requested_threads`
/// workers.
pub(crate) fn run(
    eval: &EvalContext<'_>,
    window: &GridWindow,
    buffer: &mut GridBuffer<'_>,
    requested_threads: usize,
    mut progress: Option<&mut ProgressFn<'_>>,
) -> Result<(), GridError> {
    let writer = RowWriter::new(buffer, window.nx as usize);
    let nthreads = effective_threads(requested_threads, window.ny);

    if nthreads <= 1 {
        return run_single(eval, window, &writer, progress.as_deref_mut());
    }
    tracing::debug!(nthreads, "gridding with worker threads");

    let state = ProgressState::new();
    let mut cancelled = false;
    let mut worker_error = None;

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(nthreads);
        for k in 0..nthreads {
            let state = &state;
            let writer = &writer;
            handles.push(scope.spawn(move || {
                worker_stripe(eval, window, writer, k as u32, nthreads as u32, state)
            }));
        }

        let mut completed = state.completed_rows.lock().unwrap();
        while *completed < window.ny && !state.stop.load(Ordering::SeqCst) {
            completed = state.progress.wait(completed).unwrap();
            let fraction = *completed as f64 / window.ny as f64;
            drop(completed);

            let keep_going = progress.as_deref_mut().map_or(true, |cb| cb(fraction));
            if !keep_going {
                tracing::debug!(fraction, "progress callback requested cancellation");
                state.stop.store(true, Ordering::SeqCst);
                cancelled = true;
            }

            completed = state.completed_rows.lock().unwrap();
        }
        // Release the lock before joining, otherwise workers dead-lock
        // in row_done().
        drop(completed);

        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    worker_error.get_or_insert(e);
                }
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
    });

    if let Some(e) = worker_error {
        return Err(e);
    }
    if cancelled {
        return Err(GridError::Cancelled);
    }
    Ok(())
}

/// Per-worker loop over one interleaved stripe.
fn worker_stripe(
    eval: &EvalContext<'_>,
    window: &GridWindow,
    writer: &RowWriter,
    y_start: u32,
    y_step: u32,
    state: &ProgressState,
) -> Result<(), GridError> {
    let mut values = match scratch_row(window.nx as usize) {
        Ok(v) => v,
        Err(e) => {
            state.halt();
            return Err(e);
        }
    };
    // Each worker owns its extras by value: the Delaunay walk hint must
    // never be shared between stripes.
    let mut extras = WorkerExtras::default();

    let mut j = y_start;
    while j < window.ny {
        let cy = window.cell_y(j);
        for i in 0..window.nx {
            let cx = window.cell_x(i);
            match eval.evaluate(cx, cy, &mut extras) {
                Ok(v) => values[i as usize] = v,
                Err(e) => {
                    state.halt();
                    return Err(e);
                }
            }
        }
        // SAFETY: row j belongs to this worker's stripe only.
        unsafe { writer.blit_row(j as usize, &values) };

        if state.row_done() {
            break;
        }
        j += y_step;
    }
    Ok(())
}

/// Inline processing for thread counts of one (or tiny windows).
fn run_single(
    eval: &EvalContext<'_>,
    window: &GridWindow,
    writer: &RowWriter,
    mut progress: Option<&mut ProgressFn<'_>>,
) -> Result<(), GridError> {
    let mut values = scratch_row(window.nx as usize)?;
    let mut extras = WorkerExtras::default();

    for j in 0..window.ny {
        let cy = window.cell_y(j);
        for i in 0..window.nx {
            let cx = window.cell_x(i);
            values[i as usize] = eval.evaluate(cx, cy, &mut extras)?;
        }
        // SAFETY: single-threaded, rows written once in order.
        unsafe { writer.blit_row(j as usize, &values) };

        let fraction = (j + 1) as f64 / window.ny as f64;
        if let Some(cb) = progress.as_deref_mut() {
            if !cb(fraction) {
                return Err(GridError::Cancelled);
            }
        }
    }
    Ok(())
}

/// Allocate the per-worker f64 scratch row, surfacing allocation
/// failure instead of aborting.
fn scratch_row(nx: usize) -> Result<Vec<f64>, GridError> {
    let mut values = Vec::new();
    values.try_reserve_exact(nx).map_err(|_| GridError::OutOfMemory)?;
    values.resize(nx, 0.0);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::{EvalContext, Evaluator, SharedExtras};
    use crate::options::{GridOptions, NoSearchOptions};

    fn single_point_eval<'a>(
        options: &'a GridOptions,
        x: &'a [f64],
        y: &'a [f64],
        z: &'a [f64],
        shared: &'a SharedExtras,
    ) -> EvalContext<'a> {
        EvalContext::new(Evaluator::InverseDistanceNoSearch, options, x, y, z, shared, None)
    }

    #[test]
    fn every_cell_is_written() {
        let x = [0.0];
        let y = [0.0];
        let z = [7.0];
        let options = GridOptions::NoSearch(NoSearchOptions::default());
        let shared = SharedExtras::default();
        let eval = single_point_eval(&options, &x, &y, &z, &shared);
        let window =
            GridWindow { x_min: -1.0, x_max: 1.0, y_min: -1.0, y_max: 1.0, nx: 16, ny: 16 };

        let mut out = vec![f64::NAN; 256];
        run(&eval, &window, &mut GridBuffer::F64(&mut out), 1, None).unwrap();
        assert!(out.iter().all(|v| (v - 7.0).abs() < 1e-9));
    }

    #[test]
    fn multi_thread_matches_single_thread() {
        let x = [0.0, 3.0, -2.0, 1.0];
        let y = [0.0, 1.0, -1.0, 4.0];
        let z = [7.0, -2.0, 4.0, 11.0];
        let options = GridOptions::NoSearch(NoSearchOptions::default());
        let shared = SharedExtras::default();
        let eval = single_point_eval(&options, &x, &y, &z, &shared);
        let window =
            GridWindow { x_min: -5.0, x_max: 5.0, y_min: -5.0, y_max: 5.0, nx: 32, ny: 32 };

        let mut serial = vec![0.0f64; 32 * 32];
        run(&eval, &window, &mut GridBuffer::F64(&mut serial), 1, None).unwrap();
        let mut parallel = vec![0.0f64; 32 * 32];
        run(&eval, &window, &mut GridBuffer::F64(&mut parallel), 4, None).unwrap();
        assert_eq!(serial, parallel);
    }

    #[test]
    fn cancellation_after_ten_percent_single_thread() {
        let x = [0.0];
        let y = [0.0];
        let z = [1.0];
        let options = GridOptions::NoSearch(NoSearchOptions::default());
        let shared = SharedExtras::default();
        let eval = single_point_eval(&options, &x, &y, &z, &shared);
        let window =
            GridWindow { x_min: -1.0, x_max: 1.0, y_min: -1.0, y_max: 1.0, nx: 8, ny: 100 };

        let mut out = vec![f64::NAN; 8 * 100];
        let mut cb = |fraction: f64| fraction < 0.1;
        let err = run(
            &eval,
            &window,
            &mut GridBuffer::F64(&mut out),
            1,
            Some(&mut cb as &mut ProgressFn<'_>),
        )
        .unwrap_err();
        assert!(matches!(err, GridError::Cancelled));
        // Exactly the first 10% of rows were written before the
        // callback pulled the plug.
        assert!(out[..10 * 8].iter().all(|v| v.is_finite()));
        assert!(out[10 * 8..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn cancellation_stops_the_worker_pool() {
        // Enough samples per cell that the stripes are still mostly
        // unwritten when the first progress report cancels the run.
        let n = 2000;
        let x: Vec<f64> = (0..n).map(|i| (i as f64).sin() * 50.0).collect();
        let y: Vec<f64> = (0..n).map(|i| (i as f64).cos() * 50.0).collect();
        let z: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let options = GridOptions::NoSearch(NoSearchOptions { power: 3.0, ..Default::default() });
        let shared = SharedExtras::default();
        let eval = single_point_eval(&options, &x, &y, &z, &shared);
        let window =
            GridWindow { x_min: -60.0, x_max: 60.0, y_min: -60.0, y_max: 60.0, nx: 32, ny: 512 };

        let mut out = vec![f64::NAN; 32 * 512];
        let mut cb = |_fraction: f64| false;
        let err = run(
            &eval,
            &window,
            &mut GridBuffer::F64(&mut out),
            4,
            Some(&mut cb as &mut ProgressFn<'_>),
        )
        .unwrap_err();
        assert!(matches!(err, GridError::Cancelled));
        assert!(out.iter().any(|v| v.is_nan()), "cancellation left no row unwritten");
    }

    #[test]
    fn progress_reaches_one_on_completion() {
        let x = [0.0];
        let y = [0.0];
        let z = [1.0];
        let options = GridOptions::NoSearch(NoSearchOptions::default());
        let shared = SharedExtras::default();
        let eval = single_point_eval(&options, &x, &y, &z, &shared);
        let window =
            GridWindow { x_min: 0.0, x_max: 1.0, y_min: 0.0, y_max: 1.0, nx: 4, ny: 8 };

        let mut last = 0.0;
        let mut cb = |fraction: f64| {
            assert!(fraction >= last, "progress went backwards");
            last = fraction;
            true
        };
        let mut out = vec![0.0f64; 32];
        run(&eval, &window, &mut GridBuffer::F64(&mut out), 1, Some(&mut cb as &mut ProgressFn<'_>))
            .unwrap();
        assert_eq!(last, 1.0);
    }

    #[test]
    fn thread_caps() {
        assert_eq!(effective_threads(1000, 10_000), 128);
        assert_eq!(effective_threads(8, 100), 8);
        assert_eq!(effective_threads(8, 10), 5);
        assert_eq!(effective_threads(8, 3), 1);
        assert_eq!(effective_threads(8, 1), 0);
        assert_eq!(effective_threads(1, 100), 1);
    }
}
