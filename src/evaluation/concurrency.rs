use rayon::prelude::*;

use crate::error::EvalError;

/// Index of the rayon worker executing the caller, `0` outside of a pool.
#[inline(always)]
pub fn worker_index() -> usize {
    rayon::current_thread_index().unwrap_or(0)
}

pub fn build_thread_pool(num_threads: usize) -> Result<rayon::ThreadPool, EvalError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("sph-eval-{}", i))
        .build()?;
    Ok(pool)
}

/// Calls `f(idx, worker)` for every `idx` in `0..n` on the current pool.
///
/// `f` must not spawn rayon work itself: worker-private buffers are addressed
/// by `worker` and a nested job could be stolen onto the same worker.
pub fn par_for_each_particle<F: Fn(usize, usize) + Send + Sync>(n: usize, f: F) {
    (0..n).into_par_iter().for_each(|idx| {
        f(idx, worker_index());
    });
}

pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
    arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
        f(idx, v1);
    });
}

#[test]
fn worker_index_stays_below_pool_size() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    for num_threads in [1, 2, 8] {
        let pool = build_thread_pool(num_threads).unwrap();
        let max_seen = AtomicUsize::new(0);
        pool.install(|| {
            par_for_each_particle(10_000, |_, worker| {
                max_seen.fetch_max(worker, Ordering::Relaxed);
            });
        });
        assert!(max_seen.load(Ordering::Relaxed) < num_threads);
    }
}
