//! Per-worker time-step bound accumulation.
//!
//! Every worker owns one [`TimestepSlot`] during a `compute` pass. Slots are
//! padded to whole cache lines so that neighbouring workers never write into
//! the same line. After the pass the slots are max-reduced single threaded.

use crate::floating_type_mod::FT;

/// CFL, force and viscous bound.
pub const NUM_TIMESTEP_CRITERIA: usize = 3;
pub const CACHE_LINE_BYTES: usize = 64;
pub const DOUBLES_PER_CACHE_LINE: usize = CACHE_LINE_BYTES / std::mem::size_of::<f64>();
/// Length of one slot, rounded up to a whole number of cache lines.
pub const PADDED_BLOCK_LEN: usize =
    (NUM_TIMESTEP_CRITERIA + DOUBLES_PER_CACHE_LINE - 1) / DOUBLES_PER_CACHE_LINE * DOUBLES_PER_CACHE_LINE;
/// Initial value of every bound; anything an equation reports is larger.
pub const DT_SENTINEL: f64 = -1e20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestepCriterion {
    Cfl = 0,
    Force = 1,
    Viscous = 2,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct TimestepSlot {
    values: [f64; PADDED_BLOCK_LEN],
}

const _: () = assert!(std::mem::align_of::<TimestepSlot>() == CACHE_LINE_BYTES);
const _: () = assert!(std::mem::size_of::<TimestepSlot>() % CACHE_LINE_BYTES == 0);

impl Default for TimestepSlot {
    fn default() -> Self {
        TimestepSlot {
            values: [DT_SENTINEL; PADDED_BLOCK_LEN],
        }
    }
}

impl TimestepSlot {
    /// Raises the stored bound for `criterion` to `value` if it is larger.
    #[inline(always)]
    pub fn limit(&mut self, criterion: TimestepCriterion, value: FT) {
        let slot = &mut self.values[criterion as usize];
        *slot = slot.max(value as f64);
    }

    #[inline(always)]
    pub fn limit_cfl(&mut self, value: FT) {
        self.limit(TimestepCriterion::Cfl, value);
    }

    #[inline(always)]
    pub fn limit_force(&mut self, value: FT) {
        self.limit(TimestepCriterion::Force, value);
    }

    #[inline(always)]
    pub fn limit_viscous(&mut self, value: FT) {
        self.limit(TimestepCriterion::Viscous, value);
    }

    pub fn value(&self, criterion: TimestepCriterion) -> f64 {
        self.values[criterion as usize]
    }
}

pub struct TimestepAccumulator {
    slots: Vec<TimestepSlot>,
}

impl TimestepAccumulator {
    pub fn new(num_threads: usize) -> Self {
        TimestepAccumulator {
            slots: vec![TimestepSlot::default(); num_threads.max(1)],
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_mut(&mut self, worker: usize) -> &mut TimestepSlot {
        &mut self.slots[worker]
    }

    pub(crate) fn slots_ptr(&mut self) -> *mut TimestepSlot {
        self.slots.as_mut_ptr()
    }

    pub fn reduce(&self) -> AdaptiveTimestep {
        let mut result = AdaptiveTimestep::unset();
        for slot in &self.slots {
            result.dt_cfl = result.dt_cfl.max(slot.value(TimestepCriterion::Cfl));
            result.dt_force = result.dt_force.max(slot.value(TimestepCriterion::Force));
            result.dt_viscous = result.dt_viscous.max(slot.value(TimestepCriterion::Viscous));
        }
        result
    }
}

/// Globally reduced bounds published after a `compute` pass.
///
/// A bound that no equation reported keeps the value [`DT_SENTINEL`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveTimestep {
    pub dt_cfl: f64,
    pub dt_force: f64,
    pub dt_viscous: f64,
}

impl AdaptiveTimestep {
    pub fn unset() -> Self {
        AdaptiveTimestep {
            dt_cfl: DT_SENTINEL,
            dt_force: DT_SENTINEL,
            dt_viscous: DT_SENTINEL,
        }
    }

    /// Stable step for the smallest smoothing length `h_min`.
    ///
    /// The bounds are maxima of `|v| + c`, `|a|^2` and `nu / (0.125 h)`.
    /// Returns `None` if no bound was reported.
    pub fn stable_dt(&self, h_min: FT, cfl: FT) -> Option<FT> {
        let h = h_min as f64;
        let candidates = [
            (self.dt_cfl, h / self.dt_cfl),
            (self.dt_force, (h / self.dt_force.sqrt()).sqrt()),
            (self.dt_viscous, h / self.dt_viscous),
        ];

        candidates
            .iter()
            .filter(|(bound, _)| *bound > 0.)
            .map(|&(_, dt)| dt)
            .fold(None, |acc: Option<f64>, dt| Some(acc.map_or(dt, |a| a.min(dt))))
            .map(|dt| cfl * dt as FT)
    }
}

/// Combines the locally reduced bounds of several evaluators, e.g. across
/// processes.
pub trait TimestepReduction: Send + Sync {
    fn all_reduce_max(&self, local: AdaptiveTimestep) -> AdaptiveTimestep;
}

/// Single process: the local maximum is the global one.
pub struct LocalReduction;

impl TimestepReduction for LocalReduction {
    fn all_reduce_max(&self, local: AdaptiveTimestep) -> AdaptiveTimestep {
        local
    }
}

#[test]
fn padded_block_covers_whole_cache_lines() {
    assert_eq!(DOUBLES_PER_CACHE_LINE, 8);
    assert_eq!(PADDED_BLOCK_LEN, 8);
    assert!(PADDED_BLOCK_LEN >= NUM_TIMESTEP_CRITERIA);

    let mut accumulator = TimestepAccumulator::new(4);
    let base = accumulator.slots_ptr() as usize;
    assert_eq!(base % CACHE_LINE_BYTES, 0);
    for worker in 1..4 {
        let addr = accumulator.slot_mut(worker) as *mut TimestepSlot as usize;
        assert_eq!(addr - base, worker * PADDED_BLOCK_LEN * std::mem::size_of::<f64>());
    }
}

#[test]
fn reduce_surfaces_maximum_of_single_worker() {
    let mut accumulator = TimestepAccumulator::new(8);
    accumulator.slot_mut(5).limit_cfl(3.5);
    accumulator.slot_mut(2).limit_cfl(1.25);
    accumulator.slot_mut(7).limit_force(9.);

    let reduced = accumulator.reduce();
    assert_eq!(reduced.dt_cfl, 3.5);
    assert_eq!(reduced.dt_force, 9.);
    assert_eq!(reduced.dt_viscous, DT_SENTINEL);
}

#[test]
fn slot_limit_only_increases() {
    let mut slot = TimestepSlot::default();
    slot.limit_viscous(2.);
    slot.limit_viscous(1.);
    assert_eq!(slot.value(TimestepCriterion::Viscous), 2.);
}

#[test]
fn stable_dt_takes_minimum_of_reported_bounds() {
    assert_eq!(AdaptiveTimestep::unset().stable_dt(0.1, 0.3), None);

    let bounds = AdaptiveTimestep {
        dt_cfl: 10.,
        dt_force: 16.,
        dt_viscous: DT_SENTINEL,
    };
    // h / cfl_bound = 0.01, sqrt(h / sqrt(force_bound)) = sqrt(0.025)
    let dt = bounds.stable_dt(0.1, 0.5).unwrap();
    crate::assert_ft_approx_eq(dt, 0.005, 1e-6, || "stable dt".to_string());
}
