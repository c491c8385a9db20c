use tracing::{debug, trace};

use crate::{
    concurrency::build_thread_pool,
    counters::{write_statistics, PerformanceCounters, ValueCounters},
    equation::StepContext,
    error::EvalError,
    evaluator_parameters::EvaluatorParams,
    floating_type_mod::FT,
    group::{ExecutionContext, Group},
    neighborhood_search::{NeighborScratch, NeighborSource},
    particle_array::{ParticleArray, ParticleArrayView},
    sph_kernels::SmoothingKernel,
    thread_safe_ptr::ThreadSafeMutPtr,
    timestep::{AdaptiveTimestep, LocalReduction, TimestepAccumulator, TimestepReduction, DT_SENTINEL},
};

#[cfg(test)]
mod tests;

/// Runs an ordered list of equation groups over a set of particle arrays.
///
/// The evaluator owns the arrays. Their storage is only reachable mutably
/// through [`replace_collections`](Self::replace_collections),
/// [`update_collection`](Self::update_collection) and
/// [`property_mut`](Self::property_mut), none of which can change a particle
/// count behind the back of the views.
pub struct AccelerationEvaluator {
    arrays: Vec<ParticleArray>,
    views: Vec<ParticleArrayView>,
    groups: Vec<Group>,
    neighbor_source: Option<Box<dyn NeighborSource>>,
    kernel: Box<dyn SmoothingKernel>,

    pool: rayon::ThreadPool,
    num_threads: usize,
    scratch: Vec<NeighborScratch>,

    reduction: Box<dyn TimestepReduction>,
    timestep: AdaptiveTimestep,

    pcounters: PerformanceCounters,
    vcounters: ValueCounters,
}

impl AccelerationEvaluator {
    /// Binds `groups` to `arrays`; every configuration error surfaces here.
    pub fn new(
        mut arrays: Vec<ParticleArray>,
        mut groups: Vec<Group>,
        kernel: Box<dyn SmoothingKernel>,
        params: &EvaluatorParams,
    ) -> Result<Self, EvalError> {
        for (i, array) in arrays.iter().enumerate() {
            if arrays[..i].iter().any(|a| a.name() == array.name()) {
                return Err(EvalError::DuplicateArray(array.name().to_string()));
            }
        }

        let views = arrays
            .iter_mut()
            .enumerate()
            .map(|(index, array)| ParticleArrayView::new(index, array))
            .collect::<Result<Vec<_>, _>>()?;

        for group in &mut groups {
            group.bind(&views)?;
        }

        let num_threads = params.resolved_num_threads();
        let pool = build_thread_pool(num_threads)?;

        debug!(
            num_arrays = arrays.len(),
            num_groups = groups.len(),
            num_threads,
            "acceleration evaluator bound"
        );

        Ok(AccelerationEvaluator {
            arrays,
            views,
            groups,
            neighbor_source: None,
            kernel,
            pool,
            num_threads,
            scratch: (0..num_threads).map(|_| NeighborScratch::default()).collect(),
            reduction: Box::new(LocalReduction),
            timestep: AdaptiveTimestep::unset(),
            pcounters: PerformanceCounters::new(params.collect_statistics),
            vcounters: ValueCounters::new(params.collect_statistics),
        })
    }

    /// Installs (or replaces) the neighbor source and builds it for the
    /// current particle positions.
    pub fn attach_neighbor_source(&mut self, mut source: Box<dyn NeighborSource>) -> Result<(), EvalError> {
        source.update_domain();
        self.pool.install(|| source.update(&self.arrays))?;
        self.neighbor_source = Some(source);
        Ok(())
    }

    pub fn set_timestep_reduction(&mut self, reduction: Box<dyn TimestepReduction>) {
        self.reduction = reduction;
    }

    fn array_index(&self, name: &str) -> Result<usize, EvalError> {
        self.arrays
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| EvalError::UnknownArray(name.to_string()))
    }

    /// Replaces the storage of the named arrays and rebinds their views in
    /// place, keeping view indices and property ids.
    ///
    /// Nothing is replaced if any of the arrays is unknown or incompatible.
    pub fn replace_collections(&mut self, collections: Vec<ParticleArray>) -> Result<(), EvalError> {
        let mut targets = Vec::with_capacity(collections.len());
        for (i, collection) in collections.iter().enumerate() {
            if collections[..i].iter().any(|c| c.name() == collection.name()) {
                return Err(EvalError::DuplicateArray(collection.name().to_string()));
            }
            let index = self.array_index(collection.name())?;
            self.views[index].check_compatible(collection)?;
            for group in &self.groups {
                group.check_replacement(index, collection)?;
            }
            targets.push(index);
        }

        for (index, collection) in targets.into_iter().zip(collections) {
            self.arrays[index] = collection;
            self.views[index].rebind(&mut self.arrays[index])?;
            trace!(
                array = self.views[index].name(),
                num_real = self.views[index].size(true),
                num_all = self.views[index].size(false),
                "rebound particle array"
            );
        }

        self.update_neighbors()
    }

    /// Applies `f` to a copy of the named array and swaps it in with
    /// [`replace_collections`](Self::replace_collections).
    pub fn update_collection<F: FnOnce(&mut ParticleArray)>(&mut self, name: &str, f: F) -> Result<(), EvalError> {
        let mut array = self.arrays[self.array_index(name)?].clone();
        f(&mut array);
        self.replace_collections(vec![array])
    }

    /// Rebuilds the attached neighbor source from the current positions.
    pub fn update_neighbors(&mut self) -> Result<(), EvalError> {
        if let Some(source) = self.neighbor_source.as_deref_mut() {
            self.pcounters.begin("neighbor-update");
            source.update_domain();
            let arrays = &self.arrays;
            self.pool.install(|| source.update(arrays))?;
            self.pcounters.end("neighbor-update");
        }
        Ok(())
    }

    /// Runs all groups once for time `t` and step `dt` and publishes the
    /// reduced time-step bounds.
    pub fn compute(&mut self, t: FT, dt: FT) -> Result<(), EvalError> {
        if self.neighbor_source.is_none() {
            if let Some(group) = self.groups.iter().find_map(Group::sourced_group) {
                return Err(EvalError::MissingNeighborSource(group.to_string()));
            }
        }

        self.pcounters.begin("compute");

        let mut accumulator = TimestepAccumulator::new(self.num_threads);

        let max_neighbors = self.max_neighbors_observed();
        for scratch in &mut self.scratch {
            scratch.reserve(max_neighbors);
        }

        let mut ctx = ExecutionContext {
            views: &self.views,
            arrays: &self.arrays,
            neighbors: self.neighbor_source.as_deref_mut(),
            kernel: &*self.kernel,
            scratch: ThreadSafeMutPtr::new(self.scratch.as_mut_ptr()),
            timestep: ThreadSafeMutPtr::new(accumulator.slots_ptr()),
            num_workers: self.num_threads,
            step: StepContext { t, dt },
            pcounters: &mut self.pcounters,
            vcounters: &mut self.vcounters,
        };

        let groups = &mut self.groups;
        self.pool.install(|| -> Result<(), EvalError> {
            for group in groups.iter_mut() {
                trace!(group = group.name(), t, "running group");
                group.run(&mut ctx)?;
            }
            Ok(())
        })?;

        self.timestep = self.reduction.all_reduce_max(accumulator.reduce());

        for (id, value) in [
            ("dt-cfl-bound", self.timestep.dt_cfl),
            ("dt-force-bound", self.timestep.dt_force),
            ("dt-viscous-bound", self.timestep.dt_viscous),
        ] {
            if value > DT_SENTINEL {
                self.vcounters.add_value(id, value as FT);
            }
        }
        self.pcounters.end("compute");

        trace!(
            t,
            dt,
            dt_cfl = self.timestep.dt_cfl,
            dt_force = self.timestep.dt_force,
            dt_viscous = self.timestep.dt_viscous,
            "compute finished"
        );
        Ok(())
    }

    /// Maximum over all workers of `|v| + c`-like CFL bounds of the last
    /// `compute`, or the sentinel `-1e20` if no equation reported one.
    pub fn dt_cfl(&self) -> f64 {
        self.timestep.dt_cfl
    }

    pub fn dt_force(&self) -> f64 {
        self.timestep.dt_force
    }

    pub fn dt_viscous(&self) -> f64 {
        self.timestep.dt_viscous
    }

    pub fn adaptive_timestep(&self) -> AdaptiveTimestep {
        self.timestep
    }

    pub fn collection(&self, name: &str) -> Option<&ParticleArray> {
        self.arrays.iter().find(|a| a.name() == name)
    }

    pub fn collections(&self) -> &[ParticleArray] {
        &self.arrays
    }

    /// Values of one property; the particle count cannot change through it.
    pub fn property_mut(&mut self, array: &str, property: &str) -> Result<&mut [FT], EvalError> {
        let index = self.array_index(array)?;
        self.arrays[index]
            .property_mut(property)
            .ok_or_else(|| EvalError::MissingProperty {
                array: array.to_string(),
                property: property.to_string(),
            })
    }

    pub fn view(&self, name: &str) -> Option<&ParticleArrayView> {
        self.views.iter().find(|v| v.name() == name)
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name() == name)
    }

    pub fn kernel(&self) -> &dyn SmoothingKernel {
        &*self.kernel
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Largest neighbor list a worker walked without a cache so far.
    pub fn max_neighbors_observed(&self) -> usize {
        self.scratch.iter().map(NeighborScratch::max_observed).max().unwrap_or(0)
    }

    /// Smallest smoothing length over the real particles of all arrays.
    pub fn min_smoothing_length(&self) -> Option<FT> {
        self.arrays
            .iter()
            .filter_map(|a| a.property("h").map(|h| &h[..a.num_real_particles()]))
            .flat_map(|h| h.iter().cloned())
            .filter(|&h| h > 0.)
            .fold(None, |acc: Option<FT>, h| Some(acc.map_or(h, |a| a.min(h))))
    }

    pub fn write_statistics(&self) -> String {
        write_statistics(&self.pcounters, &self.vcounters)
    }
}
