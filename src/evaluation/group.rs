use enum_dispatch::enum_dispatch;
use tracing::{debug, trace};

use crate::{
    concurrency::par_for_each_particle,
    counters::{PerformanceCounters, ValueCounters},
    equation::{DestinationArrays, Equation, PairGeometry, SourceArrays, StepContext},
    error::EvalError,
    floating_type_mod::FT,
    neighborhood_search::{NeighborScratch, NeighborSource},
    particle_array::{ParticleArray, ParticleArrayView, PropertyId},
    sph_kernels::SmoothingKernel,
    thread_safe_ptr::ThreadSafeMutPtr,
    timestep::TimestepSlot,
};

pub type GroupCondition = Box<dyn Fn(FT, FT) -> bool + Send + Sync>;
pub type ConvergencePredicate = Box<dyn Fn(&ConvergenceCheck) -> bool + Send + Sync>;

/// What a convergence predicate gets to look at after a body execution.
pub struct ConvergenceCheck<'a> {
    iteration: usize,
    equations_converged: bool,
    arrays: &'a [ParticleArray],
}

impl<'a> ConvergenceCheck<'a> {
    /// Number of body executions so far in this run of the group, starting at 1.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn equations_converged(&self) -> bool {
        self.equations_converged
    }

    pub fn arrays(&self) -> &'a [ParticleArray] {
        self.arrays
    }

    pub fn array(&self, name: &str) -> Option<&'a ParticleArray> {
        self.arrays.iter().find(|a| a.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationPolicy {
    pub min_iterations: usize,
    pub max_iterations: usize,
}

/// Everything a group needs during one `compute` pass.
pub(crate) struct ExecutionContext<'a> {
    pub views: &'a [ParticleArrayView],
    pub arrays: &'a [ParticleArray],
    pub neighbors: Option<&'a mut (dyn NeighborSource + 'static)>,
    pub kernel: &'a dyn SmoothingKernel,
    /// One entry per worker.
    pub scratch: ThreadSafeMutPtr<NeighborScratch>,
    /// One entry per worker.
    pub timestep: ThreadSafeMutPtr<TimestepSlot>,
    pub num_workers: usize,
    pub step: StepContext,
    pub pcounters: &'a mut PerformanceCounters,
    pub vcounters: &'a mut ValueCounters,
}

impl<'a> ExecutionContext<'a> {
    fn refresh_neighbors(&mut self) -> Result<(), EvalError> {
        if let Some(neighbors) = self.neighbors.as_deref_mut() {
            self.pcounters.begin("neighbor-update");
            neighbors.update_domain();
            neighbors.update(self.arrays)?;
            self.pcounters.end("neighbor-update");
        }
        Ok(())
    }
}

#[enum_dispatch]
pub(crate) trait ExecuteGroup {
    fn bind(&mut self, views: &[ParticleArrayView]) -> Result<(), EvalError>;

    /// Runs the body once, without the group's own iteration, condition and
    /// neighbor refresh.
    fn execute_once(&mut self, real: bool, ctx: &mut ExecutionContext) -> Result<(), EvalError>;

    fn equations_converged(&self) -> bool;

    /// Whether any equation of the body has sources.
    fn needs_neighbors(&self) -> bool;

    /// Checks that `array` could replace the bound array at `index`.
    fn check_replacement(&self, index: usize, array: &ParticleArray) -> Result<(), EvalError>;
}

#[enum_dispatch(ExecuteGroup)]
pub(crate) enum GroupBody {
    LeafGroup(LeafGroup),
    SequentialGroup(SequentialGroup),
}

/// Ordered partition of equations by destination array, the unit the
/// evaluator schedules.
///
/// A group either holds equations directly or an ordered list of subgroups.
/// An iterative group executes its body until it has converged (all
/// equations report `converged()` and the optional predicate holds) or the
/// maximum number of iterations is reached.
pub struct Group {
    name: String,
    counter_id: String,
    body: GroupBody,
    real: bool,
    update_nnps: bool,
    condition: Option<GroupCondition>,
    iteration: Option<IterationPolicy>,
    predicate: Option<ConvergencePredicate>,
    iteration_count: usize,
    last_iteration_count: usize,
}

impl Group {
    fn with_body(name: impl Into<String>, body: GroupBody) -> Self {
        let name = name.into();
        Group {
            counter_id: format!("group:{}", name),
            name,
            body,
            real: true,
            update_nnps: false,
            condition: None,
            iteration: None,
            predicate: None,
            iteration_count: 1,
            last_iteration_count: 0,
        }
    }

    pub fn new(name: impl Into<String>, equations: Vec<Box<dyn Equation>>) -> Self {
        Self::with_body(name, GroupBody::from(LeafGroup::new(equations)))
    }

    pub fn with_subgroups(name: impl Into<String>, groups: Vec<Group>) -> Self {
        Self::with_body(name, GroupBody::from(SequentialGroup { groups }))
    }

    /// Loop over real particles only (default) or over all particles.
    pub fn real(mut self, real: bool) -> Self {
        self.real = real;
        self
    }

    /// Refresh the neighbor source after every execution of the body.
    pub fn update_nnps(mut self, update_nnps: bool) -> Self {
        self.update_nnps = update_nnps;
        self
    }

    /// Skip the group in a `compute` pass when `condition(t, dt)` is false.
    pub fn condition<F: Fn(FT, FT) -> bool + Send + Sync + 'static>(mut self, condition: F) -> Self {
        self.condition = Some(Box::new(condition));
        self
    }

    pub fn iterate(mut self, min_iterations: usize, max_iterations: usize) -> Self {
        self.iteration = Some(IterationPolicy {
            min_iterations,
            max_iterations,
        });
        self
    }

    pub fn converged_when<F: Fn(&ConvergenceCheck) -> bool + Send + Sync + 'static>(mut self, predicate: F) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_real(&self) -> bool {
        self.real
    }

    pub fn is_iterative(&self) -> bool {
        self.iteration.is_some()
    }

    pub fn iteration_policy(&self) -> Option<IterationPolicy> {
        self.iteration
    }

    /// Current iteration counter. It is 1 whenever the group is not running.
    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    /// Body executions of the most recent run of an iterative group.
    pub fn last_iteration_count(&self) -> usize {
        self.last_iteration_count
    }

    pub fn subgroups(&self) -> &[Group] {
        match &self.body {
            GroupBody::SequentialGroup(sequential) => &sequential.groups,
            GroupBody::LeafGroup(_) => &[],
        }
    }

    pub(crate) fn bind(&mut self, views: &[ParticleArrayView]) -> Result<(), EvalError> {
        if let Some(policy) = self.iteration {
            if policy.max_iterations == 0 || policy.min_iterations > policy.max_iterations {
                return Err(EvalError::InvalidIterationBounds {
                    group: self.name.clone(),
                    min: policy.min_iterations,
                    max: policy.max_iterations,
                });
            }
        }
        self.body.bind(views)
    }

    pub(crate) fn check_replacement(&self, index: usize, array: &ParticleArray) -> Result<(), EvalError> {
        self.body.check_replacement(index, array)
    }

    /// Name of the first (sub)group holding equations with sources.
    pub(crate) fn sourced_group(&self) -> Option<&str> {
        match &self.body {
            GroupBody::LeafGroup(leaf) => leaf.needs_neighbors().then(|| self.name.as_str()),
            GroupBody::SequentialGroup(sequential) => sequential.groups.iter().find_map(Group::sourced_group),
        }
    }

    fn execute_body(&mut self, ctx: &mut ExecutionContext) -> Result<(), EvalError> {
        self.body.execute_once(self.real, ctx)?;
        if self.update_nnps {
            trace!(group = %self.name, "refreshing neighbor source");
            ctx.refresh_neighbors()?;
        }
        Ok(())
    }

    fn is_converged(&self, arrays: &[ParticleArray]) -> bool {
        let equations_converged = self.body.equations_converged();
        let predicate_holds = self.predicate.as_ref().map_or(true, |predicate| {
            predicate(&ConvergenceCheck {
                iteration: self.iteration_count,
                equations_converged,
                arrays,
            })
        });
        equations_converged && predicate_holds
    }

    pub(crate) fn run(&mut self, ctx: &mut ExecutionContext) -> Result<(), EvalError> {
        if let Some(condition) = &self.condition {
            if !condition(ctx.step.t, ctx.step.dt) {
                trace!(group = %self.name, t = ctx.step.t, "condition false, skipping group");
                return Ok(());
            }
        }

        ctx.pcounters.begin(&self.counter_id);

        let result = match self.iteration {
            None => self.execute_body(ctx),
            Some(policy) => {
                self.iteration_count = 1;
                let result = self.run_iterations(policy, ctx);
                self.iteration_count = 1;
                result
            }
        };

        ctx.pcounters.end(&self.counter_id);
        result
    }

    fn run_iterations(&mut self, policy: IterationPolicy, ctx: &mut ExecutionContext) -> Result<(), EvalError> {
        loop {
            self.execute_body(ctx)?;
            let converged = self.is_converged(ctx.arrays);

            if self.iteration_count < policy.min_iterations
                || (!converged && self.iteration_count < policy.max_iterations)
            {
                self.iteration_count += 1;
                continue;
            }

            if converged {
                debug!(group = %self.name, iterations = self.iteration_count, "group converged");
            } else {
                debug!(
                    group = %self.name,
                    iterations = self.iteration_count,
                    "group did not converge, stopping at max iterations"
                );
            }
            ctx.vcounters
                .add_value(&format!("iterations:{}", self.name), self.iteration_count as FT);
            self.last_iteration_count = self.iteration_count;
            return Ok(());
        }
    }
}

/// Subgroups executed in declared order.
pub(crate) struct SequentialGroup {
    groups: Vec<Group>,
}

impl ExecuteGroup for SequentialGroup {
    fn bind(&mut self, views: &[ParticleArrayView]) -> Result<(), EvalError> {
        for group in &mut self.groups {
            group.bind(views)?;
        }
        Ok(())
    }

    fn execute_once(&mut self, _real: bool, ctx: &mut ExecutionContext) -> Result<(), EvalError> {
        for group in &mut self.groups {
            group.run(ctx)?;
        }
        Ok(())
    }

    fn equations_converged(&self) -> bool {
        self.groups.iter().all(|group| group.body.equations_converged())
    }

    fn needs_neighbors(&self) -> bool {
        self.groups.iter().any(|group| group.body.needs_neighbors())
    }

    fn check_replacement(&self, index: usize, array: &ParticleArray) -> Result<(), EvalError> {
        for group in &self.groups {
            group.check_replacement(index, array)?;
        }
        Ok(())
    }
}

struct BoundEquation {
    equation: Box<dyn Equation>,
    dst: usize,
    dst_properties: Vec<PropertyId>,
    dst_constants: Vec<usize>,
    // one list per entry of `equation.sources()`
    src_properties: Vec<Vec<PropertyId>>,
}

impl BoundEquation {
    #[inline(always)]
    fn destination<'a>(&'a self, view: &'a ParticleArrayView) -> DestinationArrays<'a> {
        DestinationArrays::new(view, &self.dst_properties, &self.dst_constants)
    }

    #[inline(always)]
    fn source<'a>(&'a self, view: &'a ParticleArrayView, slot: usize) -> SourceArrays<'a> {
        SourceArrays::new(view, &self.src_properties[slot])
    }
}

struct SourcePartition {
    src: usize,
    // (equation index, position of this source in the equation's source list)
    equations: Vec<(usize, usize)>,
}

struct DestinationPartition {
    dst: usize,
    no_source: Vec<usize>,
    sources: Vec<SourcePartition>,
    all: Vec<usize>,
}

/// Equations partitioned by destination, the destinations in order of first
/// appearance.
pub(crate) struct LeafGroup {
    equations: Vec<BoundEquation>,
    destinations: Vec<DestinationPartition>,
}

/// Rejects destination constants with fewer entries than `equation` reads.
fn check_constant_lens(
    equation: &dyn Equation,
    array: &str,
    len_of: impl Fn(&str) -> usize,
) -> Result<(), EvalError> {
    let min_lens = equation.destination_constant_lens();
    for (k, name) in equation.destination_constants().iter().enumerate() {
        let expected = min_lens.get(k).copied().unwrap_or(1);
        let got = len_of(name);
        if got < expected {
            return Err(EvalError::ConstantTooShort {
                array: array.to_string(),
                constant: name.to_string(),
                expected,
                got,
            });
        }
    }
    Ok(())
}

fn view_index(views: &[ParticleArrayView], name: &str) -> Result<usize, EvalError> {
    views
        .iter()
        .position(|view| view.name() == name)
        .ok_or_else(|| EvalError::UnknownArray(name.to_string()))
}

impl LeafGroup {
    fn new(equations: Vec<Box<dyn Equation>>) -> Self {
        LeafGroup {
            equations: equations
                .into_iter()
                .map(|equation| BoundEquation {
                    equation,
                    dst: 0,
                    dst_properties: Vec::new(),
                    dst_constants: Vec::new(),
                    src_properties: Vec::new(),
                })
                .collect(),
            destinations: Vec::new(),
        }
    }

    fn bind_equation(bound: &mut BoundEquation, views: &[ParticleArrayView]) -> Result<(usize, Vec<usize>), EvalError> {
        let equation = &bound.equation;

        let dst = view_index(views, equation.destination())?;
        let dst_view = &views[dst];
        bound.dst_properties = equation
            .destination_properties()
            .iter()
            .map(|name| dst_view.property_id(name))
            .collect::<Result<_, _>>()?;
        bound.dst_constants = equation
            .destination_constants()
            .iter()
            .map(|name| dst_view.constant_id(name))
            .collect::<Result<_, _>>()?;
        check_constant_lens(&**equation, dst_view.name(), |name| {
            dst_view.constant_id(name).map_or(0, |id| dst_view.constant_len(id))
        })?;
        bound.dst = dst;

        let sources = equation.sources();
        let mut src_indices = Vec::with_capacity(sources.len());
        bound.src_properties.clear();
        for (slot, source) in sources.iter().enumerate() {
            if sources[..slot].contains(source) {
                return Err(EvalError::DuplicateSource {
                    equation: equation.name().to_string(),
                    source_array: source.clone(),
                });
            }
            let src = view_index(views, source)?;
            let src_view = &views[src];
            bound.src_properties.push(
                equation
                    .source_properties()
                    .iter()
                    .map(|name| src_view.property_id(name))
                    .collect::<Result<_, _>>()?,
            );
            src_indices.push(src);
        }

        Ok((dst, src_indices))
    }

    fn execute_destination(
        &mut self,
        partition_idx: usize,
        real: bool,
        ctx: &mut ExecutionContext,
    ) -> Result<(), EvalError> {
        let partition = &self.destinations[partition_idx];
        let equations = &self.equations;
        let views = ctx.views;
        let kernel = ctx.kernel;
        let step = ctx.step;
        let num_workers = ctx.num_workers;

        let d_view = &views[partition.dst];
        let n = d_view.size(real);

        let initialize: Vec<&BoundEquation> = partition
            .all
            .iter()
            .map(|&i| &equations[i])
            .filter(|eq| eq.equation.has_initialize())
            .collect();
        if !initialize.is_empty() {
            par_for_each_particle(n, |d_idx, _| {
                for eq in &initialize {
                    eq.equation.initialize(d_idx, &eq.destination(d_view), &step);
                }
            });
        }

        let single: Vec<&BoundEquation> = partition
            .no_source
            .iter()
            .map(|&i| &equations[i])
            .filter(|eq| eq.equation.has_loop())
            .collect();
        if !single.is_empty() {
            par_for_each_particle(n, |d_idx, _| {
                for eq in &single {
                    eq.equation.loop_single(d_idx, &eq.destination(d_view), &step);
                }
            });
        }

        for source in &partition.sources {
            let pair_equations: Vec<(&BoundEquation, usize)> = source
                .equations
                .iter()
                .map(|&(i, slot)| (&equations[i], slot))
                .filter(|(eq, _)| eq.equation.has_loop())
                .collect();
            if pair_equations.is_empty() {
                continue;
            }

            let s_view = &views[source.src];
            let neighbors: &mut dyn NeighborSource = match ctx.neighbors.as_deref_mut() {
                Some(neighbors) => neighbors,
                None => return Err(EvalError::MissingNeighborSource(d_view.name().to_string())),
            };
            neighbors.set_context(source.src, partition.dst);
            let neighbors: &dyn NeighborSource = neighbors;

            let scratch = ctx.scratch;
            par_for_each_particle(n, |d_idx, worker| {
                assert!(worker < num_workers);
                let scratch = unsafe { scratch.element_mut(worker) };

                let neighbor_list = neighbors.get_neighbors(d_idx, &mut scratch.indices);
                let num_neighbors = neighbor_list.len();
                for &s_idx in neighbor_list {
                    let s_idx = s_idx as usize;
                    let pair = PairGeometry::evaluate(d_view, d_idx, s_view, s_idx, kernel);
                    for (eq, slot) in &pair_equations {
                        eq.equation.loop_pair(
                            d_idx,
                            s_idx,
                            &eq.destination(d_view),
                            &eq.source(s_view, *slot),
                            &pair,
                            &step,
                        );
                    }
                }
                scratch.observe(num_neighbors);
            });
        }

        let post_loop: Vec<&BoundEquation> = partition
            .all
            .iter()
            .map(|&i| &equations[i])
            .filter(|eq| eq.equation.has_post_loop())
            .collect();
        if !post_loop.is_empty() {
            let timestep = ctx.timestep;
            par_for_each_particle(n, |d_idx, worker| {
                assert!(worker < num_workers);
                let slot = unsafe { timestep.element_mut(worker) };
                for eq in &post_loop {
                    eq.equation.post_loop(d_idx, &eq.destination(d_view), slot, &step);
                }
            });
        }

        for &i in &partition.all {
            let BoundEquation {
                equation,
                dst_properties,
                dst_constants,
                ..
            } = &mut self.equations[i];
            if equation.has_reduce() {
                equation.reduce(&DestinationArrays::new(d_view, dst_properties, dst_constants), &step);
            }
        }

        Ok(())
    }
}

impl ExecuteGroup for LeafGroup {
    fn bind(&mut self, views: &[ParticleArrayView]) -> Result<(), EvalError> {
        let mut destinations: Vec<DestinationPartition> = Vec::new();

        for (eq_idx, bound) in self.equations.iter_mut().enumerate() {
            let (dst, src_indices) = Self::bind_equation(bound, views)?;

            let partition_idx = match destinations.iter().position(|p| p.dst == dst) {
                Some(idx) => idx,
                None => {
                    destinations.push(DestinationPartition {
                        dst,
                        no_source: Vec::new(),
                        sources: Vec::new(),
                        all: Vec::new(),
                    });
                    destinations.len() - 1
                }
            };
            let partition = &mut destinations[partition_idx];
            partition.all.push(eq_idx);

            if src_indices.is_empty() {
                partition.no_source.push(eq_idx);
            }
            for (slot, src) in src_indices.into_iter().enumerate() {
                match partition.sources.iter_mut().find(|s| s.src == src) {
                    Some(source) => source.equations.push((eq_idx, slot)),
                    None => partition.sources.push(SourcePartition {
                        src,
                        equations: vec![(eq_idx, slot)],
                    }),
                }
            }
        }

        self.destinations = destinations;
        Ok(())
    }

    fn check_replacement(&self, index: usize, array: &ParticleArray) -> Result<(), EvalError> {
        for bound in self.equations.iter().filter(|bound| bound.dst == index) {
            check_constant_lens(&*bound.equation, array.name(), |name| {
                array.constant(name).map_or(0, |values| values.len())
            })?;
        }
        Ok(())
    }

    fn execute_once(&mut self, real: bool, ctx: &mut ExecutionContext) -> Result<(), EvalError> {
        for partition_idx in 0..self.destinations.len() {
            self.execute_destination(partition_idx, real, ctx)?;
        }
        Ok(())
    }

    fn equations_converged(&self) -> bool {
        self.equations.iter().all(|eq| eq.equation.converged())
    }

    fn needs_neighbors(&self) -> bool {
        self.equations.iter().any(|eq| !eq.equation.sources().is_empty())
    }
}
