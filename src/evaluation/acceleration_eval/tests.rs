use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::AccelerationEvaluator;
use crate::{
    equation::{DestinationArrays, Equation, PairGeometry, SourceArrays, StepContext},
    equations::{MomentumEquation, SummationDensity, TaitEos, TotalMass, XsphCorrection},
    error::EvalError,
    evaluator_parameters::{EvaluatorParams, NeighborhoodSearchAlgorithm},
    floating_type_mod::FT,
    group::Group,
    neighborhood_search::{NeighborSource, NeighborhoodSearch},
    particle_array::{ParticleArray, ParticleTag},
    sph_kernels::{CubicSpline, SmoothingKernel},
    timestep::{AdaptiveTimestep, TimestepReduction, TimestepSlot, DT_SENTINEL},
    V3,
};

fn boxed<E: Equation + 'static>(equation: E) -> Box<dyn Equation> {
    Box::new(equation)
}

fn params(num_threads: usize) -> EvaluatorParams {
    EvaluatorParams::default().with_num_threads(num_threads)
}

/// Constant kernel with a linear, antisymmetric gradient.
struct LinearKernel;

impl SmoothingKernel for LinearKernel {
    fn kernel(&self, _xij: &V3, _rij: FT, _h: FT) -> FT {
        1.
    }

    fn gradient(&self, xij: &V3, _rij: FT, _h: FT) -> V3 {
        -xij
    }

    fn radius_scale(&self) -> FT {
        2.
    }
}

/// Every source particle is a neighbor of every destination particle.
struct AllPairs {
    sizes: Vec<usize>,
    src: usize,
    updates: Arc<AtomicUsize>,
}

impl AllPairs {
    fn new(updates: Arc<AtomicUsize>) -> Self {
        AllPairs {
            sizes: Vec::new(),
            src: 0,
            updates,
        }
    }
}

impl NeighborSource for AllPairs {
    fn set_context(&mut self, src_index: usize, _dst_index: usize) {
        self.src = src_index;
    }

    fn get_neighbors<'a>(&'a self, _d_idx: usize, scratch: &'a mut Vec<u32>) -> &'a [u32] {
        scratch.clear();
        scratch.extend(0..self.sizes[self.src] as u32);
        scratch
    }

    fn update(&mut self, arrays: &[ParticleArray]) -> Result<(), EvalError> {
        self.sizes = arrays.iter().map(|a| a.num_particles()).collect();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// `rho = 2 x + 1`
struct ClosedForm {
    dest: String,
}

impl ClosedForm {
    fn new(dest: &str) -> Self {
        ClosedForm { dest: dest.to_string() }
    }
}

impl Equation for ClosedForm {
    fn destination(&self) -> &str {
        &self.dest
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["x", "rho"]
    }

    fn has_loop(&self) -> bool {
        true
    }

    fn loop_single(&self, d_idx: usize, d: &DestinationArrays, _ctx: &StepContext) {
        d.set(1, d_idx, 2. * d.get(0, d_idx) + 1.);
    }
}

/// `au_i = sum_j m_j dW_ij.x`
struct PairSum {
    dest: String,
    sources: Vec<String>,
}

impl PairSum {
    fn new(dest: &str, sources: &[&str]) -> Self {
        PairSum {
            dest: dest.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Equation for PairSum {
    fn destination(&self) -> &str {
        &self.dest
    }

    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["au"]
    }

    fn source_properties(&self) -> &[&'static str] {
        &["m"]
    }

    fn has_initialize(&self) -> bool {
        true
    }

    fn initialize(&self, d_idx: usize, d: &DestinationArrays, _ctx: &StepContext) {
        d.set(0, d_idx, 0.);
    }

    fn has_loop(&self) -> bool {
        true
    }

    fn loop_pair(
        &self,
        d_idx: usize,
        s_idx: usize,
        d: &DestinationArrays,
        s: &SourceArrays,
        pair: &PairGeometry,
        _ctx: &StepContext,
    ) {
        d.add(0, d_idx, s.get(0, s_idx) * pair.dwij.x);
    }
}

/// Counts body executions in `reduce` and converges after a fixed number.
struct CountBodies {
    dest: String,
    executions: Arc<AtomicUsize>,
    converge_after: usize,
    seen: usize,
}

impl CountBodies {
    fn new(dest: &str, executions: Arc<AtomicUsize>, converge_after: usize) -> Self {
        CountBodies {
            dest: dest.to_string(),
            executions,
            converge_after,
            seen: 0,
        }
    }
}

impl Equation for CountBodies {
    fn destination(&self) -> &str {
        &self.dest
    }

    fn has_reduce(&self) -> bool {
        true
    }

    fn reduce(&mut self, _d: &DestinationArrays, _ctx: &StepContext) {
        self.seen += 1;
        self.executions.fetch_add(1, Ordering::SeqCst);
    }

    fn converged(&self) -> bool {
        self.seen >= self.converge_after
    }
}

/// Appends its label to a shared log whenever its body runs.
struct Recorder {
    dest: String,
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Equation for Recorder {
    fn destination(&self) -> &str {
        &self.dest
    }

    fn has_reduce(&self) -> bool {
        true
    }

    fn reduce(&mut self, _d: &DestinationArrays, _ctx: &StepContext) {
        self.log.lock().unwrap().push(self.label);
    }
}

/// Reports `x` as CFL bound and `x^2` as force bound.
struct BoundFromX {
    dest: String,
}

impl Equation for BoundFromX {
    fn destination(&self) -> &str {
        &self.dest
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["x"]
    }

    fn has_post_loop(&self) -> bool {
        true
    }

    fn post_loop(&self, d_idx: usize, d: &DestinationArrays, dt_slot: &mut TimestepSlot, _ctx: &StepContext) {
        let x = d.get(0, d_idx);
        dt_slot.limit_cfl(x);
        dt_slot.limit_force(x * x);
    }
}

fn line_array(name: &str, x: Vec<FT>) -> ParticleArray {
    let n = x.len();
    ParticleArray::new(name, n)
        .with_property("x", x)
        .with_property("m", vec![1.; n])
        .with_property("h", vec![1.; n])
}

fn with_ghosts(mut array: ParticleArray, num_real: usize) -> ParticleArray {
    let n = array.num_particles();
    let tags = (0..n)
        .map(|i| {
            if i < num_real {
                ParticleTag::Local as i32
            } else {
                ParticleTag::Ghost as i32
            }
        })
        .collect();
    array = array.with_tags(tags);
    array.set_num_real_particles(num_real);
    array
}

fn random_x(seed: u64, n: usize) -> Vec<FT> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1.0..3.0)).collect()
}

#[test]
fn closed_form_update_is_independent_of_thread_count() {
    let x = random_x(1, 1000);

    let mut results = Vec::new();
    for num_threads in [1, 2, 8] {
        let mut evaluator = AccelerationEvaluator::new(
            vec![line_array("fluid", x.clone())],
            vec![Group::new("closed-form", vec![boxed(ClosedForm::new("fluid"))])],
            Box::new(LinearKernel),
            &params(num_threads),
        )
        .unwrap();
        assert_eq!(evaluator.num_threads(), num_threads);
        evaluator.compute(0., 0.1).unwrap();
        results.push(evaluator.collection("fluid").unwrap().property("rho").unwrap().to_vec());
    }

    for (i, &xi) in x.iter().enumerate() {
        assert_eq!(results[0][i], 2. * xi + 1.);
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], results[2]);
}

#[test]
fn symmetric_pair_interaction_sums_to_zero() {
    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("line", vec![0., 1., 2.])],
        vec![Group::new("pairs", vec![boxed(PairSum::new("line", &["line"]))])],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    evaluator
        .attach_neighbor_source(Box::new(AllPairs::new(Arc::new(AtomicUsize::new(0)))))
        .unwrap();
    evaluator.compute(0., 0.1).unwrap();

    let au = evaluator.collection("line").unwrap().property("au").unwrap();
    assert_eq!(au, &[3., 0., -3.]);
    assert_eq!(au.iter().sum::<FT>(), 0.);
    assert_eq!(evaluator.max_neighbors_observed(), 3);
}

#[test]
fn initialize_runs_before_pair_loop() {
    let mut array = line_array("fluid", vec![0., 0.5, 1., 1.5]).with_property("m", vec![1., 2., 3., 4.]);
    array.property_mut("rho").unwrap().fill(999.);

    let mut evaluator = AccelerationEvaluator::new(
        vec![array],
        vec![Group::new("density", vec![boxed(SummationDensity::new("fluid", &["fluid"]))])],
        Box::new(LinearKernel),
        &params(4),
    )
    .unwrap();
    evaluator
        .attach_neighbor_source(Box::new(AllPairs::new(Arc::new(AtomicUsize::new(0)))))
        .unwrap();
    evaluator.compute(0., 0.1).unwrap();

    // W == 1, so every particle sees the total mass
    let rho = evaluator.collection("fluid").unwrap().property("rho").unwrap();
    assert_eq!(rho, &[10., 10., 10., 10.]);
}

#[test]
fn convergence_group_stops_when_predicate_holds() {
    let executions = Arc::new(AtomicUsize::new(0));
    let group = Group::new("solve", vec![boxed(CountBodies::new("fluid", executions.clone(), 0))])
        .iterate(1, 10)
        .converged_when(|check| check.iteration() >= 3);

    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![0.; 4])],
        vec![group],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    evaluator.compute(0., 0.1).unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 3);
    let group = evaluator.group("solve").unwrap();
    assert_eq!(group.last_iteration_count(), 3);
    assert_eq!(group.iteration_count(), 1);
}

#[test]
fn convergence_group_stops_at_max_iterations() {
    let executions = Arc::new(AtomicUsize::new(0));
    let group = Group::new("solve", vec![boxed(CountBodies::new("fluid", executions.clone(), 0))])
        .iterate(1, 5)
        .converged_when(|_| false);

    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![0.; 4])],
        vec![group],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    evaluator.compute(0., 0.1).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 5);

    evaluator.compute(0.1, 0.1).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 10);
    assert_eq!(evaluator.group("solve").unwrap().last_iteration_count(), 5);
}

#[test]
fn convergence_group_honors_min_iterations_and_equation_state() {
    let at_least = Arc::new(AtomicUsize::new(0));
    let until_converged = Arc::new(AtomicUsize::new(0));
    let groups = vec![
        Group::new("at-least", vec![boxed(CountBodies::new("fluid", at_least.clone(), 0))]).iterate(4, 10),
        Group::new(
            "until-converged",
            vec![boxed(CountBodies::new("fluid", until_converged.clone(), 2))],
        )
        .iterate(1, 10),
    ];

    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![0.; 4])],
        groups,
        Box::new(LinearKernel),
        &params(1),
    )
    .unwrap();
    evaluator.compute(0., 0.1).unwrap();

    assert_eq!(at_least.load(Ordering::SeqCst), 4);
    assert_eq!(until_converged.load(Ordering::SeqCst), 2);
}

#[test]
fn subgroups_run_in_declared_order_per_iteration() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |label| {
        boxed(Recorder {
            dest: "fluid".to_string(),
            label,
            log: log.clone(),
        })
    };
    let outer = Group::with_subgroups(
        "outer",
        vec![Group::new("a", vec![recorder("a")]), Group::new("b", vec![recorder("b")])],
    )
    .iterate(2, 2);
    assert_eq!(outer.subgroups().len(), 2);

    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![0.; 2])],
        vec![outer],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    evaluator.compute(0., 0.1).unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "a", "b"]);
}

#[test]
fn timestep_bounds_are_identical_across_thread_counts() {
    let x = random_x(5, 2000);
    let max_x = x.iter().cloned().fold(FT::MIN, FT::max);
    let max_x2 = x.iter().map(|v| v * v).fold(FT::MIN, FT::max);

    let mut published = Vec::new();
    for num_threads in [1, 2, 8] {
        let mut evaluator = AccelerationEvaluator::new(
            vec![line_array("fluid", x.clone())],
            vec![Group::new("bounds", vec![boxed(BoundFromX { dest: "fluid".to_string() })])],
            Box::new(LinearKernel),
            &params(num_threads),
        )
        .unwrap();
        evaluator.compute(0., 0.1).unwrap();
        published.push(evaluator.adaptive_timestep());
    }

    assert_eq!(published[0].dt_cfl, max_x as f64);
    assert_eq!(published[0].dt_force, max_x2 as f64);
    assert_eq!(published[0].dt_viscous, DT_SENTINEL);
    assert_eq!(published[0], published[1]);
    assert_eq!(published[0], published[2]);
}

#[test]
fn published_bounds_pass_through_reduction() {
    struct Doubling;
    impl TimestepReduction for Doubling {
        fn all_reduce_max(&self, local: AdaptiveTimestep) -> AdaptiveTimestep {
            AdaptiveTimestep {
                dt_cfl: 2. * local.dt_cfl,
                ..local
            }
        }
    }

    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![0.5, 1.5])],
        vec![Group::new("bounds", vec![boxed(BoundFromX { dest: "fluid".to_string() })])],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    evaluator.set_timestep_reduction(Box::new(Doubling));
    evaluator.compute(0., 0.1).unwrap();
    assert_eq!(evaluator.dt_cfl(), 3.);
    assert_eq!(evaluator.dt_force(), 2.25);
}

fn dam_block(seed: u64) -> Vec<ParticleArray> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dx = 0.05;

    let mut fluid_x = Vec::new();
    let mut fluid_y = Vec::new();
    for j in 0..20 {
        for i in 0..20 {
            fluid_x.push(i as FT * dx + rng.gen_range(-0.1..0.1) * dx);
            fluid_y.push(j as FT * dx + rng.gen_range(-0.1..0.1) * dx);
        }
    }
    let n = fluid_x.len();
    let fluid = ParticleArray::new("fluid", n)
        .with_property("x", fluid_x)
        .with_property("y", fluid_y)
        .with_property("u", (0..n).map(|_| rng.gen_range(-0.5..0.5)).collect())
        .with_property("m", vec![1000. * dx * dx; n])
        .with_property("h", vec![1.2 * dx; n])
        .with_property("dt_cfl", vec![0.; n]);

    let wall_x: Vec<FT> = (-3..23).map(|i| i as FT * dx).collect();
    let nw = wall_x.len();
    let wall = ParticleArray::new("wall", nw)
        .with_property("x", wall_x)
        .with_property("y", vec![-dx; nw])
        .with_property("m", vec![1000. * dx * dx; nw])
        .with_property("h", vec![1.2 * dx; nw])
        .with_property("rho", vec![1000.; nw]);

    vec![fluid, wall]
}

fn wcsph_groups() -> Vec<Group> {
    vec![
        Group::new(
            "density",
            vec![boxed(SummationDensity::new("fluid", &["fluid", "wall"]))],
        ),
        Group::new("eos", vec![boxed(TaitEos::new("fluid", 1000., 20., 7.))]),
        Group::new(
            "momentum",
            vec![boxed(MomentumEquation::new("fluid", &["fluid", "wall"], 20., 0.1, 0.))],
        ),
    ]
}

#[test]
fn neighbor_cache_does_not_change_results() {
    for algorithm in [NeighborhoodSearchAlgorithm::Grid, NeighborhoodSearchAlgorithm::RStar] {
        let mut outputs = Vec::new();
        for use_cache in [false, true] {
            let params = params(4).with_neighbor_cache(use_cache).with_search_algorithm(algorithm);
            let kernel = CubicSpline::new(2).unwrap();
            let radius_scale = kernel.radius_scale();

            let mut evaluator =
                AccelerationEvaluator::new(dam_block(11), wcsph_groups(), Box::new(kernel), &params).unwrap();
            evaluator
                .attach_neighbor_source(Box::new(NeighborhoodSearch::from_params(&params, radius_scale)))
                .unwrap();
            evaluator.compute(0., 1e-4).unwrap();

            let fluid = evaluator.collection("fluid").unwrap();
            assert!(fluid.property("rho").unwrap().iter().all(|&rho| rho > 0.));
            outputs.push((
                fluid.property("rho").unwrap().to_vec(),
                fluid.property("au").unwrap().to_vec(),
                fluid.property("av").unwrap().to_vec(),
                evaluator.adaptive_timestep(),
            ));
        }

        assert_eq!(outputs[0].0, outputs[1].0, "{:?}", algorithm);
        assert_eq!(outputs[0].1, outputs[1].1, "{:?}", algorithm);
        assert_eq!(outputs[0].2, outputs[1].2, "{:?}", algorithm);
        assert_eq!(outputs[0].3, outputs[1].3, "{:?}", algorithm);
        assert!(outputs[0].3.dt_cfl >= 20.);
        assert!(outputs[0].3.dt_force > 0.);
    }
}

#[test]
fn replaced_collection_sizes_the_loops() {
    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![1.; 10])],
        vec![Group::new("closed-form", vec![boxed(ClosedForm::new("fluid"))])],
        Box::new(LinearKernel),
        &params(4),
    )
    .unwrap();
    evaluator.compute(0., 0.1).unwrap();

    let x: Vec<FT> = (0..25).map(|i| i as FT).collect();
    evaluator.replace_collections(vec![line_array("fluid", x.clone())]).unwrap();
    assert_eq!(evaluator.view("fluid").unwrap().size(true), 25);
    assert_eq!(evaluator.view("fluid").unwrap().index(), 0);

    evaluator.compute(0.1, 0.1).unwrap();
    let rho = evaluator.collection("fluid").unwrap().property("rho").unwrap();
    assert_eq!(rho.len(), 25);
    assert!(rho.iter().zip(&x).all(|(&rho, &x)| rho == 2. * x + 1.));
}

#[test]
fn update_collection_refreshes_neighbor_source() {
    let updates = Arc::new(AtomicUsize::new(0));
    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("line", vec![0., 1., 2.])],
        vec![Group::new("pairs", vec![boxed(PairSum::new("line", &["line"]))])],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    evaluator.attach_neighbor_source(Box::new(AllPairs::new(updates.clone()))).unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    evaluator
        .update_collection("line", |line| {
            *line = line_array("line", vec![0., 1., 2., 3., 4.]);
        })
        .unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 2);

    evaluator.compute(0., 0.1).unwrap();
    let au = evaluator.collection("line").unwrap().property("au").unwrap();
    assert_eq!(au.len(), 5);
    assert_eq!(au[2], 0.);
    assert_eq!(evaluator.max_neighbors_observed(), 5);
}

#[test]
fn condition_skips_group() {
    let group = Group::new("late", vec![boxed(ClosedForm::new("fluid"))]).condition(|t, _dt| t >= 1.);
    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![1., 2.])],
        vec![group],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();

    evaluator.compute(0.5, 0.1).unwrap();
    assert_eq!(evaluator.collection("fluid").unwrap().property("rho").unwrap(), &[0., 0.]);

    evaluator.compute(1.0, 0.1).unwrap();
    assert_eq!(evaluator.collection("fluid").unwrap().property("rho").unwrap(), &[3., 5.]);
}

#[test]
fn real_flag_selects_loop_range() {
    for (real, expected) in [(true, 6), (false, 10)] {
        let array = with_ghosts(line_array("fluid", vec![1.; 10]), 6);
        let mut evaluator = AccelerationEvaluator::new(
            vec![array],
            vec![Group::new("closed-form", vec![boxed(ClosedForm::new("fluid"))]).real(real)],
            Box::new(LinearKernel),
            &params(2),
        )
        .unwrap();
        evaluator.compute(0., 0.1).unwrap();

        let rho = evaluator.collection("fluid").unwrap().property("rho").unwrap();
        assert_eq!(rho.iter().filter(|&&rho| rho == 3.).count(), expected);
    }
}

#[test]
fn refresh_flag_updates_neighbors_after_every_body_execution() {
    let updates = Arc::new(AtomicUsize::new(0));
    let group = Group::new("pairs", vec![boxed(PairSum::new("line", &["line"]))])
        .update_nnps(true)
        .iterate(1, 3)
        .converged_when(|_| false);

    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("line", vec![0., 1., 2.])],
        vec![group],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    evaluator.attach_neighbor_source(Box::new(AllPairs::new(updates.clone()))).unwrap();
    evaluator.compute(0., 0.1).unwrap();

    assert_eq!(updates.load(Ordering::SeqCst), 1 + 3);
}

#[test]
fn reduce_writes_destination_constants() {
    let array = with_ghosts(
        line_array("fluid", vec![0.; 5])
            .with_property("m", vec![1., 2., 3., 4., 100.])
            .with_constant("total_mass", vec![0.]),
        4,
    );
    let mut evaluator = AccelerationEvaluator::new(
        vec![array],
        vec![Group::new("mass", vec![boxed(TotalMass::new("fluid"))])],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    evaluator.compute(0., 0.1).unwrap();

    assert_eq!(
        evaluator.collection("fluid").unwrap().constant("total_mass").unwrap(),
        &[10.]
    );
}

#[test]
fn configuration_errors_fail_at_binding() {
    let build = |arrays: Vec<ParticleArray>, group: Group| {
        AccelerationEvaluator::new(arrays, vec![group], Box::new(LinearKernel), &params(1)).err()
    };
    let fluid = || line_array("fluid", vec![0., 1.]);

    assert!(matches!(
        build(
            vec![fluid(), fluid()],
            Group::new("g", vec![boxed(ClosedForm::new("fluid"))])
        ),
        Some(EvalError::DuplicateArray(_))
    ));
    assert!(matches!(
        build(vec![fluid()], Group::new("g", vec![boxed(ClosedForm::new("solid"))])),
        Some(EvalError::UnknownArray(_))
    ));
    assert!(matches!(
        build(
            vec![fluid()],
            Group::new("g", vec![boxed(PairSum::new("fluid", &["fluid", "fluid"]))])
        ),
        Some(EvalError::DuplicateSource { .. })
    ));
    assert!(matches!(
        build(
            vec![fluid()],
            Group::new("g", vec![boxed(XsphCorrection::new("fluid", &["fluid"], 0.5))])
        ),
        Some(EvalError::MissingProperty { .. })
    ));
    assert!(matches!(
        build(vec![fluid()], Group::new("g", vec![boxed(TotalMass::new("fluid"))])),
        Some(EvalError::MissingConstant { .. })
    ));
    assert!(matches!(
        build(
            vec![fluid()],
            Group::new("g", vec![boxed(ClosedForm::new("fluid"))]).iterate(3, 2)
        ),
        Some(EvalError::InvalidIterationBounds { .. })
    ));
    assert!(matches!(
        build(
            vec![fluid()],
            Group::with_subgroups(
                "outer",
                vec![Group::new("inner", vec![boxed(ClosedForm::new("fluid"))]).iterate(0, 0)]
            )
        ),
        Some(EvalError::InvalidIterationBounds { .. })
    ));
}

#[test]
fn short_constant_fails_at_binding_and_replacement() {
    let with_total_mass = |values: Vec<FT>| {
        line_array("fluid", vec![0.; 4]).with_constant("total_mass", values)
    };
    let mass_group = || Group::new("mass", vec![boxed(TotalMass::new("fluid"))]);

    match AccelerationEvaluator::new(
        vec![with_total_mass(vec![])],
        vec![mass_group()],
        Box::new(LinearKernel),
        &params(2),
    ) {
        Err(EvalError::ConstantTooShort { constant, expected, got, .. }) => {
            assert_eq!(constant, "total_mass");
            assert_eq!((expected, got), (1, 0));
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("empty constant was accepted"),
    }

    let mut evaluator = AccelerationEvaluator::new(
        vec![with_total_mass(vec![0.])],
        vec![Group::with_subgroups("outer", vec![mass_group()])],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    assert!(matches!(
        evaluator.replace_collections(vec![with_total_mass(vec![])]),
        Err(EvalError::ConstantTooShort { .. })
    ));

    evaluator.compute(0., 0.1).unwrap();
    assert_eq!(
        evaluator.collection("fluid").unwrap().constant("total_mass").unwrap(),
        &[4.]
    );
}

/// Accepts a fixed number of updates, then fails every further one.
struct FailingSource {
    updates_left: usize,
}

impl NeighborSource for FailingSource {
    fn set_context(&mut self, _src_index: usize, _dst_index: usize) {}

    fn get_neighbors<'a>(&'a self, _d_idx: usize, scratch: &'a mut Vec<u32>) -> &'a [u32] {
        scratch.clear();
        scratch
    }

    fn update(&mut self, arrays: &[ParticleArray]) -> Result<(), EvalError> {
        if self.updates_left == 0 {
            return Err(EvalError::MissingProperty {
                array: arrays[0].name().to_string(),
                property: "x".to_string(),
            });
        }
        self.updates_left -= 1;
        Ok(())
    }
}

#[test]
fn failed_iteration_resets_iteration_count() {
    let executions = Arc::new(AtomicUsize::new(0));
    let group = Group::new("solve", vec![boxed(CountBodies::new("fluid", executions.clone(), 0))])
        .update_nnps(true)
        .iterate(1, 5)
        .converged_when(|_| false);

    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![0.; 4])],
        vec![group],
        Box::new(LinearKernel),
        &params(2),
    )
    .unwrap();
    // one update on attach, one after the first body execution
    evaluator
        .attach_neighbor_source(Box::new(FailingSource { updates_left: 2 }))
        .unwrap();

    assert!(matches!(
        evaluator.compute(0., 0.1),
        Err(EvalError::MissingProperty { .. })
    ));
    assert_eq!(executions.load(Ordering::SeqCst), 2);
    let group = evaluator.group("solve").unwrap();
    assert_eq!(group.iteration_count(), 1);
    assert_eq!(group.last_iteration_count(), 0);
}

#[test]
fn sourced_group_without_neighbor_source_fails() {
    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("line", vec![0., 1.])],
        vec![Group::with_subgroups(
            "outer",
            vec![Group::new("pairs", vec![boxed(PairSum::new("line", &["line"]))])],
        )],
        Box::new(LinearKernel),
        &params(1),
    )
    .unwrap();

    match evaluator.compute(0., 0.1) {
        Err(EvalError::MissingNeighborSource(group)) => assert_eq!(group, "pairs"),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn invalid_replacement_leaves_collections_untouched() {
    let mut evaluator = AccelerationEvaluator::new(
        vec![line_array("fluid", vec![0., 1.]).with_property("dt_cfl", vec![0.; 2])],
        vec![Group::new("closed-form", vec![boxed(ClosedForm::new("fluid"))])],
        Box::new(LinearKernel),
        &params(1),
    )
    .unwrap();

    assert!(matches!(
        evaluator.replace_collections(vec![line_array("solid", vec![0.])]),
        Err(EvalError::UnknownArray(_))
    ));
    assert!(matches!(
        evaluator.replace_collections(vec![line_array("fluid", vec![0.; 3])]),
        Err(EvalError::MissingProperty { .. })
    ));
    assert_eq!(evaluator.view("fluid").unwrap().size(false), 2);
    assert_eq!(evaluator.collection("fluid").unwrap().num_particles(), 2);

    evaluator.compute(0., 0.1).unwrap();
    assert_eq!(evaluator.collection("fluid").unwrap().property("rho").unwrap(), &[1., 3.]);
}
