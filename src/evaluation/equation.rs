//! The interface between the evaluator and the physics it runs.
//!
//! An equation names one destination array and zero or more source arrays and
//! declares which properties it touches. Properties are addressed by their
//! position `k` in the declared list; the evaluator resolves names to
//! property ids once when the groups are bound.

use crate::{
    floating_type_mod::FT,
    particle_array::{ParticleArrayView, PropertyId},
    sph_kernels::SmoothingKernel,
    timestep::TimestepSlot,
    V3,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    pub t: FT,
    pub dt: FT,
}

/// Destination properties as seen by one equation.
///
/// Inside the parallel loops every call may only write to its own `d_idx`.
pub struct DestinationArrays<'a> {
    view: &'a ParticleArrayView,
    properties: &'a [PropertyId],
    constants: &'a [usize],
}

impl<'a> DestinationArrays<'a> {
    pub(crate) fn new(view: &'a ParticleArrayView, properties: &'a [PropertyId], constants: &'a [usize]) -> Self {
        DestinationArrays {
            view,
            properties,
            constants,
        }
    }

    pub fn name(&self) -> &str {
        self.view.name()
    }

    #[inline(always)]
    pub fn get(&self, k: usize, i: usize) -> FT {
        self.view.get(self.properties[k], i)
    }

    #[inline(always)]
    pub fn set(&self, k: usize, i: usize, value: FT) {
        self.view.set(self.properties[k], i, value)
    }

    #[inline(always)]
    pub fn add(&self, k: usize, i: usize, value: FT) {
        let id = self.properties[k];
        self.view.set(id, i, self.view.get(id, i) + value)
    }

    pub fn constant(&self, k: usize, i: usize) -> FT {
        self.view.get_constant(self.constants[k], i)
    }

    /// Constants are only written from `reduce`, which runs single threaded.
    pub fn set_constant(&self, k: usize, i: usize, value: FT) {
        self.view.set_constant(self.constants[k], i, value)
    }

    pub fn constant_len(&self, k: usize) -> usize {
        self.view.constant_len(self.constants[k])
    }

    pub fn num_real_particles(&self) -> usize {
        self.view.size(true)
    }

    pub fn num_particles(&self) -> usize {
        self.view.size(false)
    }

    #[inline(always)]
    pub fn position(&self, i: usize) -> V3 {
        self.view.position(i)
    }

    #[inline(always)]
    pub fn velocity(&self, i: usize) -> V3 {
        self.view.velocity(i)
    }

    #[inline(always)]
    pub fn smoothing_length(&self, i: usize) -> FT {
        self.view.smoothing_length(i)
    }

    #[inline(always)]
    pub fn tag(&self, i: usize) -> i32 {
        self.view.tag(i)
    }

    #[inline(always)]
    pub fn gid(&self, i: usize) -> u32 {
        self.view.gid(i)
    }
}

/// Read-only source properties as seen by one equation.
pub struct SourceArrays<'a> {
    view: &'a ParticleArrayView,
    properties: &'a [PropertyId],
}

impl<'a> SourceArrays<'a> {
    pub(crate) fn new(view: &'a ParticleArrayView, properties: &'a [PropertyId]) -> Self {
        SourceArrays { view, properties }
    }

    pub fn name(&self) -> &str {
        self.view.name()
    }

    #[inline(always)]
    pub fn get(&self, k: usize, j: usize) -> FT {
        self.view.get(self.properties[k], j)
    }

    pub fn num_particles(&self) -> usize {
        self.view.size(false)
    }

    #[inline(always)]
    pub fn position(&self, j: usize) -> V3 {
        self.view.position(j)
    }

    #[inline(always)]
    pub fn velocity(&self, j: usize) -> V3 {
        self.view.velocity(j)
    }

    #[inline(always)]
    pub fn smoothing_length(&self, j: usize) -> FT {
        self.view.smoothing_length(j)
    }

    #[inline(always)]
    pub fn tag(&self, j: usize) -> i32 {
        self.view.tag(j)
    }
}

/// Geometry of one destination/source pair, evaluated once per neighbor and
/// shared by all equations of the same source.
#[derive(Debug, Clone, Copy)]
pub struct PairGeometry {
    /// `x_i - x_j`
    pub xij: V3,
    /// `v_i - v_j`
    pub vij: V3,
    pub rij: FT,
    pub r2ij: FT,
    /// `(h_i + h_j) / 2`
    pub hij: FT,
    pub wij: FT,
    pub dwij: V3,
}

impl PairGeometry {
    #[inline(always)]
    pub(crate) fn evaluate(
        d_view: &ParticleArrayView,
        d_idx: usize,
        s_view: &ParticleArrayView,
        s_idx: usize,
        kernel: &dyn SmoothingKernel,
    ) -> Self {
        let xij = d_view.position(d_idx) - s_view.position(s_idx);
        let vij = d_view.velocity(d_idx) - s_view.velocity(s_idx);
        let r2ij = xij.norm_squared();
        let rij = r2ij.sqrt();
        let hij = 0.5 * (d_view.smoothing_length(d_idx) + s_view.smoothing_length(s_idx));

        PairGeometry {
            xij,
            vij,
            rij,
            r2ij,
            hij,
            wij: kernel.kernel(&xij, rij, hij),
            dwij: kernel.gradient(&xij, rij, hij),
        }
    }
}

/// One physical interaction term.
///
/// The bodies that run inside the parallel particle loops take `&self`; only
/// `reduce` runs on the calling thread and may update the equation itself,
/// e.g. to decide `converged`.
pub trait Equation: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn destination(&self) -> &str;

    /// Source arrays in the order their pair loops run. Empty for equations
    /// that only touch the destination.
    fn sources(&self) -> &[String] {
        &[]
    }

    fn destination_properties(&self) -> &[&'static str] {
        &[]
    }

    /// Looked up in every source array.
    fn source_properties(&self) -> &[&'static str] {
        &[]
    }

    fn destination_constants(&self) -> &[&'static str] {
        &[]
    }

    /// Minimum number of entries per destination constant, in the order of
    /// `destination_constants`. Constants without an entry here need one.
    fn destination_constant_lens(&self) -> &[usize] {
        &[]
    }

    fn has_initialize(&self) -> bool {
        false
    }

    fn initialize(&self, _d_idx: usize, _d: &DestinationArrays, _ctx: &StepContext) {}

    fn has_loop(&self) -> bool {
        false
    }

    /// Loop body of equations without sources.
    fn loop_single(&self, _d_idx: usize, _d: &DestinationArrays, _ctx: &StepContext) {}

    /// Loop body of equations with sources, called once per neighbor.
    fn loop_pair(
        &self,
        _d_idx: usize,
        _s_idx: usize,
        _d: &DestinationArrays,
        _s: &SourceArrays,
        _pair: &PairGeometry,
        _ctx: &StepContext,
    ) {
    }

    fn has_post_loop(&self) -> bool {
        false
    }

    fn post_loop(&self, _d_idx: usize, _d: &DestinationArrays, _dt_slot: &mut TimestepSlot, _ctx: &StepContext) {}

    fn has_reduce(&self) -> bool {
        false
    }

    fn reduce(&mut self, _d: &DestinationArrays, _ctx: &StepContext) {}

    fn converged(&self) -> bool {
        true
    }
}

#[test]
fn pair_geometry_is_antisymmetric() {
    use crate::{particle_array::ParticleArray, sph_kernels::CubicSpline};

    let mut array = ParticleArray::new("fluid", 2)
        .with_property("x", vec![0., 0.3])
        .with_property("y", vec![0., 0.4])
        .with_property("u", vec![1., -1.])
        .with_property("h", vec![0.4, 0.6]);
    let view = ParticleArrayView::new(0, &mut array).unwrap();
    let kernel = CubicSpline::new(2).unwrap();

    let ij = PairGeometry::evaluate(&view, 0, &view, 1, &kernel);
    let ji = PairGeometry::evaluate(&view, 1, &view, 0, &kernel);

    assert_eq!(ij.hij, 0.5);
    crate::assert_ft_approx_eq(ij.rij, 0.5, 1e-12, || "rij".to_string());
    crate::assert_ft_approx_eq(ij.r2ij, 0.25, 1e-12, || "r2ij".to_string());
    assert_eq!(ij.xij, -ji.xij);
    assert_eq!(ij.vij, -ji.vij);
    assert_eq!(ij.wij, ji.wij);
    assert_eq!(ij.dwij, -ji.dwij);
    assert!(ij.wij > 0.);
}
