use crate::{
    equation::{DestinationArrays, Equation, PairGeometry, SourceArrays, StepContext},
    equations::EPS,
    floating_type_mod::FT,
    timestep::TimestepSlot,
    vec3f, V3,
};

/// Pressure gradient with Monaghan's artificial viscosity.
///
/// Zeroes the accelerations in `initialize`, so it must be the first
/// equation of a group writing `au av aw`. Reports `|a|^2` as force bound and
/// `c0 + max_j h_ij v_ij.x_ij / (r_ij^2 + eps h_ij^2)` as CFL bound.
pub struct MomentumEquation {
    dest: String,
    sources: Vec<String>,
    c0: FT,
    alpha: FT,
    beta: FT,
}

impl MomentumEquation {
    const RHO: usize = 0;
    const P: usize = 1;
    const AU: usize = 2;
    const AV: usize = 3;
    const AW: usize = 4;
    const DT_CFL: usize = 5;

    const SRC_M: usize = 0;
    const SRC_RHO: usize = 1;
    const SRC_P: usize = 2;

    pub fn new(dest: &str, sources: &[&str], c0: FT, alpha: FT, beta: FT) -> Self {
        MomentumEquation {
            dest: dest.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            c0,
            alpha,
            beta,
        }
    }
}

impl Equation for MomentumEquation {
    fn name(&self) -> &str {
        "MomentumEquation"
    }

    fn destination(&self) -> &str {
        &self.dest
    }

    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["rho", "p", "au", "av", "aw", "dt_cfl"]
    }

    fn source_properties(&self) -> &[&'static str] {
        &["m", "rho", "p"]
    }

    fn has_initialize(&self) -> bool {
        true
    }

    fn initialize(&self, d_idx: usize, d: &DestinationArrays, _ctx: &StepContext) {
        d.set(Self::AU, d_idx, 0.);
        d.set(Self::AV, d_idx, 0.);
        d.set(Self::AW, d_idx, 0.);
        d.set(Self::DT_CFL, d_idx, 0.);
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
        let rhoa = d.get(Self::RHO, d_idx);
        let rhob = s.get(Self::SRC_RHO, s_idx);
        let pa = d.get(Self::P, d_idx);
        let pb = s.get(Self::SRC_P, s_idx);

        let vijdotxij = pair.vij.dot(&pair.xij);
        let muij = pair.hij * vijdotxij / (pair.r2ij + EPS * pair.hij * pair.hij);

        let mut piij = 0.;
        if vijdotxij < 0. {
            let rhoij = 0.5 * (rhoa + rhob);
            piij = (-self.alpha * self.c0 * muij + self.beta * muij * muij) / rhoij;
        }

        let tmp = pa / (rhoa * rhoa) + pb / (rhob * rhob);
        let acc = -s.get(Self::SRC_M, s_idx) * (tmp + piij) * pair.dwij;

        d.add(Self::AU, d_idx, acc.x);
        d.add(Self::AV, d_idx, acc.y);
        d.add(Self::AW, d_idx, acc.z);

        if muij > d.get(Self::DT_CFL, d_idx) {
            d.set(Self::DT_CFL, d_idx, muij);
        }
    }

    fn has_post_loop(&self) -> bool {
        true
    }

    fn post_loop(&self, d_idx: usize, d: &DestinationArrays, dt_slot: &mut TimestepSlot, _ctx: &StepContext) {
        let acc: V3 = vec3f(d.get(Self::AU, d_idx), d.get(Self::AV, d_idx), d.get(Self::AW, d_idx));
        dt_slot.limit_force(acc.norm_squared());
        dt_slot.limit_cfl(self.c0 + d.get(Self::DT_CFL, d_idx));
    }
}

/// Physical viscosity term added to `au av aw`.
pub struct LaminarViscosity {
    dest: String,
    sources: Vec<String>,
    nu: FT,
}

impl LaminarViscosity {
    const RHO: usize = 0;
    const AU: usize = 1;
    const AV: usize = 2;
    const AW: usize = 3;

    const SRC_M: usize = 0;
    const SRC_RHO: usize = 1;

    pub fn new(dest: &str, sources: &[&str], nu: FT) -> Self {
        LaminarViscosity {
            dest: dest.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            nu,
        }
    }
}

impl Equation for LaminarViscosity {
    fn name(&self) -> &str {
        "LaminarViscosity"
    }

    fn destination(&self) -> &str {
        &self.dest
    }

    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["rho", "au", "av", "aw"]
    }

    fn source_properties(&self) -> &[&'static str] {
        &["m", "rho"]
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
        let rhoa = d.get(Self::RHO, d_idx);
        let rhob = s.get(Self::SRC_RHO, s_idx);
        let mb = s.get(Self::SRC_M, s_idx);

        let xdotdwij = pair.xij.dot(&pair.dwij);
        let tmp = mb * 4. * self.nu * xdotdwij
            / ((rhoa + rhob) * (pair.r2ij + EPS * pair.hij * pair.hij));

        d.add(Self::AU, d_idx, tmp * pair.vij.x);
        d.add(Self::AV, d_idx, tmp * pair.vij.y);
        d.add(Self::AW, d_idx, tmp * pair.vij.z);
    }

    fn has_post_loop(&self) -> bool {
        true
    }

    // stable step is 0.125 h^2 / nu
    fn post_loop(&self, d_idx: usize, d: &DestinationArrays, dt_slot: &mut TimestepSlot, _ctx: &StepContext) {
        let h = d.smoothing_length(d_idx);
        if h > 0. {
            dt_slot.limit_viscous(self.nu / (0.125 * h));
        }
    }
}

/// Constant body force such as gravity, added to `au av aw`.
pub struct BodyForce {
    dest: String,
    force: V3,
}

impl BodyForce {
    const AU: usize = 0;
    const AV: usize = 1;
    const AW: usize = 2;

    pub fn new(dest: &str, gx: FT, gy: FT, gz: FT) -> Self {
        BodyForce {
            dest: dest.to_string(),
            force: vec3f(gx, gy, gz),
        }
    }
}

impl Equation for BodyForce {
    fn name(&self) -> &str {
        "BodyForce"
    }

    fn destination(&self) -> &str {
        &self.dest
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["au", "av", "aw"]
    }

    fn has_loop(&self) -> bool {
        true
    }

    fn loop_single(&self, d_idx: usize, d: &DestinationArrays, _ctx: &StepContext) {
        d.add(Self::AU, d_idx, self.force.x);
        d.add(Self::AV, d_idx, self.force.y);
        d.add(Self::AW, d_idx, self.force.z);
    }
}
