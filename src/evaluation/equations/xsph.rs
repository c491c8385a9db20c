use crate::{
    equation::{DestinationArrays, Equation, PairGeometry, SourceArrays, StepContext},
    floating_type_mod::FT,
    timestep::TimestepSlot,
};

/// XSPH velocity `ax ay az`: the particle velocity blended towards the
/// velocities of its neighbours with strength `eps`.
pub struct XsphCorrection {
    dest: String,
    sources: Vec<String>,
    eps: FT,
}

impl XsphCorrection {
    const RHO: usize = 0;
    const AX: usize = 1;
    const AY: usize = 2;
    const AZ: usize = 3;

    const SRC_M: usize = 0;
    const SRC_RHO: usize = 1;

    pub fn new(dest: &str, sources: &[&str], eps: FT) -> Self {
        XsphCorrection {
            dest: dest.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            eps,
        }
    }
}

impl Equation for XsphCorrection {
    fn name(&self) -> &str {
        "XsphCorrection"
    }

    fn destination(&self) -> &str {
        &self.dest
    }

    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["rho", "ax", "ay", "az"]
    }

    fn source_properties(&self) -> &[&'static str] {
        &["m", "rho"]
    }

    fn has_initialize(&self) -> bool {
        true
    }

    fn initialize(&self, d_idx: usize, d: &DestinationArrays, _ctx: &StepContext) {
        d.set(Self::AX, d_idx, 0.);
        d.set(Self::AY, d_idx, 0.);
        d.set(Self::AZ, d_idx, 0.);
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
        let rhoij = 0.5 * (d.get(Self::RHO, d_idx) + s.get(Self::SRC_RHO, s_idx));
        let tmp = -self.eps * s.get(Self::SRC_M, s_idx) * pair.wij / rhoij;

        d.add(Self::AX, d_idx, tmp * pair.vij.x);
        d.add(Self::AY, d_idx, tmp * pair.vij.y);
        d.add(Self::AZ, d_idx, tmp * pair.vij.z);
    }

    fn has_post_loop(&self) -> bool {
        true
    }

    fn post_loop(&self, d_idx: usize, d: &DestinationArrays, _dt_slot: &mut TimestepSlot, _ctx: &StepContext) {
        let v = d.velocity(d_idx);
        d.add(Self::AX, d_idx, v.x);
        d.add(Self::AY, d_idx, v.y);
        d.add(Self::AZ, d_idx, v.z);
    }
}
