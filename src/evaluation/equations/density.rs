use crate::{
    equation::{DestinationArrays, Equation, PairGeometry, SourceArrays, StepContext},
    floating_type_mod::FT,
};

/// `rho_i = sum_j m_j W_ij`
pub struct SummationDensity {
    dest: String,
    sources: Vec<String>,
}

impl SummationDensity {
    const RHO: usize = 0;
    const SRC_M: usize = 0;

    pub fn new(dest: &str, sources: &[&str]) -> Self {
        SummationDensity {
            dest: dest.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Equation for SummationDensity {
    fn name(&self) -> &str {
        "SummationDensity"
    }

    fn destination(&self) -> &str {
        &self.dest
    }

    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["rho"]
    }

    fn source_properties(&self) -> &[&'static str] {
        &["m"]
    }

    fn has_initialize(&self) -> bool {
        true
    }

    fn initialize(&self, d_idx: usize, d: &DestinationArrays, _ctx: &StepContext) {
        d.set(Self::RHO, d_idx, 0.);
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
        d.add(Self::RHO, d_idx, s.get(Self::SRC_M, s_idx) * pair.wij);
    }
}

/// Tait equation of state `p = rho0 c0^2 / gamma ((rho / rho0)^gamma - 1)`.
pub struct TaitEos {
    dest: String,
    rho0: FT,
    c0: FT,
    gamma: FT,
}

impl TaitEos {
    const RHO: usize = 0;
    const P: usize = 1;

    pub fn new(dest: &str, rho0: FT, c0: FT, gamma: FT) -> Self {
        TaitEos {
            dest: dest.to_string(),
            rho0,
            c0,
            gamma,
        }
    }

    pub fn pressure(&self, rho: FT) -> FT {
        let b = self.rho0 * self.c0 * self.c0 / self.gamma;
        b * ((rho / self.rho0).powf(self.gamma) - 1.)
    }
}

impl Equation for TaitEos {
    fn name(&self) -> &str {
        "TaitEos"
    }

    fn destination(&self) -> &str {
        &self.dest
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["rho", "p"]
    }

    fn has_loop(&self) -> bool {
        true
    }

    fn loop_single(&self, d_idx: usize, d: &DestinationArrays, _ctx: &StepContext) {
        d.set(Self::P, d_idx, self.pressure(d.get(Self::RHO, d_idx)));
    }
}

#[test]
fn tait_eos_vanishes_at_rest_density() {
    let eos = TaitEos::new("fluid", 1000., 20., 7.);
    assert_eq!(eos.pressure(1000.), 0.);
    assert!(eos.pressure(1010.) > 0.);
    assert!(eos.pressure(990.) < 0.);
}
