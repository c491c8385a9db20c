use crate::{
    equation::{DestinationArrays, Equation, StepContext},
    floating_type_mod::FT,
};

/// Sums `m` over the real particles into the constant `total_mass`.
pub struct TotalMass {
    dest: String,
    last: FT,
}

impl TotalMass {
    const M: usize = 0;
    const TOTAL_MASS: usize = 0;

    pub fn new(dest: &str) -> Self {
        TotalMass {
            dest: dest.to_string(),
            last: 0.,
        }
    }

    /// Value of the most recent reduction.
    pub fn last(&self) -> FT {
        self.last
    }
}

impl Equation for TotalMass {
    fn name(&self) -> &str {
        "TotalMass"
    }

    fn destination(&self) -> &str {
        &self.dest
    }

    fn destination_properties(&self) -> &[&'static str] {
        &["m"]
    }

    fn destination_constants(&self) -> &[&'static str] {
        &["total_mass"]
    }

    fn has_reduce(&self) -> bool {
        true
    }

    fn reduce(&mut self, d: &DestinationArrays, _ctx: &StepContext) {
        let total: FT = (0..d.num_real_particles()).map(|i| d.get(Self::M, i)).sum();
        d.set_constant(Self::TOTAL_MASS, 0, total);
        self.last = total;
    }
}
