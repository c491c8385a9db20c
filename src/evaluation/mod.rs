pub mod acceleration_eval;
pub mod concurrency;
pub mod counters;
pub mod equation;
pub mod equations;
pub mod error;
pub mod evaluator_parameters;
pub mod group;
pub mod neighborhood_search;
pub mod particle_array;
pub mod sph_kernels;
pub mod thread_safe_ptr;
pub mod timestep;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::{FRAC_1_PI, PI};
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::{FRAC_1_PI, PI};
}

use floating_type_mod::FT;

use nalgebra::SVector;
use num_traits::Float;
use std::fmt::Display;

pub type V<FT, const D: usize> = SVector<FT, D>;
pub type VF<const D: usize> = V<FT, D>;
pub type VI<const D: usize> = V<i32, D>;
pub type V3 = V<FT, 3>;

pub fn vec3f(x: FT, y: FT, z: FT) -> V3 {
    [x, y, z].into()
}

pub use acceleration_eval::AccelerationEvaluator;
pub use equation::{DestinationArrays, Equation, PairGeometry, SourceArrays, StepContext};
pub use error::EvalError;
pub use evaluator_parameters::{EvaluatorParams, NeighborhoodSearchAlgorithm};
pub use group::{ConvergenceCheck, Group};
pub use neighborhood_search::{NeighborSource, NeighborhoodSearch};
pub use particle_array::{ParticleArray, ParticleArrayView, ParticleTag, PropertyId};
pub use sph_kernels::{CubicSpline, SmoothingKernel};
pub use timestep::{AdaptiveTimestep, LocalReduction, TimestepReduction, TimestepSlot};

pub fn is_ft_approx_eq<FT: Float>(a: FT, b: FT, tolerance: FT) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<FT: Float + Display>(a: FT, b: FT, tolerance: FT, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}
