//! Weakly compressible SPH equations built on [`Equation`](crate::Equation).

mod density;
mod momentum;
mod reduction;
mod xsph;

pub use density::{SummationDensity, TaitEos};
pub use momentum::{BodyForce, LaminarViscosity, MomentumEquation};
pub use reduction::TotalMass;
pub use xsph::XsphCorrection;

/// Added to `r^2` relative to `h^2` to keep the viscous terms finite.
pub(crate) const EPS: crate::floating_type_mod::FT = 0.01;
