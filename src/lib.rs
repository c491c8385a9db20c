/*!
Parallel evaluation of grouped SPH equations.

An [`AccelerationEvaluator`] owns a set of named [`ParticleArray`]s and an
ordered list of [`Group`]s of [`Equation`]s. Every call to
[`AccelerationEvaluator::compute`] runs the groups in order; each group loops
over its destination particles on a rayon thread pool, walks the neighbors
reported by a [`NeighborSource`] and collects the adaptive time-step bounds
reported by the equations into per-thread slots that are max-reduced at the
end.
*/

mod evaluation;

pub use evaluation::*;
