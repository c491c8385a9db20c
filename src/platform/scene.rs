use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use sph_accel_eval::{
    equations::{
        BodyForce, LaminarViscosity, MomentumEquation, SummationDensity, TaitEos, TotalMass, XsphCorrection,
    },
    floating_type_mod::FT,
    Equation, Group, ParticleArray,
};

pub const FLUID: &str = "fluid";
pub const BOUNDARY: &str = "boundary";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneBoundary {
    pub width: FT,
    pub height: FT,
    pub layers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneFluidBlock {
    pub pos: [FT; 2],
    pub size: [FT; 2],
    #[serde(default)]
    pub velocity: [FT; 2],
}

/// A 2D box of boundary particles with blocks of fluid inside, centered at
/// the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    pub boundary: SceneBoundary,
    pub blocks: Vec<SceneFluidBlock>,
    pub spacing: FT,
    pub hdx: FT,
    pub rest_density: FT,
    pub speed_of_sound: FT,
    pub gamma: FT,
    pub alpha: FT,
    pub beta: FT,
    pub nu: FT,
    pub gravity: [FT; 2],
    pub xsph_eps: FT,
    /// Random displacement of the fluid particles in units of `spacing`.
    #[serde(default)]
    pub jitter: FT,
    #[serde(default)]
    pub seed: u64,
}

struct Positions {
    x: Vec<FT>,
    y: Vec<FT>,
    u: Vec<FT>,
    v: Vec<FT>,
}

impl Positions {
    fn new() -> Self {
        Positions {
            x: Vec::new(),
            y: Vec::new(),
            u: Vec::new(),
            v: Vec::new(),
        }
    }

    fn push(&mut self, x: FT, y: FT, u: FT, v: FT) {
        self.x.push(x);
        self.y.push(y);
        self.u.push(u);
        self.v.push(v);
    }

    fn len(&self) -> usize {
        self.x.len()
    }
}

impl SceneConfig {
    pub fn smoothing_length(&self) -> FT {
        self.hdx * self.spacing
    }

    pub fn particle_mass(&self) -> FT {
        self.rest_density * self.spacing * self.spacing
    }

    /// Step used for the very first `compute`, before any bound is known.
    pub fn initial_dt(&self) -> FT {
        0.25 * self.smoothing_length() / self.speed_of_sound
    }

    fn fluid_positions(&self) -> Positions {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut positions = Positions::new();

        for block in &self.blocks {
            let nx = (block.size[0] / self.spacing).floor() as usize;
            let ny = (block.size[1] / self.spacing).floor() as usize;
            for j in 0..ny {
                for i in 0..nx {
                    let jx = self.jitter * self.spacing * rng.gen_range(-0.5..0.5);
                    let jy = self.jitter * self.spacing * rng.gen_range(-0.5..0.5);
                    positions.push(
                        block.pos[0] + (i as FT + 0.5) * self.spacing + jx,
                        block.pos[1] + (j as FT + 0.5) * self.spacing + jy,
                        block.velocity[0],
                        block.velocity[1],
                    );
                }
            }
        }

        positions
    }

    fn boundary_positions(&self) -> Positions {
        let mut positions = Positions::new();
        let half_width = self.boundary.width / 2.;
        let half_height = self.boundary.height / 2.;

        for layer in 0..self.boundary.layers {
            let offset = (layer as FT + 0.5) * self.spacing;
            let (min_x, min_y) = (-half_width - offset, -half_height - offset);
            let (max_x, max_y) = (half_width + offset, half_height + offset);
            let per_hedge = ((max_x - min_x) / self.spacing).round() as usize;
            let per_vedge = ((max_y - min_y) / self.spacing).round() as usize;
            let dx = (max_x - min_x) / per_hedge.max(1) as FT;
            let dy = (max_y - min_y) / per_vedge.max(1) as FT;

            for edge in 0..4 {
                let (start, dir, num_particles_on_edge) = match edge {
                    0 => ((min_x, min_y), (dx, 0.), per_hedge),
                    1 => ((max_x, min_y), (0., dy), per_vedge),
                    2 => ((max_x, max_y), (-dx, 0.), per_hedge),
                    _ => ((min_x, max_y), (0., -dy), per_vedge),
                };
                for i in 0..num_particles_on_edge {
                    positions.push(start.0 + dir.0 * i as FT, start.1 + dir.1 * i as FT, 0., 0.);
                }
            }
        }

        positions
    }

    fn particle_array(&self, name: &str, positions: Positions) -> ParticleArray {
        let n = positions.len();
        let mut array = ParticleArray::new(name, n)
            .with_property("x", positions.x)
            .with_property("y", positions.y)
            .with_property("u", positions.u)
            .with_property("v", positions.v)
            .with_property("m", vec![self.particle_mass(); n])
            .with_property("h", vec![self.smoothing_length(); n])
            .with_property("rho", vec![self.rest_density; n]);
        for property in ["dt_cfl", "ax", "ay", "az"] {
            array.add_property(property, 0.);
        }
        array
    }

    pub fn build_arrays(&self) -> Vec<ParticleArray> {
        let fluid = self
            .particle_array(FLUID, self.fluid_positions())
            .with_constant("total_mass", vec![0.]);
        let boundary = self.particle_array(BOUNDARY, self.boundary_positions());
        vec![fluid, boundary]
    }

    /// Weakly compressible SPH: summation density, Tait pressure, then
    /// pressure, viscous and body forces with an XSPH velocity.
    pub fn build_groups(&self) -> Vec<Group> {
        let eos = |dest: &str| -> Box<dyn Equation> {
            Box::new(TaitEos::new(dest, self.rest_density, self.speed_of_sound, self.gamma))
        };

        vec![
            Group::new(
                "density",
                vec![
                    Box::new(SummationDensity::new(FLUID, &[FLUID, BOUNDARY])),
                    Box::new(SummationDensity::new(BOUNDARY, &[FLUID, BOUNDARY])),
                ],
            ),
            Group::new("eos", vec![eos(FLUID), eos(BOUNDARY)]),
            Group::new(
                "acceleration",
                vec![
                    Box::new(MomentumEquation::new(
                        FLUID,
                        &[FLUID, BOUNDARY],
                        self.speed_of_sound,
                        self.alpha,
                        self.beta,
                    )),
                    Box::new(LaminarViscosity::new(FLUID, &[FLUID], self.nu)),
                    Box::new(BodyForce::new(FLUID, self.gravity[0], self.gravity[1], 0.)),
                    Box::new(XsphCorrection::new(FLUID, &[FLUID], self.xsph_eps)),
                ],
            ),
            Group::new("mass", vec![Box::new(TotalMass::new(FLUID))]),
        ]
    }
}

#[cfg(test)]
fn test_scene() -> SceneConfig {
    serde_yaml::from_str(include_str!("../../configs/dam_break.yaml")).unwrap()
}

#[test]
fn boundary_encloses_fluid() {
    let scene = test_scene();
    let arrays = scene.build_arrays();
    let (fluid, boundary) = (&arrays[0], &arrays[1]);
    assert!(fluid.num_particles() > 0);
    assert!(boundary.num_particles() > 0);

    let inside = |x: FT, y: FT| x.abs() < scene.boundary.width / 2. && y.abs() < scene.boundary.height / 2.;
    let fx = fluid.property("x").unwrap();
    let fy = fluid.property("y").unwrap();
    assert!(fx.iter().zip(fy).all(|(&x, &y)| inside(x, y)));

    let bx = boundary.property("x").unwrap();
    let by = boundary.property("y").unwrap();
    assert!(bx.iter().zip(by).all(|(&x, &y)| !inside(x, y)));
}

#[test]
fn scene_binds_to_evaluator() {
    use sph_accel_eval::{AccelerationEvaluator, CubicSpline, EvaluatorParams, NeighborhoodSearch, SmoothingKernel};

    let scene = test_scene();
    let params = EvaluatorParams::default().with_num_threads(2);
    let kernel = CubicSpline::new(2).unwrap();
    let radius_scale = kernel.radius_scale();

    let mut evaluator =
        AccelerationEvaluator::new(scene.build_arrays(), scene.build_groups(), Box::new(kernel), &params).unwrap();
    evaluator
        .attach_neighbor_source(Box::new(NeighborhoodSearch::from_params(&params, radius_scale)))
        .unwrap();
    evaluator.compute(0., scene.initial_dt()).unwrap();

    let fluid = evaluator.collection(FLUID).unwrap();
    let expected_mass = fluid.num_particles() as FT * scene.particle_mass();
    sph_accel_eval::assert_ft_approx_eq(
        fluid.constant("total_mass").unwrap()[0],
        expected_mass,
        1e-9 * expected_mass,
        || "total mass".to_string(),
    );

    let h_min = evaluator.min_smoothing_length().unwrap();
    let dt = evaluator.adaptive_timestep().stable_dt(h_min, 0.25).unwrap();
    assert!(dt > 0.);
    assert!(dt <= 0.25 * h_min / scene.speed_of_sound + 1e-12);
}
