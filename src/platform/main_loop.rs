use std::str::FromStr;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sph_accel_eval::{
    floating_type_mod::FT, AccelerationEvaluator, CubicSpline, EvalError, EvaluatorParams, NeighborhoodSearch,
    SmoothingKernel,
};

use super::scene::{SceneConfig, BOUNDARY, FLUID};

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed reading '{path}'")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },

    #[error("failed parsing '{path}'")]
    Yaml {
        path: String,
        #[source]
        err: serde_yaml::Error,
    },

    #[error("invalid value '{value}' for {name}")]
    InvalidArgument { name: &'static str, value: String },

    #[error("no time-step bound was reported at t={0}")]
    NoTimestep(FT),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

pub fn start() -> Result<(), RunError> {
    let matches = App::new("SPH Acceleration Evaluator")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Advance a scene with an explicit integrator driven by the adaptive time-step")
                .arg(
                    Arg::with_name("EVALUATOR_CONFIG")
                        .help("Evaluator parameters (YAML)")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Scene setup (YAML)")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("STEPS")
                        .long("steps")
                        .short("n")
                        .takes_value(true)
                        .default_value("100")
                        .help("Number of time steps"),
                )
                .arg(
                    Arg::with_name("CFL")
                        .long("cfl")
                        .takes_value(true)
                        .default_value("0.25")
                        .help("Factor applied to the stable time-step"),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .takes_value(true)
                        .help("Where to write statistics to"),
                ),
        )
        .get_matches();

    init_logging(matches.occurrences_of("v"));

    if let Some(run_matches) = matches.subcommand_matches("run") {
        run(run_matches)?;
    }
    Ok(())
}

fn init_logging(verbosity: u64) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .init();
}

fn read_yaml<T: DeserializeOwned>(path: &str) -> Result<T, RunError> {
    let yaml = std::fs::read_to_string(path).map_err(|err| RunError::Io {
        path: path.to_string(),
        err,
    })?;
    serde_yaml::from_str(&yaml).map_err(|err| RunError::Yaml {
        path: path.to_string(),
        err,
    })
}

fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &'static str) -> Result<T, RunError> {
    let value = matches.value_of(name).unwrap_or_default();
    value.parse::<T>().map_err(|_| RunError::InvalidArgument {
        name,
        value: value.to_string(),
    })
}

fn run(matches: &ArgMatches) -> Result<(), RunError> {
    let params: EvaluatorParams = read_yaml(matches.value_of("EVALUATOR_CONFIG").unwrap_or_default())?;
    let scene: SceneConfig = read_yaml(matches.value_of("SCENE_CONFIG").unwrap_or_default())?;
    let steps: usize = parse_arg(matches, "STEPS")?;
    let cfl: FT = parse_arg(matches, "CFL")?;
    debug!(?params, ?scene, "configuration loaded");

    let kernel = CubicSpline::new(2)?;
    let radius_scale = kernel.radius_scale();

    let mut evaluator =
        AccelerationEvaluator::new(scene.build_arrays(), scene.build_groups(), Box::new(kernel), &params)?;
    evaluator.attach_neighbor_source(Box::new(NeighborhoodSearch::from_params(&params, radius_scale)))?;

    info!(
        fluid = num_particles(&evaluator, FLUID),
        boundary = num_particles(&evaluator, BOUNDARY),
        threads = evaluator.num_threads(),
        "scene initialized"
    );

    let mut t: FT = 0.;
    let mut dt = scene.initial_dt();
    let log_interval = (steps / 10).max(1);

    for step in 0..steps {
        evaluator.compute(t, dt)?;

        let h_min = evaluator.min_smoothing_length().ok_or(RunError::NoTimestep(t))?;
        dt = evaluator
            .adaptive_timestep()
            .stable_dt(h_min, cfl)
            .ok_or(RunError::NoTimestep(t))?;

        advance(&mut evaluator, dt)?;
        t += dt;

        if step % log_interval == 0 || step + 1 == steps {
            info!(
                step,
                t,
                dt,
                total_mass = total_mass(&evaluator),
                max_speed = max_speed(&evaluator),
                "advanced"
            );
        }
    }

    if params.collect_statistics {
        let s = evaluator.write_statistics();
        print!("{}", s);
        if let Some(statistics_path) = matches.value_of("STATISTICS_PATH") {
            std::fs::write(statistics_path, s).map_err(|err| RunError::Io {
                path: statistics_path.to_string(),
                err,
            })?;
        }
    }

    Ok(())
}

fn num_particles(evaluator: &AccelerationEvaluator, name: &str) -> usize {
    evaluator.collection(name).map_or(0, |a| a.num_particles())
}

fn total_mass(evaluator: &AccelerationEvaluator) -> FT {
    evaluator
        .collection(FLUID)
        .and_then(|a| a.constant("total_mass"))
        .map_or(0., |c| c[0])
}

fn max_speed(evaluator: &AccelerationEvaluator) -> FT {
    let fluid = match evaluator.collection(FLUID) {
        Some(fluid) => fluid,
        None => return 0.,
    };
    match (fluid.property("u"), fluid.property("v")) {
        (Some(u), Some(v)) => u
            .iter()
            .zip(v)
            .map(|(u, v)| (u * u + v * v).sqrt())
            .fold(0., FT::max),
        _ => 0.,
    }
}

fn fluid_property(evaluator: &AccelerationEvaluator, property: &str) -> Result<Vec<FT>, EvalError> {
    evaluator
        .collection(FLUID)
        .and_then(|a| a.property(property))
        .map(<[FT]>::to_vec)
        .ok_or_else(|| EvalError::MissingProperty {
            array: FLUID.to_string(),
            property: property.to_string(),
        })
}

/// Explicit Euler step of the fluid: velocities from `au av` and positions
/// from the XSPH velocities `ax ay` of the evaluated state.
fn advance(evaluator: &mut AccelerationEvaluator, dt: FT) -> Result<(), EvalError> {
    for (target, rate) in [("u", "au"), ("v", "av"), ("x", "ax"), ("y", "ay")] {
        let rate = fluid_property(evaluator, rate)?;
        for (value, r) in evaluator.property_mut(FLUID, target)?.iter_mut().zip(&rate) {
            *value += dt * r;
        }
    }
    evaluator.update_neighbors()
}
