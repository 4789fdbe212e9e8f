//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main":
//! it parses arguments, generates the synthetic scan, builds the model,
//! runs the requested fit, and prints reports.

use std::path::PathBuf;

use clap::Parser;

use crate::cli::{Cli, Command, FitArgs, MultifitArgs};
use crate::components::{Gaussian, PowerLaw};
use crate::data::{generate_sample, SampleConfig};
use crate::error::EngineError;
use crate::io::save_parameters_to_file;
use crate::model::{Autosave, Component, FitMethod, FitOptions, Model, Weights};
use crate::optim::Fitter;
use crate::progress::LogProgress;
use crate::report;

/// Entry point for the `specfit` binary.
pub fn run() -> Result<(), EngineError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Fit(args) => handle_fit(&args),
        Command::Multifit(args) => handle_multifit(&args),
    }
}

fn handle_fit(args: &FitArgs) -> Result<(), EngineError> {
    let mut model = build_model(args)?;
    model.set_index(args.pixel)?;
    let options = fit_options(args)?;

    // Seed the background from the pre-peak region, then fit everything.
    let axis = model.spectrum().axis().clone();
    let background_edge = axis.value(axis.size / 3);
    model.fit_component(0, Some((axis.value(0), background_edge)), true, false, &options)?;
    let output = model.fit(&options)?;

    println!("{}", report::format_current_values(&model, false));
    println!("{}", report::format_fit_summary(&output));

    if let Some(path) = &args.export {
        save_parameters_to_file(&model, path)?;
        println!("Parameters written to {}", path.display());
    }
    Ok(())
}

fn handle_multifit(args: &MultifitArgs) -> Result<(), EngineError> {
    let mut model = build_model(&args.fit)?;
    let options = fit_options(&args.fit)?;

    let autosave = args.autosave_every.map(|every| Autosave {
        every,
        directory: PathBuf::from("."),
    });

    let nav_size = model.spectrum().nav_size();
    let mut progress = LogProgress::new("multifit", nav_size);
    let output = model.multifit(
        None,
        args.warm_start,
        autosave.as_ref(),
        &options,
        &mut progress,
    )?;

    println!("{}", report::format_multifit_summary(&output));
    println!("{}", report::format_current_values(&model, true));

    if let Some(path) = &args.fit.export {
        save_parameters_to_file(&model, path)?;
        println!("Parameters written to {}", path.display());
    }
    Ok(())
}

/// Synthetic scan plus a background + peak model with rough starting
/// values, the shared setup of both commands.
fn build_model(args: &FitArgs) -> Result<Model, EngineError> {
    let sample = generate_sample(&SampleConfig {
        rows: args.rows,
        cols: args.cols,
        channels: args.channels,
        noise: args.noise,
        seed: args.seed,
        ..SampleConfig::default()
    })?;

    let axis = sample.spectrum.axis().clone();
    let span = axis.scale * axis.size as f64;

    let mut model = Model::new(sample.spectrum);
    model.append(Component::new(
        "background",
        Box::new(PowerLaw {
            a: 3.0e5,
            r: 2.0,
            ..PowerLaw::default()
        }),
    ));
    model.append(Component::new(
        "peak",
        Box::new(Gaussian::new(
            10.0,
            axis.offset + span * 0.5,
            span * 0.03,
        )),
    ));
    Ok(model)
}

fn fit_options(args: &FitArgs) -> Result<FitOptions, EngineError> {
    // Resolve the backend by name before touching any model state.
    let fitter = args
        .fitter
        .as_deref()
        .map(Fitter::from_name)
        .transpose()?;
    Ok(FitOptions {
        fitter,
        method: if args.ml { FitMethod::Ml } else { FitMethod::Ls },
        grad: args.grad,
        weights: if args.weight_variance {
            Weights::FromVariance
        } else {
            Weights::None
        },
        bounded: args.bounded,
        ext_bounding: false,
        max_iter: args.max_iter,
    })
}
