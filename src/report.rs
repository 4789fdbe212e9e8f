//! Formatted terminal output.
//!
//! Formatting lives in one place so the model and fit code stay clean and
//! the strings are testable without capturing stdout.

use crate::model::{FitOutput, Model, MultifitOutput};

/// Tabulate every component's current parameter values, one line per
/// parameter. With `only_free`, fixed and twinned parameters are omitted.
pub fn format_current_values(model: &Model, only_free: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Model of '{}' ({} components, {}/{} channels in range)\n",
        model.spectrum().name,
        model.len(),
        model.masked_channel_count(),
        model.spectrum().axis().size,
    ));
    for (ci, component) in model.components().iter().enumerate() {
        let mut tags = Vec::new();
        if !component.active {
            tags.push("inactive");
        }
        if component.convolved {
            tags.push("convolved");
        }
        let suffix = if tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tags.join(", "))
        };
        out.push_str(&format!(
            "{}: {} ({}){}\n",
            ci,
            component.name,
            component.shape().id_name(),
            suffix
        ));
        for (pi, parameter) in component.parameters().iter().enumerate() {
            if only_free && !parameter.is_free_for_fit() {
                continue;
            }
            let status = if parameter.twin().is_some() {
                "twin"
            } else if parameter.free {
                "free"
            } else {
                "fixed"
            };
            // Twinned values are resolved through the model.
            let values = model
                .parameter_value(ci, pi)
                .unwrap_or_else(|_| parameter.value().to_vec());
            let rendered = values
                .iter()
                .map(|v| format!("{v:.6}"))
                .collect::<Vec<_>>()
                .join(", ");
            let std = match parameter.std() {
                Some(std) => format!(
                    " +/- {}",
                    std.iter()
                        .map(|s| format!("{s:.6}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                None => String::new(),
            };
            out.push_str(&format!(
                "    {:<12} {:>6}  {rendered}{std}\n",
                parameter.name, status
            ));
        }
    }
    out
}

pub fn format_fit_summary(output: &FitOutput) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Fit: {} ({:?}) | {} free elements | residual={:.6e} | {} iterations\n",
        output.fitter.name(),
        output.method,
        output.p.len(),
        output.residual_sum,
        output.iterations,
    ));
    if output.p_std.is_none() {
        out.push_str("Standard errors: unavailable\n");
    }
    if !output.clamped.is_empty() {
        out.push_str(&format!(
            "Clamped to bounds: {}\n",
            output.clamped.join(", ")
        ));
    }
    out
}

pub fn format_multifit_summary(output: &MultifitOutput) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Multifit: {} fitted, {} skipped, {} failed\n",
        output.fitted,
        output.skipped,
        output.failures.len(),
    ));
    for (index, message) in output.failures.iter().take(10) {
        out.push_str(&format!("  pixel {index}: {message}\n"));
    }
    if output.failures.len() > 10 {
        out.push_str(&format!(
            "  ... and {} more\n",
            output.failures.len() - 10
        ));
    }
    if let Some(path) = &output.autosave_path {
        out.push_str(&format!("Autosave kept at {}\n", path.display()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::Gaussian;
    use crate::model::{Component, TwinRelation};
    use crate::signal::{Axis, Spectrum};

    fn model() -> Model {
        let axis = Axis::new("energy", "eV", 0.0, 1.0, 50).unwrap();
        let spectrum = Spectrum::single("demo", axis, vec![0.0; 50]).unwrap();
        let mut m = Model::new(spectrum);
        m.append(Component::new("g1", Box::new(Gaussian::new(5.0, 25.0, 3.0))));
        m.append(Component::new("g2", Box::new(Gaussian::new(2.0, 10.0, 1.5))));
        m
    }

    #[test]
    fn current_values_list_components_and_status() {
        let mut m = model();
        m.component_mut(1).parameter_mut("centre").unwrap().free = false;
        m.set_twin((1, 2), (0, 2), TwinRelation::default()).unwrap();

        let full = format_current_values(&m, false);
        assert!(full.contains("g1"));
        assert!(full.contains("fixed"));
        assert!(full.contains("twin"));
        // Twinned sigma renders the resolved source value.
        assert!(full.contains("3.000000"));

        let free_only = format_current_values(&m, true);
        assert!(!free_only.contains("fixed"));
        assert!(!free_only.contains("twin"));
    }

    #[test]
    fn fit_summary_reports_clamps() {
        let mut m = model();
        m.component_mut(1).active = false;
        let out = m
            .fit(&crate::model::FitOptions::default())
            .map(|mut o| {
                o.clamped = vec!["g1.a".into()];
                o
            })
            .unwrap();
        let text = format_fit_summary(&out);
        assert!(text.contains("leastsq"));
        assert!(text.contains("g1.a"));
    }
}
