//! Prompt template rendering.
//!
//! Substitutes `{{ input }}`, `{{ step.X }}`, matrix item variables, and
//! injected-artifact placeholders. An unresolved placeholder fails the step
//! rather than being silently left in the rendered prompt.

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
#[error("unresolved template placeholder: {{{{ {0} }}}}")]
pub struct TemplateError(pub String);

/// A flat map of placeholder name (without the `{{ }}` wrapper) to value.
/// Callers assemble this from the input string, prior steps' outputs, matrix
/// item variables, and injected-artifact filenames before calling [`render`].
pub type TemplateVars = BTreeMap<String, String>;

/// Render a template, replacing every `{{ name }}` (with or without internal
/// spacing) found in `vars`. Any placeholder absent from `vars` is an error.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match rest.find("{{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after_open = &rest[start + 2..];
                let Some(end) = after_open.find("}}") else {
                    // Unterminated placeholder: treat the rest as literal text.
                    out.push_str(&rest[start..]);
                    break;
                };
                let name = after_open[..end].trim();
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(TemplateError(name.to_string())),
                }
                rest = &after_open[end + 2..];
            }
        }
    }
    Ok(out)
}

/// Build the variable key used for a prior step's artifact reference,
/// e.g. `step.a.analysis` for step id `a`, artifact `analysis`.
pub fn step_artifact_key(step_id: &str, artifact_name: &str) -> String {
    format!("step.{step_id}.{artifact_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_input_placeholder() {
        let out = render("build: {{ input }}", &vars(&[("input", "add auth")])).unwrap();
        assert_eq!(out, "build: add auth");
    }

    #[test]
    fn renders_step_reference_without_internal_spacing() {
        let out = render("{{step.a.analysis}}", &vars(&[("step.a.analysis", "data")])).unwrap();
        assert_eq!(out, "data");
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let err = render("{{ missing }}", &vars(&[])).unwrap_err();
        assert_eq!(err.0, "missing");
    }

    #[test]
    fn multiple_placeholders_all_resolve() {
        let out = render(
            "{{ a }} and {{ b }}",
            &vars(&[("a", "1"), ("b", "2")]),
        )
        .unwrap();
        assert_eq!(out, "1 and 2");
    }

    #[test]
    fn step_artifact_key_formats_correctly() {
        assert_eq!(step_artifact_key("a", "analysis"), "step.a.analysis");
    }
}
