//! Template expansion.
//!
//! Two placeholder styles are in play: `{name}` in our own configuration,
//! expanded when a descriptor is built, and `{{name}}` in the descriptor's
//! child template, expanded per list element by the GitOps engine.
//! [`render_children`] performs the latter expansion the same way the engine
//! does, which lets the generator check its output and find the children it
//! must remove.

use crate::error::{GitOpsError, Result};
use preview_types::{ChildApplication, ChildTemplate, DeploymentDescriptor, ObjectMeta};
use std::collections::BTreeMap;

/// Expand `{key}` placeholders from configuration; anything left over is an
/// error.
pub(crate) fn expand_config(template: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut out = template.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    if out.contains('{') || out.contains('}') {
        return Err(GitOpsError::Template {
            template: template.to_string(),
            message: format!("unknown placeholder in '{}'", out),
        });
    }
    Ok(out)
}

/// Expand `{{key}}` placeholders from one list element
fn substitute(value: &str, element: &BTreeMap<String, String>) -> String {
    let mut out = value.to_string();
    for (key, param) in element {
        out = out.replace(&format!("{{{{{}}}}}", key), param);
    }
    out
}

fn substitute_map(
    map: &BTreeMap<String, String>,
    element: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute(v, element)))
        .collect()
}

fn render_template(template: &ChildTemplate, element: &BTreeMap<String, String>) -> ChildTemplate {
    let mut child = template.clone();
    child.name = substitute(&template.name, element);
    child.labels = substitute_map(&template.labels, element);
    child.annotations = substitute_map(&template.annotations, element);
    child.source.repo_url = substitute(&template.source.repo_url, element);
    child.source.path = substitute(&template.source.path, element);
    child.source.target_revision = substitute(&template.source.target_revision, element);
    child.destination.namespace = substitute(&template.destination.namespace, element);
    child
}

/// Whether an expanded string still carries a `{{...}}` placeholder
pub(crate) fn has_placeholder(value: &str) -> bool {
    value.contains("{{") || value.contains("}}")
}

/// Expand a descriptor into its child applications, in element order
pub fn render_children(descriptor: &DeploymentDescriptor) -> Vec<ChildApplication> {
    let namespace = descriptor.metadata.namespace_or_default();
    descriptor
        .spec
        .generators
        .iter()
        .flat_map(|generator| generator.elements.iter())
        .map(|element| {
            let spec = render_template(&descriptor.spec.template, element);
            let mut metadata = ObjectMeta::namespaced(namespace, spec.name.clone());
            metadata.labels = spec.labels.clone();
            metadata.annotations = spec.annotations.clone();
            ChildApplication {
                metadata,
                spec,
                status: Default::default(),
            }
        })
        .collect()
}
