//! Template rendering into manifests
//!
//! Each template renders to zero or more YAML documents separated by `---`.
//! Every non-empty document must be a Kubernetes object and becomes a
//! [`RenderedManifest`] tagged with the template's state key.

use crate::error::{RenderError, TemplateError};
use crate::loader::{Chart, ChartTemplate, StateKey};
use crate::template::TemplateSet;
use crds::Manifest;
use serde_json::{Map, Value, json};
use tracing::debug;

/// Release identity exposed to templates as `.Release`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// SpecialResource name
    pub name: String,
    /// SpecialResource target namespace
    pub namespace: String,
}

/// One object produced by a template
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedManifest {
    /// State the source template belongs to
    pub state_key: StateKey,
    /// Template path within the chart
    pub template: String,
    /// The object
    pub manifest: Manifest,
}

/// Manifests sharing a state key
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Order key
    pub key: StateKey,
    /// Manifests, in template then document order
    pub manifests: Vec<RenderedManifest>,
}

/// Data tree templates are executed against
pub fn template_data(chart: &Chart, release: &Release, values: &Map<String, Value>) -> Value {
    json!({
        "Values": values,
        "Release": {
            "Name": release.name,
            "Namespace": release.namespace,
            "Service": "Helm",
            "IsInstall": true,
        },
        "Chart": {
            "Name": chart.metadata.name,
            "Version": chart.metadata.version,
        },
        "Template": {
            "BasePath": "templates",
        },
    })
}

/// Builds the template set for a chart (partials first, then templates)
pub fn template_set(chart: &Chart) -> Result<TemplateSet, RenderError> {
    let mut set = TemplateSet::new();
    for partial in &chart.partials {
        set.add(&partial.name, &partial.source)
            .map_err(|source| template_error(&partial.name, source))?;
    }
    for template in &chart.templates {
        set.add(&template.name, &template.source)
            .map_err(|source| template_error(&template.name, source))?;
    }
    Ok(set)
}

fn template_error(template: &str, source: TemplateError) -> RenderError {
    RenderError::Template {
        template: template.to_string(),
        source,
    }
}

/// Renders one template of `set`
pub fn render_template(
    set: &TemplateSet,
    template: &ChartTemplate,
    data: &Value,
) -> Result<Vec<RenderedManifest>, RenderError> {
    let mut data = data.clone();
    if let Some(root) = data.as_object_mut() {
        root.insert(
            "Template".to_string(),
            json!({ "Name": template.name, "BasePath": "templates" }),
        );
    }

    let text = set
        .render(&template.name, &data)
        .map_err(|source| template_error(&template.name, source))?;
    let manifests = parse_documents(&text, &template.name)?
        .into_iter()
        .map(|manifest| RenderedManifest {
            state_key: template.state_key,
            template: template.name.clone(),
            manifest,
        })
        .collect::<Vec<_>>();

    debug!("Template {} rendered {} manifests", template.name, manifests.len());
    Ok(manifests)
}

/// Renders every template of the chart, in state order
pub fn render_chart(
    chart: &Chart,
    release: &Release,
    values: &Map<String, Value>,
) -> Result<Vec<RenderedManifest>, RenderError> {
    let set = template_set(chart)?;
    let data = template_data(chart, release, values);
    let mut rendered = Vec::new();
    for template in &chart.templates {
        rendered.extend(render_template(&set, template, &data)?);
    }
    Ok(rendered)
}

/// Groups manifests into states, ascending by key
pub fn group_states(manifests: Vec<RenderedManifest>) -> Vec<State> {
    let mut states: Vec<State> = Vec::new();
    let mut sorted = manifests;
    // Stable: keeps template/document order inside a state
    sorted.sort_by_key(|m| m.state_key);
    for manifest in sorted {
        match states.last_mut() {
            Some(state) if state.key == manifest.state_key => state.manifests.push(manifest),
            _ => states.push(State {
                key: manifest.state_key,
                manifests: vec![manifest],
            }),
        }
    }
    states
}

fn is_separator(line: &str) -> bool {
    let line = line.trim_end();
    line == "---" || line.starts_with("--- ") || line.starts_with("---\t")
}

fn is_blank(document: &str) -> bool {
    document.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "..."
    })
}

/// Splits rendered text on `---` lines and parses each non-empty document
pub fn parse_documents(text: &str, template: &str) -> Result<Vec<Manifest>, RenderError> {
    let mut documents = vec![String::new()];
    for line in text.lines() {
        if is_separator(line) {
            documents.push(String::new());
        } else if let Some(current) = documents.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }

    let mut manifests = Vec::new();
    for (document, source) in documents.iter().enumerate() {
        if is_blank(source) {
            continue;
        }
        let value: Value = serde_yaml::from_str(source).map_err(|source| RenderError::InvalidYaml {
            template: template.to_string(),
            document,
            source,
        })?;
        if value.is_null() {
            continue;
        }
        let manifest = Manifest::from_value(value).map_err(|source| RenderError::NotAnObject {
            template: template.to_string(),
            document,
            source,
        })?;
        manifests.push(manifest);
    }
    Ok(manifests)
}
