//! Chart directory loader
//!
//! A chart directory holds `Chart.yaml`, `values.yaml` and a `templates/`
//! directory. Only templates named `NNNN_<label>.yaml` or `NNNN-<label>.yaml`
//! are rendered; the four-digit prefix is the state they belong to. Files
//! starting with `_` (e.g. `_helpers.tpl`) are partials providing `define`
//! blocks. Everything else is metadata and ignored.

use crate::error::ChartError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Order key of a state: the four-digit template filename prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey(u16);

impl StateKey {
    /// Creates a key from its numeric value
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Numeric value of the key
    pub fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Parses the state key out of a template basename.
///
/// Exactly four ASCII digits followed by `_` or `-`, with a `.yaml` suffix.
pub fn parse_state_key(basename: &str) -> Option<StateKey> {
    let stem = basename.strip_suffix(".yaml")?;
    let digits = stem.get(..4)?;
    let tail = stem.get(4..)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) || !(tail.starts_with('_') || tail.starts_with('-')) {
        return None;
    }
    digits.parse().ok().map(StateKey)
}

/// `Chart.yaml` contents the operator uses
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name
    #[serde(default)]
    pub name: String,
    /// Chart version
    #[serde(default)]
    pub version: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Declared chart dependencies (informational)
    #[serde(default)]
    pub dependencies: Vec<ChartDependency>,
}

/// Dependency entry of `Chart.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChartDependency {
    /// Dependency chart name
    #[serde(default)]
    pub name: String,
    /// Version constraint
    #[serde(default)]
    pub version: String,
    /// Repository URL
    #[serde(default)]
    pub repository: String,
}

/// One ordered manifest template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartTemplate {
    /// Path relative to the chart root, e.g. `templates/0010_rbac.yaml`
    pub name: String,
    /// State the template belongs to
    pub state_key: StateKey,
    /// Template source text
    pub source: String,
}

/// A partial (`_helpers.tpl` and friends) providing named templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartPartial {
    /// Path relative to the chart root
    pub name: String,
    /// Template source text
    pub source: String,
}

/// A loaded chart
#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    /// Directory the chart was loaded from
    pub root: PathBuf,
    /// `Chart.yaml`
    pub metadata: ChartMetadata,
    /// Templates, sorted by state key then name
    pub templates: Vec<ChartTemplate>,
    /// Partials, sorted by name
    pub partials: Vec<ChartPartial>,
    /// `values.yaml`
    pub defaults: Map<String, Value>,
}

fn read(path: &Path) -> Result<Option<String>, ChartError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ChartError::io(path, e)),
    }
}

fn read_metadata(root: &Path) -> Result<ChartMetadata, ChartError> {
    let path = root.join("Chart.yaml");
    let Some(text) = read(&path)? else {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        warn!("Chart at {} has no Chart.yaml, using directory name {}", root.display(), name);
        return Ok(ChartMetadata {
            name,
            ..ChartMetadata::default()
        });
    };
    serde_yaml::from_str(&text).map_err(|source| ChartError::InvalidYaml {
        path: path.display().to_string(),
        source,
    })
}

fn read_defaults(root: &Path) -> Result<Map<String, Value>, ChartError> {
    let path = root.join("values.yaml");
    let Some(text) = read(&path)? else {
        return Ok(Map::new());
    };
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_yaml::from_str(&text).map_err(|source| ChartError::InvalidYaml {
        path: path.display().to_string(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(ChartError::InvalidValues(path)),
    }
}

/// Loads the chart rooted at `root`
pub fn load_dir(root: &Path) -> Result<Chart, ChartError> {
    let metadata = read_metadata(root)?;
    let defaults = read_defaults(root)?;

    let templates_dir = root.join("templates");
    if !templates_dir.is_dir() {
        return Err(ChartError::MissingTemplates(templates_dir));
    }

    let mut templates = Vec::new();
    let mut partials = Vec::new();
    let entries = fs::read_dir(&templates_dir).map_err(|e| ChartError::io(&templates_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ChartError::io(&templates_dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let basename = entry.file_name().to_string_lossy().into_owned();
        let name = format!("templates/{basename}");

        if let Some(state_key) = parse_state_key(&basename) {
            let source = fs::read_to_string(&path).map_err(|e| ChartError::io(&path, e))?;
            templates.push(ChartTemplate {
                name,
                state_key,
                source,
            });
        } else if basename.starts_with('_') {
            let source = fs::read_to_string(&path).map_err(|e| ChartError::io(&path, e))?;
            partials.push(ChartPartial { name, source });
        } else {
            debug!("Ignoring non-template file {} in chart {}", basename, metadata.name);
        }
    }

    templates.sort_by(|a, b| a.state_key.cmp(&b.state_key).then_with(|| a.name.cmp(&b.name)));
    partials.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(
        "Loaded chart {} {} with {} templates and {} partials",
        metadata.name,
        metadata.version,
        templates.len(),
        partials.len()
    );

    Ok(Chart {
        root: root.to_path_buf(),
        metadata,
        templates,
        partials,
        defaults,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_key_boundaries() {
        assert_eq!(parse_state_key("0000_x.yaml"), Some(StateKey::new(0)));
        assert_eq!(parse_state_key("0010-x.yaml"), Some(StateKey::new(10)));
        assert_eq!(parse_state_key("9999_long-label_name.yaml"), Some(StateKey::new(9999)));
        assert_eq!(parse_state_key("000_x.yaml"), None);
        assert_eq!(parse_state_key("00000_x.yaml"), None);
        assert_eq!(parse_state_key("a000_x.yaml"), None);
        assert_eq!(parse_state_key("0000x.yaml"), None);
        assert_eq!(parse_state_key("0000_x.yml"), None);
        assert_eq!(parse_state_key("0000_x.yaml.bak"), None);
        assert_eq!(parse_state_key("_helpers.tpl"), None);
    }

    #[test]
    fn test_state_key_display_is_zero_padded() {
        assert_eq!(StateKey::new(20).to_string(), "0020");
    }
}
