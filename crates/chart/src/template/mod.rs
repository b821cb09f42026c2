//! Helm-dialect template engine
//!
//! Implements the part of Go's `text/template` that charts rely on:
//! `{{ }}` actions with `{{-`/`-}}` trim markers and `{{/* */}}` comments,
//! pipelines, `$variables`, `if`/`else if`/`else`, `range`, `with`,
//! `define`/`template`/`include`, plus the common sprig functions
//! (`default`, `quote`, `toYaml`, `nindent`, `printf`, ...).
//!
//! Missing map keys evaluate to nil and print as empty text, matching how
//! Helm renders absent values.

mod exec;
mod funcs;
mod lexer;
mod parse;

use crate::error::TemplateError;
use parse::Node;
use serde_json::Value;
use std::collections::HashMap;

/// A set of named templates sharing their `define` blocks
#[derive(Debug, Default, Clone)]
pub struct TemplateSet {
    bodies: HashMap<String, Vec<Node>>,
    defines: HashMap<String, Vec<Node>>,
}

impl TemplateSet {
    /// Creates an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `source` and registers it under `name`. Named templates it
    /// defines become available to every template in the set.
    pub fn add(&mut self, name: &str, source: &str) -> Result<(), TemplateError> {
        let parsed = parse::parse(source)?;
        self.defines.extend(parsed.defines);
        self.bodies.insert(name.to_string(), parsed.body);
        Ok(())
    }

    /// True when a template was registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.bodies.contains_key(name)
    }

    /// Renders the template registered under `name` with `data` as `.`
    pub fn render(&self, name: &str, data: &Value) -> Result<String, TemplateError> {
        let body = self
            .bodies
            .get(name)
            .ok_or_else(|| TemplateError::exec(format!("no template named {name:?}")))?;
        exec::Exec::new(&self.defines).run(body, data)
    }
}

/// Renders a single template source against `data`
pub fn render_str(source: &str, data: &Value) -> Result<String, TemplateError> {
    let mut set = TemplateSet::new();
    set.add("inline", source)?;
    set.render("inline", data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(source: &str, data: Value) -> String {
        render_str(source, &data).unwrap()
    }

    #[test]
    fn test_field_substitution_and_missing_keys() {
        let data = json!({ "Values": { "kernel": "4.18.0-305.el8.x86_64" } });
        assert_eq!(render("k={{ .Values.kernel }} m={{ .Values.nope.deeper }}", data), "k=4.18.0-305.el8.x86_64 m=");
    }

    #[test]
    fn test_conditionals() {
        let tpl = "{{ if eq .os \"rhel\" }}R{{ else if .other }}O{{ else }}X{{ end }}";
        assert_eq!(render(tpl, json!({ "os": "rhel" })), "R");
        assert_eq!(render(tpl, json!({ "os": "ubuntu", "other": true })), "O");
        assert_eq!(render(tpl, json!({ "os": "ubuntu" })), "X");
    }

    #[test]
    fn test_range_over_list_and_map() {
        let data = json!({ "args": [{ "name": "A", "value": 1 }, { "name": "B", "value": 2 }], "m": { "b": 2, "a": 1 } });
        assert_eq!(
            render("{{ range $i, $a := .args }}{{ $i }}:{{ $a.name }}={{ .value }};{{ end }}", data.clone()),
            "0:A=1;1:B=2;"
        );
        assert_eq!(render("{{ range $k, $v := .m }}{{ $k }}{{ $v }}{{ end }}", data.clone()), "a1b2");
        assert_eq!(render("{{ range .none }}x{{ else }}empty{{ end }}", data), "empty");
    }

    #[test]
    fn test_with_rebinds_dot_and_root_var() {
        let data = json!({ "Release": { "Name": "kmod" }, "Values": { "image": { "tag": "v1" } } });
        assert_eq!(
            render("{{ with .Values.image }}{{ .tag }}-{{ $.Release.Name }}{{ end }}", data),
            "v1-kmod"
        );
    }

    #[test]
    fn test_pipelines_and_variables() {
        let data = json!({ "Values": { "labels": { "app": "x" } } });
        let out = render(
            "{{- $name := \"drv\" -}}\nname: {{ $name | upper | quote }}\nlabels:{{ toYaml .Values.labels | nindent 2 }}",
            data,
        );
        assert_eq!(out, "name: \"DRV\"\nlabels:\n  app: x");
    }

    #[test]
    fn test_define_and_include() {
        let mut set = TemplateSet::new();
        set.add("_helpers.tpl", r#"{{ define "sr.name" }}{{ .Release.Name }}-drv{{ end }}"#).unwrap();
        set.add("0000_ds.yaml", r#"name: {{ include "sr.name" . }} {{ template "sr.name" . }}"#).unwrap();
        let out = set.render("0000_ds.yaml", &json!({ "Release": { "Name": "a" } })).unwrap();
        assert_eq!(out, "name: a-drv a-drv");
    }

    #[test]
    fn test_exec_errors() {
        assert!(render_str("{{ nosuch .x }}", &json!({})).is_err());
        assert!(render_str("{{ required \"need tag\" .tag }}", &json!({})).is_err());
        assert!(render_str("{{ .a.b }}", &json!({ "a": "text" })).is_err());
        assert!(render_str(r#"{{ include "missing" . }}"#, &json!({})).is_err());
    }

    #[test]
    fn test_recursive_include_is_bounded() {
        let err = render_str(r#"{{ define "loop" }}{{ include "loop" . }}{{ end }}{{ include "loop" . }}"#, &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("maximum depth"));
    }
}
