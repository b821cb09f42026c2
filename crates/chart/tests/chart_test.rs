//! Loading and rendering charts from disk

use chart::{ChartFetcher, NodeFingerprint, Release, compose, group_states, load_dir, render_chart};
use crds::ChartReference;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Map, Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const NAMESPACE_TEMPLATE: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: {{ .Release.Namespace }}
"#;

const RBAC_TEMPLATE: &str = r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: {{ include "kmod.name" . }}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: Role
metadata:
  name: {{ include "kmod.name" . }}
rules: []
"#;

const DAEMONSET_TEMPLATE: &str = r#"{{- if .Values.enabled }}
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: {{ include "kmod.name" . }}
spec:
  template:
    spec:
      containers:
        - name: driver
          image: "{{ .Values.image }}:{{ .Values.kernelFullVersion }}"
          {{- with .Values.buildArgs }}
          env:
            {{- range . }}
            - name: {{ .name }}
              value: {{ .value | quote }}
            {{- end }}
          {{- end }}
{{- end }}
"#;

fn write_chart(root: &Path, version: &str) {
    fs::create_dir_all(root.join("templates")).unwrap();
    fs::write(root.join("Chart.yaml"), format!("apiVersion: v2\nname: simple-kmod\nversion: {version}\n")).unwrap();
    fs::write(root.join("values.yaml"), "enabled: true\nimage: quay.io/sro/kmod\n").unwrap();
    fs::write(
        root.join("templates/_helpers.tpl"),
        r#"{{- define "kmod.name" -}}{{ .Release.Name }}-{{ .Chart.Name }}{{- end -}}"#,
    )
    .unwrap();
    fs::write(root.join("templates/0000_ns.yaml"), NAMESPACE_TEMPLATE).unwrap();
    fs::write(root.join("templates/0010_rbac.yaml"), RBAC_TEMPLATE).unwrap();
    fs::write(root.join("templates/0020-ds.yaml"), DAEMONSET_TEMPLATE).unwrap();
    fs::write(root.join("templates/NOTES.txt"), "{{ this is not parsed").unwrap();
    fs::write(root.join("templates/020_bad.yaml"), "{{ not a state").unwrap();
}

/// Packs `chart_dir` into a gzipped tarball at `archive`, under `simple-kmod/`
fn pack(chart_dir: &Path, archive: &Path) {
    let file = fs::File::create(archive).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.append_dir_all("simple-kmod", chart_dir).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}

fn fingerprint() -> NodeFingerprint {
    NodeFingerprint {
        kernel_full_version: "4.18.0-305.el8.x86_64".into(),
        operating_system: "rhel".into(),
        os_version: "8.4".into(),
        cluster_version: String::new(),
    }
}

fn release() -> Release {
    Release {
        name: "kmod-a".into(),
        namespace: "kmods".into(),
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[test]
fn test_load_orders_templates_and_ignores_metadata_files() {
    let dir = TempDir::new().unwrap();
    write_chart(dir.path(), "0.0.1");
    let chart = load_dir(dir.path()).unwrap();

    let names: Vec<_> = chart.templates.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["templates/0000_ns.yaml", "templates/0010_rbac.yaml", "templates/0020-ds.yaml"]
    );
    assert_eq!(chart.partials.len(), 1);
    assert_eq!(chart.metadata.name, "simple-kmod");
    assert_eq!(chart.defaults["enabled"], json!(true));
}

#[test]
fn test_render_happy_path_chart_into_three_states() {
    let dir = TempDir::new().unwrap();
    write_chart(dir.path(), "0.0.1");
    let chart = load_dir(dir.path()).unwrap();

    let user = object(json!({ "buildArgs": [{ "name": "KMODVER", "value": "SRO" }] }));
    let values = compose(&chart.defaults, &[], &fingerprint().to_values(), &user);
    let states = group_states(render_chart(&chart, &release(), &values).unwrap());

    let layout: Vec<(String, Vec<&str>)> = states
        .iter()
        .map(|s| (s.key.to_string(), s.manifests.iter().map(|m| m.manifest.kind()).collect()))
        .collect();
    assert_eq!(
        layout,
        vec![
            ("0000".to_string(), vec!["Namespace"]),
            ("0010".to_string(), vec!["ServiceAccount", "Role"]),
            ("0020".to_string(), vec!["DaemonSet"]),
        ]
    );

    let ds = &states[2].manifests[0].manifest;
    assert_eq!(ds.name(), "kmod-a-simple-kmod");
    let containers = ds.get(&["spec", "template", "spec", "containers"]).unwrap();
    assert_eq!(containers[0]["image"], "quay.io/sro/kmod:4.18.0-305.el8.x86_64");
    assert_eq!(containers[0]["env"][0]["value"], "SRO");
}

#[test]
fn test_disabled_template_renders_nothing() {
    let dir = TempDir::new().unwrap();
    write_chart(dir.path(), "0.0.1");
    let chart = load_dir(dir.path()).unwrap();

    let user = object(json!({ "enabled": false }));
    let values = compose(&chart.defaults, &[], &fingerprint().to_values(), &user);
    let rendered = render_chart(&chart, &release(), &values).unwrap();
    assert!(rendered.iter().all(|m| m.manifest.kind() != "DaemonSet"));
    assert_eq!(rendered.len(), 3);
}

#[tokio::test]
async fn test_fetch_from_file_repository_directory() {
    let repo = TempDir::new().unwrap();
    write_chart(&repo.path().join("simple-kmod-0.0.1"), "0.0.1");
    let cache = TempDir::new().unwrap();

    let fetcher = ChartFetcher::new(cache.path());
    let reference = ChartReference {
        name: "simple-kmod".into(),
        version: "0.0.1".into(),
        repository: format!("file://{}/", repo.path().display()),
        path: None,
    };
    let chart = fetcher.fetch(&reference).await.unwrap();
    assert_eq!(chart.templates.len(), 3);

    let missing = ChartReference {
        version: "9.9.9".into(),
        ..reference
    };
    assert!(matches!(
        fetcher.fetch(&missing).await,
        Err(chart::ChartError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_fetch_unpacks_archive() {
    let source = TempDir::new().unwrap();
    let chart_dir = source.path().join("simple-kmod");
    write_chart(&chart_dir, "0.0.2");

    let repo = TempDir::new().unwrap();
    pack(&chart_dir, &repo.path().join("simple-kmod-0.0.2.tgz"));

    let cache = TempDir::new().unwrap();
    let fetcher = ChartFetcher::new(cache.path());
    let reference = ChartReference {
        name: "simple-kmod".into(),
        version: "0.0.2".into(),
        repository: format!("file://{}", repo.path().display()),
        path: None,
    };
    let chart = fetcher.fetch(&reference).await.unwrap();
    assert_eq!(chart.metadata.version, "0.0.2");
    assert!(chart.root.starts_with(cache.path()));
}

#[tokio::test]
async fn test_updated_archive_replaces_unpacked_templates() {
    let source = TempDir::new().unwrap();
    let chart_dir = source.path().join("simple-kmod");
    write_chart(&chart_dir, "0.0.3");
    let archive = source.path().join("simple-kmod.tgz");
    pack(&chart_dir, &archive);

    let cache = TempDir::new().unwrap();
    let fetcher = ChartFetcher::new(cache.path());
    let reference = ChartReference {
        path: Some(archive.display().to_string()),
        ..ChartReference::default()
    };
    assert_eq!(fetcher.fetch(&reference).await.unwrap().templates.len(), 3);

    fs::remove_file(chart_dir.join("templates/0020-ds.yaml")).unwrap();
    pack(&chart_dir, &archive);

    let chart = fetcher.fetch(&reference).await.unwrap();
    let names: Vec<_> = chart.templates.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["templates/0000_ns.yaml", "templates/0010_rbac.yaml"]);
    assert_eq!(chart.root, cache.path().join("simple-kmod").join("simple-kmod"));
    assert!(!chart.root.join("templates/0020-ds.yaml").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_fetches_only_see_complete_charts() {
    let source = TempDir::new().unwrap();
    let chart_dir = source.path().join("simple-kmod");
    write_chart(&chart_dir, "0.0.4");
    let archive = source.path().join("simple-kmod.tgz");
    pack(&chart_dir, &archive);

    let cache = TempDir::new().unwrap();
    let fetcher = ChartFetcher::new(cache.path());
    let reference = ChartReference {
        path: Some(archive.display().to_string()),
        ..ChartReference::default()
    };
    let (a, b, c) = tokio::join!(
        fetcher.fetch(&reference),
        fetcher.fetch(&reference),
        fetcher.fetch(&reference)
    );
    for chart in [a, b, c] {
        assert_eq!(chart.unwrap().templates.len(), 3);
    }

    // Staging directories never outlive their unpack
    let entries: Vec<_> = fs::read_dir(cache.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("simple-kmod")]);
}

#[tokio::test]
async fn test_reference_without_location_is_invalid() {
    let cache = TempDir::new().unwrap();
    let fetcher = ChartFetcher::new(cache.path());
    let reference = ChartReference {
        name: "simple-kmod".into(),
        ..ChartReference::default()
    };
    assert!(matches!(
        fetcher.fetch(&reference).await,
        Err(chart::ChartError::InvalidReference(_))
    ));
}
