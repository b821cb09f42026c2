//! Equality-based label selectors
//!
//! Only the subset the operator emits is supported: comma separated
//! `key=value`, `key==value`, `key!=value` and bare `key` (existence) terms.

use crds::Manifest;

/// Builds a selector string from `key=value` pairs
pub fn equality_selector<'a>(terms: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    terms
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when the object's labels satisfy every term of `selector`
pub fn matches(selector: &str, object: &Manifest) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                object.label(key.trim()) != Some(value.trim())
            } else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
                object.label(key.trim()) == Some(value.trim())
            } else {
                object.label(term).is_some()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled() -> Manifest {
        let mut m = Manifest::new("v1", "ConfigMap", "cm");
        m.set_label("app.kubernetes.io/managed-by", "Helm");
        m.set_label("tier", "driver");
        m
    }

    #[test]
    fn test_equality_terms() {
        let m = labelled();
        assert!(matches("app.kubernetes.io/managed-by=Helm", &m));
        assert!(matches("app.kubernetes.io/managed-by==Helm,tier=driver", &m));
        assert!(!matches("tier=toolchain", &m));
        assert!(matches("tier!=toolchain", &m));
        assert!(matches("tier", &m));
        assert!(!matches("missing", &m));
        assert!(matches("", &m));
    }

    #[test]
    fn test_equality_selector_joins_terms() {
        assert_eq!(equality_selector([("a", "1"), ("b", "2")]), "a=1,b=2");
    }
}
