//! Value composition
//!
//! Layers, lowest to highest precedence: chart defaults, parent outputs,
//! cluster fingerprint, user values. Mappings merge recursively; any other
//! value (including sequences) replaces what was below it.

use serde_json::{Map, Value};
use tracing::warn;

/// Keys contributed by the node fingerprint
pub const RESERVED_KEYS: [&str; 4] = ["kernelFullVersion", "osVersion", "operatingSystem", "clusterVersion"];

/// Merges `overlay` into `base`
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => deep_merge(existing, incoming),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Builds the values a chart is rendered with
pub fn compose(
    defaults: &Map<String, Value>,
    parent_outputs: &[Map<String, Value>],
    fingerprint: &Map<String, Value>,
    user_values: &Map<String, Value>,
) -> Map<String, Value> {
    let mut values = defaults.clone();
    for outputs in parent_outputs {
        deep_merge(&mut values, outputs);
    }
    deep_merge(&mut values, fingerprint);

    for key in RESERVED_KEYS {
        if let Some(user) = user_values.get(key) {
            if fingerprint.get(key) != Some(user) {
                warn!(
                    "User value {}={} overrides cluster fingerprint value {}",
                    key,
                    user,
                    fingerprint.get(key).unwrap_or(&serde_json::Value::Null)
                );
            }
        }
    }
    deep_merge(&mut values, user_values);
    values
}
