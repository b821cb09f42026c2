//! Cluster node fingerprint and the values it contributes

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kernel and OS identity of the cluster's representative worker node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFingerprint {
    /// Full kernel version, e.g. `4.18.0-305.19.1.el8_4.x86_64`
    pub kernel_full_version: String,
    /// OS family, `rhcos` already mapped to `rhel`
    pub operating_system: String,
    /// OS release version, `<major>.<minor>`
    pub os_version: String,
    /// Platform release version, empty when unknown
    pub cluster_version: String,
}

const ARCH_SUFFIXES: [&str; 4] = [".x86_64", ".aarch64", ".ppc64le", ".s390x"];

impl NodeFingerprint {
    /// Major component of the OS version
    pub fn os_major(&self) -> &str {
        self.os_version.split('.').next().unwrap_or_default()
    }

    /// OS family and major version, e.g. `rhel8`
    pub fn operating_system_major(&self) -> String {
        format!("{}{}", self.operating_system, self.os_major())
    }

    /// OS family and full version, e.g. `rhel8.4`
    pub fn operating_system_major_minor(&self) -> String {
        format!("{}{}", self.operating_system, self.os_version)
    }

    /// Kernel version up to the first release component, e.g. `4.18.0-305`
    pub fn kernel_patch_version(&self) -> String {
        let kernel = ARCH_SUFFIXES
            .iter()
            .find_map(|arch| self.kernel_full_version.strip_suffix(arch))
            .unwrap_or(&self.kernel_full_version);
        match kernel.split_once('-') {
            Some((base, release)) => {
                let patch: String = release.chars().take_while(char::is_ascii_digit).collect();
                if patch.is_empty() {
                    base.to_string()
                } else {
                    format!("{base}-{patch}")
                }
            }
            None => kernel.to_string(),
        }
    }

    /// Values layer contributed to composition
    pub fn to_values(&self) -> Map<String, Value> {
        let mut values = Map::new();
        values.insert("kernelFullVersion".into(), self.kernel_full_version.clone().into());
        values.insert("osVersion".into(), self.os_version.clone().into());
        values.insert("operatingSystem".into(), self.operating_system.clone().into());
        values.insert("clusterVersion".into(), self.cluster_version.clone().into());
        values.insert("operatingSystemMajor".into(), self.operating_system_major().into());
        values.insert("operatingSystemMajorMinor".into(), self.operating_system_major_minor().into());
        values.insert("kernelPatchVersion".into(), self.kernel_patch_version().into());
        values
    }
}
