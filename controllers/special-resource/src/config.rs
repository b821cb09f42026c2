//! Operator configuration
//!
//! Command line flags, each of which can also be supplied through the
//! environment. `KUBECONFIG` is honoured by the Kubernetes client itself.

use crate::error::ControllerError;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Flags of the operator binary
#[derive(Debug, Clone, Parser)]
#[command(name = "special-resource-operator", version, about)]
pub struct OperatorConfig {
    /// Address the metrics and probe endpoints bind to (`:8080` binds all interfaces)
    #[arg(long, env = "METRICS_ADDR", default_value = ":8080")]
    pub metrics_addr: String,

    /// Hold a Lease before reconciling so only one replica is active
    #[arg(long, env = "ENABLE_LEADER_ELECTION", default_value_t = false)]
    pub enable_leader_election: bool,

    /// Namespace holding the dependency ConfigMap and the leader Lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "special-resource-operator")]
    pub operator_namespace: String,

    /// Readiness deadline for each state, in seconds
    #[arg(long, env = "STATE_TIMEOUT_SECS", default_value_t = 600)]
    pub state_timeout_secs: u64,

    /// Interval between readiness checks, in seconds
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Deadline for a whole reconcile, in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 3600)]
    pub reconcile_timeout_secs: u64,

    /// Directory downloaded chart archives are unpacked into
    #[arg(long, env = "CHART_CACHE_DIR", default_value = "/tmp/sro-charts")]
    pub chart_cache_dir: PathBuf,

    /// Maximum number of SpecialResources reconciled at once
    #[arg(long, env = "CONCURRENCY", default_value_t = 3)]
    pub concurrency: u16,

    /// Name of the Lease used for leader election
    #[arg(long, env = "LEASE_NAME", default_value = "special-resource-operator-lock")]
    pub lease_name: String,
}

impl OperatorConfig {
    /// Rejects values the operator cannot run with
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.operator_namespace.trim().is_empty() {
            return Err(ControllerError::Config("operator namespace must not be empty".to_string()));
        }
        if self.state_timeout_secs == 0 || self.poll_interval_secs == 0 || self.reconcile_timeout_secs == 0 {
            return Err(ControllerError::Config("timeouts and poll interval must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ControllerError::Config("concurrency must be at least 1".to_string()));
        }
        if self.enable_leader_election && self.lease_name.trim().is_empty() {
            return Err(ControllerError::Config("lease name must not be empty".to_string()));
        }
        self.metrics_socket_addr().map(|_| ())
    }

    /// `--metrics-addr` as a socket address; a bare `:port` binds all interfaces
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, ControllerError> {
        let addr = if self.metrics_addr.starts_with(':') {
            format!("0.0.0.0{}", self.metrics_addr)
        } else {
            self.metrics_addr.clone()
        };
        addr.parse()
            .map_err(|e| ControllerError::Config(format!("invalid metrics address {}: {}", self.metrics_addr, e)))
    }

    /// Per-state readiness deadline
    pub fn state_timeout(&self) -> Duration {
        Duration::from_secs(self.state_timeout_secs)
    }

    /// Readiness poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Per-reconcile deadline
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::try_parse_from(["special-resource-operator"]).unwrap();
        assert_eq!(config.metrics_addr, ":8080");
        assert!(!config.enable_leader_election);
        assert_eq!(config.state_timeout(), Duration::from_secs(600));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(3600));
        assert_eq!(config.metrics_socket_addr().unwrap(), "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = OperatorConfig::try_parse_from([
            "special-resource-operator",
            "--metrics-addr",
            "127.0.0.1:9090",
            "--enable-leader-election",
            "--operator-namespace",
            "sro-system",
        ])
        .unwrap();
        assert!(config.enable_leader_election);
        assert_eq!(config.operator_namespace, "sro-system");
        assert_eq!(config.metrics_socket_addr().unwrap().port(), 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = OperatorConfig::try_parse_from(["special-resource-operator"]).unwrap();
        config.metrics_addr = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(ControllerError::Config(_))));

        let mut config = OperatorConfig::try_parse_from(["special-resource-operator"]).unwrap();
        config.poll_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ControllerError::Config(_))));
    }
}
