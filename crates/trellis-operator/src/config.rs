//! Engine configuration from flags and `TRELLIS_*` environment variables

use clap::Args;
use thiserror::Error;

use trellis_common::crd::KubernetesCluster;
use trellis_common::telemetry::LogFormat;
use trellis_common::{InputSnapshot, DEFAULT_CLUSTER_DOMAIN};

/// Label values are at most this long
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The instance id cannot be used as a label value
    #[error("invalid instance id {value:?}: {reason}")]
    InstanceId {
        /// Offending value
        value: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// The default cluster domain is empty
    #[error("default cluster domain must not be empty")]
    EmptyClusterDomain,
}

/// Settings shared by every subcommand
#[derive(Args, Clone, Debug)]
pub struct EngineConfig {
    /// Owner label value stamped on every output object
    #[arg(long, env = "TRELLIS_INSTANCE_ID", default_value = "trellis")]
    pub instance_id: String,

    /// Kubeconfig context of the management cluster
    ///
    /// Records and outputs without a cluster belong to this cluster.
    #[arg(long, env = "TRELLIS_MANAGEMENT_CLUSTER", default_value = "mgmt")]
    pub management_cluster: String,

    /// DNS suffix for clusters whose KubernetesCluster record sets none
    #[arg(long, env = "TRELLIS_DEFAULT_CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub default_cluster_domain: String,

    /// Log line format: json or pretty
    #[arg(long, env = "TRELLIS_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,
}

impl EngineConfig {
    /// Reject values that would produce unusable outputs
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason| {
            Err(ConfigError::InstanceId {
                value: self.instance_id.clone(),
                reason,
            })
        };
        if self.instance_id.is_empty() {
            return invalid("must not be empty");
        }
        if self.instance_id.len() > MAX_LABEL_VALUE_LEN {
            return invalid("must be at most 63 characters");
        }
        let valid_chars = self
            .instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        let alnum_ends = self
            .instance_id
            .chars()
            .next()
            .zip(self.instance_id.chars().last())
            .is_some_and(|(a, b)| a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric());
        if !valid_chars || !alnum_ends {
            return invalid("must be a valid label value");
        }
        if self.default_cluster_domain.is_empty() {
            return Err(ConfigError::EmptyClusterDomain);
        }
        Ok(())
    }

    /// Kubeconfig context for a cluster name; the empty name is the management cluster
    pub fn context_for<'a>(&'a self, cluster: &'a str) -> &'a str {
        if cluster.is_empty() {
            &self.management_cluster
        } else {
            cluster
        }
    }

    /// Fill in the configured domain on clusters that do not set one
    pub fn apply_cluster_defaults(&self, snapshot: &mut InputSnapshot) {
        let clusters: Vec<KubernetesCluster> = snapshot
            .clusters
            .iter()
            .map(|c| {
                let mut c = c.clone();
                if c.spec.cluster_domain.as_deref().map_or(true, str::is_empty) {
                    c.spec.cluster_domain = Some(self.default_cluster_domain.clone());
                }
                c
            })
            .collect();
        for cluster in clusters {
            snapshot.clusters.insert(cluster);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;
    use trellis_common::crd::KubernetesClusterSpec;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: EngineConfig,
    }

    fn parse(args: &[&str]) -> EngineConfig {
        Harness::try_parse_from(std::iter::once("trellis").chain(args.iter().copied()))
            .unwrap()
            .config
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.default_cluster_domain, "cluster.local");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.context_for(""), config.management_cluster);
        assert_eq!(config.context_for("c1"), "c1");
    }

    #[rstest]
    #[case("trellis", true)]
    #[case("trellis.east-1", true)]
    #[case("", false)]
    #[case("-trellis", false)]
    #[case("trellis/east", false)]
    fn test_instance_id_must_be_a_label_value(#[case] id: &str, #[case] valid: bool) {
        let flag = format!("--instance-id={id}");
        let config = parse(&[flag.as_str()]);
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn test_cluster_domain_defaults_are_filled_in() {
        let mut snapshot = InputSnapshot::default();
        snapshot.clusters.insert(KubernetesCluster::new(
            "c1",
            KubernetesClusterSpec {
                secret_name: "c1".into(),
                cluster_domain: None,
            },
        ));
        snapshot.clusters.insert(KubernetesCluster::new(
            "c2",
            KubernetesClusterSpec {
                secret_name: "c2".into(),
                cluster_domain: Some("corp.local".into()),
            },
        ));
        let config = parse(&["--default-cluster-domain", "mesh.internal"]);
        config.apply_cluster_defaults(&mut snapshot);
        assert_eq!(snapshot.cluster_domain("c1"), "mesh.internal");
        assert_eq!(snapshot.cluster_domain("c2"), "corp.local");
    }
}
