/// Machine API group
pub const API_GROUP: &str = "machine.mapi.sh";
/// Machine API version
pub const API_VERSION: &str = "v1beta1";
/// Machine CRD plural name
pub const API_MACHINES: &str = "machines";
/// MachineSet CRD plural name
pub const API_MACHINE_SETS: &str = "machinesets";
/// MachineHealthCheck CRD plural name
pub const API_MACHINE_HEALTH_CHECKS: &str = "machinehealthchecks";

/// Finalizer the Machine reconciler owns on Machine objects
pub const MACHINE_FINALIZER: &str = "machines.machine.mapi.sh";
/// Node annotation holding the `<namespace>/<name>` of the linked Machine
pub const MACHINE_ANNOTATION: &str = "machine.mapi.sh/machine";
/// Annotation that pauses a MachineHealthCheck (any value)
pub const PAUSED_ANNOTATION: &str = "machine.mapi.sh/paused";
/// Machine label carrying the machine role (`master`, `worker`, ...)
pub const MACHINE_ROLE_LABEL: &str = "machine.mapi.sh/cluster-api-machine-role";
/// Role value identifying control plane machines
pub const MASTER_ROLE: &str = "master";

/// Annotations stamped on cloned external remediation objects
pub const CLONED_FROM_NAME_ANNOTATION: &str = "cluster.x-k8s.io/cloned-from-name";
pub const CLONED_FROM_GROUP_KIND_ANNOTATION: &str = "cluster.x-k8s.io/cloned-from-groupkind";

pub mod conditions;
pub mod health_check;
pub mod machine;
pub mod machine_set;
pub mod metrics;
pub mod providers;

pub mod duration {
    use std::time::Duration;

    /// Parses a Kubernetes-style duration string such as `10m`, `300s`,
    /// `1h` or `500ms`. A bare `0` is accepted and disables the timer the
    /// field configures.
    pub fn parse_duration(value: &str) -> Option<Duration> {
        let value = value.trim();
        if value == "0" {
            return Some(Duration::ZERO);
        }
        let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => value.split_at(idx),
            None => return None,
        };
        let count: u64 = digits.parse().ok()?;
        match unit {
            "ms" => Some(Duration::from_millis(count)),
            "s" => Some(Duration::from_secs(count)),
            "m" => Some(Duration::from_secs(count * 60)),
            "h" => Some(Duration::from_secs(count * 3600)),
            _ => None,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_duration() {
            assert_eq!(parse_duration("300s"), Some(Duration::from_secs(300)));
            assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
            assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
            assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
            assert_eq!(parse_duration("0"), Some(Duration::ZERO));
            assert_eq!(parse_duration("10"), None);
            assert_eq!(parse_duration("tenminutes"), None);
            assert_eq!(parse_duration(""), None);
        }
    }
}
