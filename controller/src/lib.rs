pub mod util;

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec};

lazy_static! {
    // Reports the number of selected Machines per MachineSet
    pub static ref MACHINE_SET_REPLICAS_METRIC: IntGaugeVec = prometheus::register_int_gauge_vec!(
        "mapi_machine_set_replicas",
        "Machine API MachineSet observed replica count",
        &["namespace", "name"]
    )
    .unwrap();
    // Counts remediations dispatched per MachineHealthCheck, by path
    pub static ref REMEDIATION_COUNT_METRIC: IntCounterVec = prometheus::register_int_counter_vec!(
        "mapi_health_check_remediations",
        "Machine API MachineHealthCheck remediations dispatched",
        &["namespace", "name", "path"]
    )
    .unwrap();
}
