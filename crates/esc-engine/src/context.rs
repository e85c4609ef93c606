use std::sync::Arc;

use esc_config::Config;
use esc_driver::{AcceleratorClient, ComputeClient, DiffViewer, KeyManagementClient, LoadBalancerClient, MetricAlarmClient};
use esc_store::StateStore;

/// Everything a handler needs, injected once at startup (spec §9:
/// "process-wide mutable `states` and `args`" replaced by values passed
/// explicitly into the Engine and each handler).
pub struct EngineContext {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub compute: Arc<dyn ComputeClient>,
    pub accelerator: Arc<dyn AcceleratorClient>,
    pub kms: Arc<dyn KeyManagementClient>,
    pub load_balancer: Arc<dyn LoadBalancerClient>,
    pub alarms: Arc<dyn MetricAlarmClient>,
    pub diff_viewer: Arc<dyn DiffViewer>,
    pub tool_version: String,
}
