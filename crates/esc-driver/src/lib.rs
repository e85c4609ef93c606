pub mod aws_accelerator;
pub mod aws_compute;
pub mod aws_cw;
pub mod aws_kms;
pub mod aws_lb;
pub mod credentials;
pub mod diff;
pub mod error;
pub mod fake;
pub mod sigv4;
pub mod traits;
pub mod transport;
pub mod xml;

pub use aws_accelerator::AwsAcceleratorClient;
pub use aws_compute::AwsComputeClient;
pub use aws_cw::AwsMetricAlarmClient;
pub use aws_kms::AwsKeyManagementClient;
pub use aws_lb::AwsLoadBalancerClient;
pub use diff::{NullDiffViewer, ShellDiffViewer};
pub use error::DriverError;
pub use fake::{FakeAcceleratorClient, FakeComputeClient, FakeKeyManagementClient, FakeLoadBalancerClient, FakeMetricAlarmClient};
pub use traits::{AcceleratorClient, ComputeClient, DiffViewer, KeyManagementClient, LoadBalancerClient, MetricAlarmClient};
