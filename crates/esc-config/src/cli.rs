use clap::{Parser, ValueEnum};

/// Raw command-line surface (spec §6). Kept separate from [`crate::Config`]
/// so that clap only ever deals with strings/flags; all cross-field
/// validation and parsing lives in `Config::from_cli`.
#[derive(Debug, Parser)]
#[command(name = "esc", about = "Convert an EC2 instance between spot and on-demand billing", version)]
pub struct Cli {
    /// Id of the instance to convert. Doubles as the job key.
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Desired end state.
    #[arg(long, value_enum, default_value_t = TargetBillingModelArg::Spot)]
    pub target_billing_model: TargetBillingModelArg,

    /// Change instance type during conversion.
    #[arg(long)]
    pub target_instance_type: Option<String>,

    /// Drop user data rather than carrying it forward.
    #[arg(long)]
    pub ignore_userdata: bool,

    /// Drop hibernation configuration rather than carrying it forward.
    #[arg(long)]
    pub ignore_hibernation_options: bool,

    /// JSON CPU options override, or the literal "ignore".
    #[arg(long)]
    pub cpu_options: Option<String>,

    /// Spot bid cap.
    #[arg(long)]
    pub max_spot_price: Option<f64>,

    /// KMS key id used to encrypt currently-unencrypted volumes carried into the AMI.
    #[arg(long)]
    pub volume_kms_key_id: Option<String>,

    /// Permit stopping a running instance.
    #[arg(long)]
    pub stop_instance: bool,

    /// Reboot the new instance when a post-boot attachment requires it.
    #[arg(long)]
    pub reboot_if_needed: bool,

    /// Remap CloudWatch alarms whose name matches one of these prefixes. Empty or "*" means all.
    #[arg(long, num_args = 0.., value_delimiter = ',')]
    pub update_cw_alarms: Option<Vec<String>>,

    /// Deregister the AMI and delete its snapshots after a successful conversion.
    #[arg(long)]
    pub delete_ami: bool,

    /// Enable target-group (de)registration, restricted to these ARNs. Empty or "*" means all.
    #[arg(long, num_args = 0.., value_delimiter = ',')]
    pub check_targetgroups: Option<Vec<String>>,

    /// Target-group health states considered terminal for wait-target-groups.
    #[arg(long, num_args = 0.., value_delimiter = ',')]
    pub wait_for_tg_states: Vec<String>,

    /// Convert an instance in place without requiring it to be stopped first. Unsafe.
    #[arg(long)]
    pub do_not_require_stopped_instance: bool,

    /// State-store table name.
    #[arg(long, env = "ESC_DYNAMODB_TABLENAME", default_value = "ec2-spot-converter-state-table")]
    pub dynamodb_tablename: String,

    /// Provision the state-store table and exit.
    #[arg(long)]
    pub generate_dynamodb_table: bool,

    /// Bypass the "already in target state" precondition.
    #[arg(long)]
    pub force: bool,

    /// Skip the 10-second pause issued on major warnings.
    #[arg(long)]
    pub do_not_pause_on_major_warnings: bool,

    /// Rewind the state machine to step N (1 deletes the record).
    #[arg(long)]
    pub reset_step: Option<u32>,

    /// Invoke the external diff viewer at the end of a successful run.
    #[arg(long)]
    pub review_conversion_result: bool,

    /// Region to issue all AWS calls against.
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum TargetBillingModelArg {
    Spot,
    OnDemand,
}
