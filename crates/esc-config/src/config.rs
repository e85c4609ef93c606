use serde::Serialize;

use esc_domain::{BillingModel, CpuOptions, CpuOptionsArg, InstanceId, TargetHealthState};

use crate::cli::{Cli, TargetBillingModelArg};
use crate::error::ConfigError;

/// A configuration option whose presence gates an optional phase of the
/// conversion and whose value restricts which resources it applies to
/// (spec §6: "empty or `*` means all").
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFilter {
    All,
    Some(Vec<String>),
}

impl ResourceFilter {
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            ResourceFilter::All => true,
            ResourceFilter::Some(items) => items.iter().any(|i| i == candidate),
        }
    }

    fn from_values(values: Vec<String>) -> Self {
        if values.is_empty() || values.iter().any(|v| v == "*") {
            ResourceFilter::All
        } else {
            ResourceFilter::Some(values)
        }
    }
}

/// The validated, typed configuration surface (spec §6; Design Notes §9:
/// "typed configuration struct with an enumerated set of optional fields").
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub instance_id: InstanceId,
    pub target_billing_model: BillingModel,
    pub target_instance_type: Option<String>,
    pub ignore_userdata: bool,
    pub ignore_hibernation_options: bool,
    pub cpu_options: Option<CpuOptionsArg>,
    pub max_spot_price: Option<f64>,
    pub volume_kms_key_id: Option<String>,
    pub stop_instance: bool,
    pub reboot_if_needed: bool,
    pub update_cw_alarms: Option<ResourceFilter>,
    pub delete_ami: bool,
    pub check_targetgroups: Option<ResourceFilter>,
    pub wait_for_tg_states: Vec<TargetHealthState>,
    pub do_not_require_stopped_instance: bool,
    pub dynamodb_tablename: String,
    pub force: bool,
    pub do_not_pause_on_major_warnings: bool,
    pub review_conversion_result: bool,
    pub region: Option<String>,
}

/// One-shot commands handled before the engine ever runs (spec §6:
/// "`reset-step`, `generate-dynamodb-table`, and `version` are handled
/// before the engine runs, not passed into it").
#[derive(Debug, Clone)]
pub enum Command {
    GenerateDynamoDbTable,
    ResetStep { instance_id: InstanceId, step: u32 },
    Convert(Config),
}

impl Config {
    /// Validate and lower the raw CLI surface into a typed [`Command`].
    pub fn from_cli(cli: Cli) -> Result<Command, ConfigError> {
        if cli.generate_dynamodb_table {
            return Ok(Command::GenerateDynamoDbTable);
        }

        let instance_id = cli
            .instance_id
            .clone()
            .map(InstanceId::new)
            .ok_or_else(|| ConfigError::InvalidConfig("--instance-id is required".into()))?;

        if let Some(step) = cli.reset_step {
            return Ok(Command::ResetStep { instance_id, step });
        }

        let target_billing_model = match cli.target_billing_model {
            TargetBillingModelArg::Spot => BillingModel::Spot,
            TargetBillingModelArg::OnDemand => BillingModel::OnDemand,
        };

        let cpu_options = cli
            .cpu_options
            .as_deref()
            .map(parse_cpu_options)
            .transpose()?;

        if let Some(price) = cli.max_spot_price {
            if !(price > 0.0) {
                return Err(ConfigError::InvalidConfig(
                    "--max-spot-price must be > 0".into(),
                ));
            }
        }

        let wait_for_tg_states = if cli.wait_for_tg_states.is_empty() {
            vec![TargetHealthState::Unused, TargetHealthState::Healthy]
        } else {
            cli.wait_for_tg_states
                .iter()
                .map(|s| {
                    s.parse::<TargetHealthState>().map_err(|_| {
                        ConfigError::InvalidConfig(format!(
                            "unrecognized --wait-for-tg-states value '{s}'"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Command::Convert(Config {
            instance_id,
            target_billing_model,
            target_instance_type: cli.target_instance_type,
            ignore_userdata: cli.ignore_userdata,
            ignore_hibernation_options: cli.ignore_hibernation_options,
            cpu_options,
            max_spot_price: cli.max_spot_price,
            volume_kms_key_id: cli.volume_kms_key_id,
            stop_instance: cli.stop_instance,
            reboot_if_needed: cli.reboot_if_needed,
            update_cw_alarms: cli.update_cw_alarms.map(ResourceFilter::from_values),
            delete_ami: cli.delete_ami,
            check_targetgroups: cli.check_targetgroups.map(ResourceFilter::from_values),
            wait_for_tg_states,
            do_not_require_stopped_instance: cli.do_not_require_stopped_instance,
            dynamodb_tablename: cli.dynamodb_tablename,
            force: cli.force,
            do_not_pause_on_major_warnings: cli.do_not_pause_on_major_warnings,
            review_conversion_result: cli.review_conversion_result,
            region: cli.region,
        }))
    }
}

fn parse_cpu_options(raw: &str) -> Result<CpuOptionsArg, ConfigError> {
    if raw.eq_ignore_ascii_case("ignore") {
        return Ok(CpuOptionsArg::Ignore);
    }
    let opts: CpuOptions = serde_json::from_str(raw)
        .map_err(|e| ConfigError::InvalidCpuOptions(e.to_string()))?;
    Ok(CpuOptionsArg::Override(opts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli_with(args: &[&str]) -> Cli {
        let mut full = vec!["esc"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn requires_instance_id_unless_generating_table() {
        let cli = cli_with(&["--generate-dynamodb-table"]);
        assert!(matches!(
            Config::from_cli(cli).unwrap(),
            Command::GenerateDynamoDbTable
        ));

        let cli = cli_with(&[]);
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn reset_step_short_circuits_before_full_validation() {
        let cli = cli_with(&["--instance-id", "i-1", "--reset-step", "1"]);
        match Config::from_cli(cli).unwrap() {
            Command::ResetStep { instance_id, step } => {
                assert_eq!(instance_id.as_str(), "i-1");
                assert_eq!(step, 1);
            }
            _ => panic!("expected ResetStep"),
        }
    }

    #[test]
    fn cpu_options_ignore_literal_is_recognized() {
        let cli = cli_with(&["--instance-id", "i-1", "--cpu-options", "ignore"]);
        match Config::from_cli(cli).unwrap() {
            Command::Convert(cfg) => assert_eq!(cfg.cpu_options, Some(CpuOptionsArg::Ignore)),
            _ => panic!("expected Convert"),
        }
    }

    #[test]
    fn empty_check_targetgroups_filter_means_all() {
        let filter = ResourceFilter::from_values(vec![]);
        assert_eq!(filter, ResourceFilter::All);
        assert!(filter.matches("arn:any"));
    }

    #[test]
    fn max_spot_price_must_be_positive() {
        let mut cli = cli_with(&["--instance-id", "i-1"]);
        cli.max_spot_price = Some(-1.0);
        assert!(Config::from_cli(cli).is_err());
    }
}
