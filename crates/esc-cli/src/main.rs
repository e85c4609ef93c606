mod output;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use esc_config::{Cli, Command, Config};
use esc_driver::{
    AwsAcceleratorClient, AwsComputeClient, AwsKeyManagementClient, AwsLoadBalancerClient,
    AwsMetricAlarmClient, DiffViewer, KeyManagementClient, NullDiffViewer, ShellDiffViewer,
};
use esc_engine::{Engine, EngineContext};
use esc_store::{DynamoDbStateStore, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    // `GenerateDynamoDbTable` and `ResetStep` short-circuit before `Config`
    // is fully validated (spec §6), so the table name/region needed to act
    // on them are pulled off the raw CLI surface before it's consumed.
    let dynamodb_tablename = cli.dynamodb_tablename.clone();
    let region = cli.region.clone().unwrap_or_else(|| "us-east-1".to_string());

    match Config::from_cli(cli).context("invalid configuration")? {
        Command::GenerateDynamoDbTable => {
            let store = DynamoDbStateStore::new(dynamodb_tablename.clone(), region);
            store.create_table().await.context("provisioning state table")?;
            info!(table = %dynamodb_tablename, "state table provisioned");
            Ok(())
        }
        Command::ResetStep { instance_id, step } => {
            let store = DynamoDbStateStore::new(dynamodb_tablename, region);
            esc_engine::reset_step(&store, &instance_id, step)
                .await
                .context("reset-step failed")?;
            Ok(())
        }
        Command::Convert(config) => run_conversion(config).await,
    }
}

async fn run_conversion(config: Config) -> Result<()> {
    let region = config.region.clone().unwrap_or_else(|| "us-east-1".to_string());
    let job_id = config.instance_id.clone();

    let kms = AwsKeyManagementClient::new(region.clone());
    if let Some(key_id) = &config.volume_kms_key_id {
        kms.describe_key(key_id)
            .await
            .context("validating --volume-kms-key-id")?;
    }

    let review_conversion_result = config.review_conversion_result;
    let diff_viewer: Arc<dyn DiffViewer> = if review_conversion_result {
        Arc::new(ShellDiffViewer)
    } else {
        Arc::new(NullDiffViewer)
    };

    let ctx = EngineContext {
        store: Arc::new(DynamoDbStateStore::new(config.dynamodb_tablename.clone(), region.clone())),
        compute: Arc::new(AwsComputeClient::new(region.clone())),
        accelerator: Arc::new(AwsAcceleratorClient::new(region.clone())),
        kms: Arc::new(kms),
        load_balancer: Arc::new(AwsLoadBalancerClient::new(region.clone())),
        alarms: Arc::new(AwsMetricAlarmClient::new(region)),
        diff_viewer: diff_viewer.clone(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        config,
    };

    let engine = Engine::new(ctx);
    let record = engine.run(&job_id).await.context("conversion failed")?;
    output::summarize(&record);

    if review_conversion_result {
        let initial = serde_json::to_value(&record.initial_instance_state).context("serializing initial instance state")?;
        let final_state = serde_json::to_value(&record.final_instance_state).context("serializing final instance state")?;
        diff_viewer.show(&initial, &final_state).await.context("reviewing conversion result")?;
    }

    Ok(())
}
