//! Main entry point for the harness binary
//!
//! Runs the readiness scenario against simulated collaborators and exits
//! non-zero if any stage fails or the scenario overruns its budget.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use harness::config::HarnessConfigBuilder;
use harness::scenarios::run_readiness_scenario;
use harness::{HarnessConfig, HarnessError, HarnessResult};
use shared::logging;

/// Drive a simulated readiness scenario through the coordination core
#[derive(Parser)]
#[command(name = "harness")]
#[command(about = "Runs a simulated instance readiness scenario end to end")]
pub struct Args {
    /// Instance ids to provision (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "i-0001,i-0002")]
    pub instances: Vec<String>,

    /// Log level (trace, debug, info, warn, error); overrides HARNESS_LOG_LEVEL
    #[arg(long)]
    pub log_level: Option<String>,

    /// Monitor poll interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Overall scenario budget in seconds
    #[arg(long)]
    pub scenario_budget_secs: Option<u64>,

    /// Per-stage event wait timeout in milliseconds
    #[arg(long)]
    pub wait_timeout_ms: Option<u64>,

    /// Stream diagnostics as JSON lines to this file
    #[arg(long)]
    pub diagnostics_path: Option<PathBuf>,
}

impl Args {
    fn into_config(self, base: HarnessConfig) -> HarnessResult<HarnessConfig> {
        let mut builder = HarnessConfigBuilder::from_config(base);
        if let Some(level) = self.log_level {
            builder = builder.log_level(level);
        }
        if let Some(ms) = self.poll_interval_ms {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = self.scenario_budget_secs {
            builder = builder.scenario_budget(Duration::from_secs(secs));
        }
        if let Some(ms) = self.wait_timeout_ms {
            builder = builder.wait_timeout(Duration::from_millis(ms));
        }
        if self.diagnostics_path.is_some() {
            builder = builder.diagnostics_path(self.diagnostics_path);
        }
        Ok(builder.build()?)
    }
}

#[tokio::main]
async fn main() -> HarnessResult<()> {
    let args = Args::parse();
    let instances = args.instances.clone();
    if instances.is_empty() {
        return Err(HarnessError::ConfigurationError {
            field: "instances".to_string(),
            message: "at least one instance id is required".to_string(),
        });
    }

    let config = args.into_config(HarnessConfig::from_env()?)?;
    logging::init_tracing_with_level("harness", Some(&config.log_level));
    logging::log_startup("harness", &format!("readiness scenario for {} instance(s)", instances.len()));

    match run_readiness_scenario(&config, &instances).await {
        Ok(report) => {
            for instance in &report.instances {
                println!(
                    "{}  port={}  container={}  session={}",
                    instance.instance_id, instance.port, instance.container_id, instance.session_id
                );
            }
            println!(
                "ready={} heartbeats={} disposed={} unconsumed_events={} elapsed={:.2?}",
                report.instances.len(),
                report.heartbeats,
                report.teardown.cleanup.disposed.len(),
                report.teardown.unconsumed_events,
                report.elapsed
            );
            logging::log_shutdown("harness", "scenario complete");
            Ok(())
        }
        Err(e) => {
            logging::log_error("harness", "Readiness scenario", &e);
            Err(e)
        }
    }
}
