//! Test fixtures and data for harness tests

use std::path::PathBuf;
use std::time::Duration;

use harness::{InstanceContainer, MonitorAction, MonitorSettings};
use serde_json::json;
use shared::payload;

/// Standard test data and fixtures
pub struct TestFixtures;

impl TestFixtures {
    pub const INSTANCE_1: &'static str = "i-0a1b2c3d4e5f60001";
    pub const INSTANCE_2: &'static str = "i-0a1b2c3d4e5f60002";
    pub const INSTANCE_3: &'static str = "i-0a1b2c3d4e5f60003";

    pub const SESSION_1: &'static str = "sync-alpha";
    pub const SESSION_2: &'static str = "sync-beta";

    pub const IMAGE_ID: &'static str = "ami-0123456789abcdef0";

    /// Generous wait used with a paused clock
    pub const WAIT: Duration = Duration::from_secs(5);

    pub fn running(instance_id: &str) -> MonitorAction {
        MonitorAction::new(instance_id, "running").with_metadata(payload([
            ("image_id", json!(Self::IMAGE_ID)),
            ("instance_type", json!("t3.micro")),
        ]))
    }

    pub fn pending(instance_id: &str) -> MonitorAction {
        MonitorAction::new(instance_id, "pending")
    }

    pub fn container(instance_id: &str, port: u16) -> InstanceContainer {
        InstanceContainer {
            container_id: format!("ctr-{instance_id}"),
            instance_id: instance_id.to_string(),
            port,
            key_file: PathBuf::from(format!("/tmp/keys/{instance_id}.pem")),
        }
    }

    pub fn monitor_settings() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(100),
            watchdog_budget: Duration::from_secs(2),
            ready_states: vec!["running".to_string()],
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    pub fn create_args(session_id: &str) -> Vec<String> {
        vec![
            "sync".to_string(),
            "create".to_string(),
            format!("--name={session_id}"),
        ]
    }
}
