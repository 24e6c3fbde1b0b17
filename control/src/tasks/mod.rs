use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod queue;

/// Tuning for the queue shared by services (enqueue defaults) and the
/// reconciler pool (lease/retry behavior).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: i32,
    pub lease_duration: std::time::Duration,
    pub base_backoff: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lease_duration: std::time::Duration::from_secs(60),
            base_backoff: std::time::Duration::from_secs(2),
            max_backoff: std::time::Duration::from_secs(300),
        }
    }
}

// Task payloads. The workspace kinds mostly read their inputs from the
// workspace row itself; the dependent state machines carry the ids of
// the rows they drive.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePlanPayload {
    pub plan_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodesPayload {
    pub dedicated_node_config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradePayload {
    pub kubernetes_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePayload {
    pub backup_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPayload {
    pub project_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPayload {
    pub application_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExecutionPayload {
    pub application_id: Uuid,
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionBuildPayload {
    pub application_id: Uuid,
    pub version_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_round_trip_through_json() {
        let p = CronExecutionPayload {
            application_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
        };
        let v = serde_json::to_value(&p).unwrap();
        let back: CronExecutionPayload = serde_json::from_value(v).unwrap();
        assert_eq!(back.application_id, p.application_id);
        assert_eq!(back.execution_id, p.execution_id);
    }
}
