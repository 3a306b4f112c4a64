//! `Status` command: cluster view as JSON.

use async_trait::async_trait;

use stratum_cluster::cluster::{ClusterHandle, SqlSession};

use super::{Plugin, PluginVote, Severity, StepFault, StepResult};
use crate::command::Command;

pub struct StatusPlugin {
    handle: ClusterHandle,
}

impl StatusPlugin {
    pub fn new(handle: ClusterHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Plugin for StatusPlugin {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn peek(
        &self,
        _db: &mut dyn SqlSession,
        cmd: &mut Command,
    ) -> StepResult<PluginVote> {
        if cmd.request.method() != "Status" {
            return Ok(PluginVote::Decline);
        }
        let status = self
            .handle
            .status()
            .await
            .ok_or_else(|| StepFault::status("500 Cluster unavailable").with_severity(Severity::Alert))?;
        let value = serde_json::to_value(&status).map_err(|err| {
            StepFault::status(format!("500 Status serialization failed: {err}"))
                .with_severity(Severity::Alert)
        })?;
        if let serde_json::Value::Object(map) = value {
            cmd.json_content = map;
        }
        Ok(PluginVote::Handled)
    }
}
