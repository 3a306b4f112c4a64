//! `Query` command: raw SQL against the storage surface.
//!
//! Read-only statements are answered from peek without a commit; mutations
//! fall through to process so the replication layer can commit them.

use async_trait::async_trait;

use stratum_cluster::cluster::SqlSession;

use super::{Plugin, PluginVote, StepFault, StepResult};
use crate::command::Command;

#[derive(Default)]
pub struct DbPlugin;

impl DbPlugin {
    pub fn new() -> Self {
        Self
    }

    fn query_text(cmd: &Command) -> StepResult<String> {
        let text = match cmd.request.headers.get("query") {
            Some(query) => query.to_string(),
            None => String::from_utf8(cmd.request.body.clone())
                .map_err(|_| StepFault::status("400 Query is not UTF-8"))?,
        };
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(StepFault::status("400 Missing query"));
        }
        Ok(text)
    }

    fn is_read_only(sql: &str) -> bool {
        let keyword = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        matches!(keyword.as_str(), "select" | "explain" | "pragma" | "with")
    }
}

#[async_trait]
impl Plugin for DbPlugin {
    fn name(&self) -> &'static str {
        "db"
    }

    async fn peek(
        &self,
        db: &mut dyn SqlSession,
        cmd: &mut Command,
    ) -> StepResult<PluginVote> {
        if cmd.request.method() != "Query" {
            return Ok(PluginVote::Decline);
        }
        let sql = Self::query_text(cmd)?;
        if !Self::is_read_only(&sql) {
            // Mutations need the process phase and a commit.
            return Ok(PluginVote::Decline);
        }
        let rows = db.execute(&sql).map_err(StepFault::from)?;
        cmd.json_content
            .insert("rows".into(), serde_json::json!(rows));
        Ok(PluginVote::Handled)
    }

    async fn process(
        &self,
        db: &mut dyn SqlSession,
        cmd: &mut Command,
    ) -> StepResult<PluginVote> {
        if cmd.request.method() != "Query" {
            return Ok(PluginVote::Decline);
        }
        let sql = Self::query_text(cmd)?;
        let rows = db.execute(&sql).map_err(StepFault::from)?;
        cmd.json_content
            .insert("rows".into(), serde_json::json!(rows));
        Ok(PluginVote::Handled)
    }
}
