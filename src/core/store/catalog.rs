use anyhow::Result;
use rusqlite::params;

use super::types::{AgentRecord, AgentStatus, Platform};
use super::{Store, now_rfc3339};
use crate::core::errors::DispatchError;

/// Parameters for registering a new agent. The webhook URL is probed once at
/// registration time by the dispatcher before this row is written.
pub struct NewAgent {
    pub publisher_id: String,
    pub name: String,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub price: i64,
    pub platform: Option<Platform>,
    pub input_schema: serde_json::Value,
}

impl Store {
    pub async fn register_agent(&self, new_agent: NewAgent) -> Result<AgentRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_rfc3339();
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO agents (id, publisher_id, name, webhook_url, webhook_secret, price, status, platform, input_schema, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'draft', ?7, ?8, ?9)",
            params![
                id,
                new_agent.publisher_id,
                new_agent.name,
                new_agent.webhook_url,
                new_agent.webhook_secret,
                new_agent.price,
                new_agent.platform.map(|p| p.as_str()),
                new_agent.input_schema.to_string(),
                created_at,
            ],
        )?;
        Ok(AgentRecord {
            id,
            publisher_id: new_agent.publisher_id,
            name: new_agent.name,
            webhook_url: new_agent.webhook_url,
            webhook_secret: new_agent.webhook_secret,
            price: new_agent.price,
            status: AgentStatus::Draft,
            platform: new_agent.platform,
            input_schema: new_agent.input_schema,
            created_at,
        })
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, publisher_id, name, webhook_url, webhook_secret, price, status, platform, input_schema, created_at
             FROM agents WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![agent_id], agent_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Catalog lookup for the dispatcher. Status is re-read from the store on
    /// every call; an agent disabled mid-flight rejects new executions even
    /// if it was active moments earlier.
    pub async fn active_agent(&self, agent_id: &str) -> Result<AgentRecord, DispatchError> {
        let agent = self
            .get_agent(agent_id)
            .await
            .map_err(DispatchError::Internal)?
            .ok_or_else(|| DispatchError::AgentNotFound(agent_id.to_string()))?;
        if agent.status != AgentStatus::Active {
            return Err(DispatchError::AgentNotActive(agent_id.to_string()));
        }
        Ok(agent)
    }

    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<bool> {
        let db = self.db().lock().await;
        let updated = db.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.as_str(), agent_id],
        )?;
        Ok(updated > 0)
    }

    pub async fn agents_for_publisher(&self, publisher_id: &str) -> Result<Vec<AgentRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, publisher_id, name, webhook_url, webhook_secret, price, status, platform, input_schema, created_at
             FROM agents WHERE publisher_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![publisher_id], agent_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

fn agent_from_row(row: &rusqlite::Row) -> rusqlite::Result<AgentRecord> {
    let status_raw: String = row.get(6)?;
    let status = AgentStatus::from_status(&status_raw)
        .ok_or_else(|| bad_column(6, format!("unknown agent status '{status_raw}'")))?;
    let platform_raw: Option<String> = row.get(7)?;
    let platform = match platform_raw {
        Some(p) => Some(
            Platform::from_status(&p)
                .ok_or_else(|| bad_column(7, format!("unknown platform '{p}'")))?,
        ),
        None => None,
    };
    let schema_raw: String = row.get(8)?;
    let input_schema = serde_json::from_str(&schema_raw)
        .map_err(|e| bad_column(8, format!("input_schema is not valid JSON: {e}")))?;
    Ok(AgentRecord {
        id: row.get(0)?,
        publisher_id: row.get(1)?,
        name: row.get(2)?,
        webhook_url: row.get(3)?,
        webhook_secret: row.get(4)?,
        price: row.get(5)?,
        status,
        platform,
        input_schema,
        created_at: row.get(9)?,
    })
}

pub(crate) fn bad_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}
