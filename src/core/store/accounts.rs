use anyhow::Result;
use rusqlite::params;

use super::catalog::bad_column;
use super::types::{AccountStatus, ConnectedAccountRecord, Platform};
use super::{Store, now_rfc3339};

impl Store {
    /// Latest persisted account state for (user, agent, platform). The
    /// dispatcher calls this on every execution request; nothing is cached
    /// across executions.
    pub async fn connected_account(
        &self,
        user_id: &str,
        agent_id: &str,
        platform: Platform,
    ) -> Result<Option<ConnectedAccountRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, user_id, agent_id, platform, status, last_used_at, created_at
             FROM connected_accounts WHERE user_id = ?1 AND agent_id = ?2 AND platform = ?3",
        )?;
        let mut rows = stmt.query_map(
            params![user_id, agent_id, platform.as_str()],
            account_from_row,
        )?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<ConnectedAccountRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, user_id, agent_id, platform, status, last_used_at, created_at
             FROM connected_accounts WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![account_id], account_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Records a connection made by the external OAuth flow. Upserts on the
    /// (user, agent, platform) triple so a re-connect refreshes status.
    pub async fn connect_account(
        &self,
        user_id: &str,
        agent_id: &str,
        platform: Platform,
    ) -> Result<ConnectedAccountRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_rfc3339();
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO connected_accounts (id, user_id, agent_id, platform, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'connected', ?5)
             ON CONFLICT(user_id, agent_id, platform)
             DO UPDATE SET status = 'connected', last_used_at = NULL",
            params![id, user_id, agent_id, platform.as_str(), created_at],
        )?;
        let mut stmt = db.prepare(
            "SELECT id, user_id, agent_id, platform, status, last_used_at, created_at
             FROM connected_accounts WHERE user_id = ?1 AND agent_id = ?2 AND platform = ?3",
        )?;
        let record = stmt.query_row(
            params![user_id, agent_id, platform.as_str()],
            account_from_row,
        )?;
        Ok(record)
    }

    pub async fn set_account_status(&self, account_id: &str, status: AccountStatus) -> Result<bool> {
        let db = self.db().lock().await;
        let updated = db.execute(
            "UPDATE connected_accounts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), account_id],
        )?;
        Ok(updated > 0)
    }

    /// The only account mutation the dispatcher performs, and only after a
    /// successful invocation.
    pub async fn touch_account_last_used(&self, account_id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let updated = db.execute(
            "UPDATE connected_accounts SET last_used_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), account_id],
        )?;
        Ok(updated > 0)
    }
}

fn account_from_row(row: &rusqlite::Row) -> rusqlite::Result<ConnectedAccountRecord> {
    let platform_raw: String = row.get(3)?;
    let platform = Platform::from_status(&platform_raw)
        .ok_or_else(|| bad_column(3, format!("unknown platform '{platform_raw}'")))?;
    let status_raw: String = row.get(4)?;
    let status = AccountStatus::from_status(&status_raw)
        .ok_or_else(|| bad_column(4, format!("unknown account status '{status_raw}'")))?;
    Ok(ConnectedAccountRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        agent_id: row.get(2)?,
        platform,
        status,
        last_used_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;

    #[tokio::test]
    async fn connect_and_lookup() {
        let store = test_store();
        let acct = store
            .connect_account("u1", "agent-1", Platform::Gmail)
            .await
            .unwrap();
        assert_eq!(acct.status, AccountStatus::Connected);
        assert!(acct.last_used_at.is_none());

        let found = store
            .connected_account("u1", "agent-1", Platform::Gmail)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, acct.id);
        assert!(found.is_usable());
    }

    #[tokio::test]
    async fn lookup_misses_other_platform() {
        let store = test_store();
        store
            .connect_account("u1", "agent-1", Platform::Gmail)
            .await
            .unwrap();
        assert!(
            store
                .connected_account("u1", "agent-1", Platform::Slack)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn status_change_is_visible_on_next_lookup() {
        let store = test_store();
        let acct = store
            .connect_account("u1", "agent-1", Platform::Zapier)
            .await
            .unwrap();
        assert!(
            store
                .set_account_status(&acct.id, AccountStatus::Expired)
                .await
                .unwrap()
        );
        let found = store
            .connected_account("u1", "agent-1", Platform::Zapier)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.status, AccountStatus::Expired);
        assert!(!found.is_usable());
    }

    #[tokio::test]
    async fn reconnect_resets_status() {
        let store = test_store();
        let acct = store
            .connect_account("u1", "agent-1", Platform::Make)
            .await
            .unwrap();
        store
            .set_account_status(&acct.id, AccountStatus::Error)
            .await
            .unwrap();
        let again = store
            .connect_account("u1", "agent-1", Platform::Make)
            .await
            .unwrap();
        assert_eq!(again.id, acct.id, "upsert keeps the original row");
        assert_eq!(again.status, AccountStatus::Connected);
    }

    #[tokio::test]
    async fn touch_last_used() {
        let store = test_store();
        let acct = store
            .connect_account("u1", "agent-1", Platform::Slack)
            .await
            .unwrap();
        assert!(store.touch_account_last_used(&acct.id).await.unwrap());
        let found = store.get_account(&acct.id).await.unwrap().unwrap();
        assert!(found.last_used_at.is_some());
        assert!(!store.touch_account_last_used("ghost").await.unwrap());
    }
}
