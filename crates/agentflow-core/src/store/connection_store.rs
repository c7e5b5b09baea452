use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::connection::{ConnectionStatus, IntegrationConnection};

#[derive(Clone)]
pub struct ConnectionStore {
    db: Database,
}

impl ConnectionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create (or reconnect) a credential record for (user, integration).
    pub async fn upsert(
        &self,
        user_id: &str,
        integration: &str,
        access_token: &str,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IntegrationConnection, ServerError> {
        let now = Utc::now();
        let c = IntegrationConnection {
            user_id: user_id.to_string(),
            integration: integration.to_string(),
            access_token: access_token.to_string(),
            refresh_token,
            expires_at,
            status: ConnectionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let cc = c.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO integration_connections \
                     (user_id, integration, access_token, refresh_token, expires_at, status, \
                      created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6) \
                     ON CONFLICT(user_id, integration) DO UPDATE SET \
                       access_token = ?3, refresh_token = ?4, expires_at = ?5, \
                       status = 'active', updated_at = ?6",
                    rusqlite::params![
                        cc.user_id,
                        cc.integration,
                        cc.access_token,
                        cc.refresh_token,
                        cc.expires_at.map(|t| t.timestamp_millis()),
                        now.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(c)
    }

    pub async fn get(
        &self,
        user_id: &str,
        integration: &str,
    ) -> Result<Option<IntegrationConnection>, ServerError> {
        let user = user_id.to_string();
        let key = integration.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT user_id, integration, access_token, refresh_token, expires_at, \
                     status, created_at, updated_at \
                     FROM integration_connections WHERE user_id = ?1 AND integration = ?2",
                    rusqlite::params![user, key],
                    |row| Ok(row_to_connection(row)),
                )
                .optional()
            })
            .await
    }

    /// Persist refreshed tokens. Last write wins: refresh is idempotent
    /// and monotonic, so no optimistic concurrency is needed here.
    pub async fn update_tokens(
        &self,
        user_id: &str,
        integration: &str,
        access_token: &str,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), ServerError> {
        let user = user_id.to_string();
        let key = integration.to_string();
        let token = access_token.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE integration_connections SET access_token = ?3, \
                     refresh_token = COALESCE(?4, refresh_token), expires_at = ?5, updated_at = ?6 \
                     WHERE user_id = ?1 AND integration = ?2",
                    rusqlite::params![
                        user,
                        key,
                        token,
                        refresh_token,
                        expires_at.map(|t| t.timestamp_millis()),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Soft-invalidate on disconnect; the record stays for audit purposes.
    pub async fn disconnect(&self, user_id: &str, integration: &str) -> Result<bool, ServerError> {
        let user = user_id.to_string();
        let key = integration.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE integration_connections SET status = 'disconnected', updated_at = ?3 \
                     WHERE user_id = ?1 AND integration = ?2",
                    rusqlite::params![user, key, Utc::now().timestamp_millis()],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_connection(row: &rusqlite::Row<'_>) -> IntegrationConnection {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());
    let status: String = row.get(5).unwrap_or_default();
    IntegrationConnection {
        user_id: row.get(0).unwrap_or_default(),
        integration: row.get(1).unwrap_or_default(),
        access_token: row.get(2).unwrap_or_default(),
        refresh_token: row.get(3).unwrap_or(None),
        expires_at: to_dt(row.get(4).unwrap_or(None)),
        status: ConnectionStatus::parse(&status),
        created_at: to_dt(row.get(6).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_upsert_and_refresh_cycle() {
        let store = ConnectionStore::new(Database::open_in_memory().unwrap());
        let exp = Utc::now() + Duration::hours(1);
        store
            .upsert("u1", "mail", "tok-1", Some("ref-1".into()), Some(exp))
            .await
            .unwrap();

        let new_exp = Utc::now() + Duration::hours(2);
        store
            .update_tokens("u1", "mail", "tok-2", None, Some(new_exp))
            .await
            .unwrap();

        let c = store.get("u1", "mail").await.unwrap().unwrap();
        assert_eq!(c.access_token, "tok-2");
        // COALESCE keeps the old refresh token when the provider omits one.
        assert_eq!(c.refresh_token.as_deref(), Some("ref-1"));
        assert_eq!(c.status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn test_disconnect_soft_invalidates() {
        let store = ConnectionStore::new(Database::open_in_memory().unwrap());
        store.upsert("u1", "chat", "tok", None, None).await.unwrap();
        assert!(store.disconnect("u1", "chat").await.unwrap());
        let c = store.get("u1", "chat").await.unwrap().unwrap();
        assert_eq!(c.status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_expiry_check_uses_skew() {
        let now = Utc::now();
        let conn = IntegrationConnection {
            user_id: "u".into(),
            integration: "mail".into(),
            access_token: "t".into(),
            refresh_token: None,
            expires_at: Some(now + Duration::seconds(30)),
            status: ConnectionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        // Expires within the 60s skew window, so treated as expired.
        assert!(conn.is_expired_at(now));
    }
}
