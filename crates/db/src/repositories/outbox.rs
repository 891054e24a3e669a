use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use leaveflow_core::domain::org::UserId;
use leaveflow_core::notify::{
    NotificationError, NotificationEventType, NotificationPayload, NotificationSink,
};

use super::{decode_error, parse_timestamp, RepositoryError};
use crate::DbPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: String,
    pub user_id: UserId,
    pub event_type: NotificationEventType,
    pub payload: NotificationPayload,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Durable notification queue. `notify` only records the message; a relay drains the
/// pending entries and reports back through `mark_delivered` / `mark_failed`.
pub struct SqlNotificationOutbox {
    pool: DbPool,
}

impl SqlNotificationOutbox {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(
        &self,
        user_id: &UserId,
        event_type: NotificationEventType,
        payload: &NotificationPayload,
    ) -> Result<String, RepositoryError> {
        let id = Uuid::new_v4().to_string();
        let payload_json = serde_json::to_string(payload).map_err(decode_error)?;

        sqlx::query(
            "INSERT INTO notification_outbox (id, user_id, event_type, leave_request_id,
                                              payload_json, status, attempts, created_at)
             VALUES (?, ?, ?, ?, ?, 'pending', 0, ?)",
        )
        .bind(&id)
        .bind(&user_id.0)
        .bind(event_type.as_str())
        .bind(&payload.leave_request_id.0)
        .bind(payload_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            event_name = "notification.enqueued",
            outbox_id = %id,
            user_id = %user_id,
            event_type = %event_type,
            leave_request_id = %payload.leave_request_id,
            "notification queued"
        );
        Ok(id)
    }

    /// Oldest pending entries first.
    pub async fn pending(&self, limit: u32) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, event_type, payload_json, status, attempts, last_error,
                    created_at, delivered_at
             FROM notification_outbox
             WHERE status = 'pending'
             ORDER BY created_at, id
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    pub async fn entries_for_request(
        &self,
        leave_request_id: &str,
    ) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, event_type, payload_json, status, attempts, last_error,
                    created_at, delivered_at
             FROM notification_outbox
             WHERE leave_request_id = ?
             ORDER BY created_at, id",
        )
        .bind(leave_request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    pub async fn mark_delivered(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE notification_outbox
             SET status = 'delivered', attempts = attempts + 1, delivered_at = ?, last_error = NULL
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records a failed attempt. The entry stays pending until `max_attempts` is reached.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE notification_outbox
             SET attempts = attempts + 1,
                 last_error = ?,
                 status = CASE WHEN attempts + 1 >= ? THEN 'failed' ELSE 'pending' END
             WHERE id = ? AND status = 'pending'",
        )
        .bind(error)
        .bind(i64::from(max_attempts))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl NotificationSink for SqlNotificationOutbox {
    async fn notify(
        &self,
        user_id: &UserId,
        event_type: NotificationEventType,
        payload: &NotificationPayload,
    ) -> Result<(), NotificationError> {
        self.enqueue(user_id, event_type, payload)
            .await
            .map(|_| ())
            .map_err(|error| NotificationError::Unavailable(error.to_string()))
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<OutboxEntry, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let user_id: String = row.try_get("user_id").map_err(decode_error)?;
    let event_type: String = row.try_get("event_type").map_err(decode_error)?;
    let payload_json: String = row.try_get("payload_json").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let attempts: i64 = row.try_get("attempts").map_err(decode_error)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let delivered_at: Option<String> = row.try_get("delivered_at").map_err(decode_error)?;

    Ok(OutboxEntry {
        id,
        user_id: UserId(user_id),
        event_type: NotificationEventType::parse(&event_type).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown notification event `{event_type}`"))
        })?,
        payload: serde_json::from_str(&payload_json).map_err(decode_error)?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown outbox status `{status}`")))?,
        attempts: u32::try_from(attempts).map_err(decode_error)?,
        last_error,
        created_at: parse_timestamp("created_at", &created_at)?,
        delivered_at: delivered_at
            .map(|raw| parse_timestamp("delivered_at", &raw))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use leaveflow_core::domain::leave_request::{LeaveRequestId, LeaveRequestStatus};
    use leaveflow_core::domain::org::UserId;
    use leaveflow_core::notify::{NotificationEventType, NotificationPayload, NotificationSink};

    use super::{OutboxStatus, SqlNotificationOutbox};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlNotificationOutbox {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlNotificationOutbox::new(pool)
    }

    fn payload() -> NotificationPayload {
        NotificationPayload {
            leave_request_id: LeaveRequestId("LR-1".to_string()),
            request_status: LeaveRequestStatus::Pending,
            policy_id: None,
            step_ids: Vec::new(),
            correlation_id: "req-1".to_string(),
        }
    }

    #[tokio::test]
    async fn notify_queues_a_pending_entry() {
        let outbox = setup().await;
        outbox
            .notify(&UserId("u-lead".to_string()), NotificationEventType::ApprovalRequested, &payload())
            .await
            .expect("notify");

        let pending = outbox.pending(10).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].user_id, UserId("u-lead".to_string()));
        assert_eq!(pending[0].event_type, NotificationEventType::ApprovalRequested);
        assert_eq!(pending[0].payload, payload());
        assert_eq!(pending[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn delivered_entries_leave_the_queue() {
        let outbox = setup().await;
        let id = outbox
            .enqueue(&UserId("u-hr".to_string()), NotificationEventType::RequestSubmitted, &payload())
            .await
            .expect("enqueue");

        assert!(outbox.mark_delivered(&id).await.expect("deliver"));
        assert!(outbox.pending(10).await.expect("pending").is_empty());

        let entries = outbox.entries_for_request("LR-1").await.expect("entries");
        assert_eq!(entries[0].status, OutboxStatus::Delivered);
        assert_eq!(entries[0].attempts, 1);
        assert!(entries[0].delivered_at.is_some());
    }

    #[tokio::test]
    async fn failures_retry_until_the_attempt_limit() {
        let outbox = setup().await;
        let id = outbox
            .enqueue(&UserId("u-hr".to_string()), NotificationEventType::RequestSubmitted, &payload())
            .await
            .expect("enqueue");

        assert!(outbox.mark_failed(&id, "smtp timeout", 2).await.expect("first failure"));
        assert_eq!(outbox.pending(10).await.expect("pending").len(), 1);

        assert!(outbox.mark_failed(&id, "smtp timeout", 2).await.expect("second failure"));
        assert!(outbox.pending(10).await.expect("pending").is_empty());

        let entries = outbox.entries_for_request("LR-1").await.expect("entries");
        assert_eq!(entries[0].status, OutboxStatus::Failed);
        assert_eq!(entries[0].last_error.as_deref(), Some("smtp timeout"));
    }
}
