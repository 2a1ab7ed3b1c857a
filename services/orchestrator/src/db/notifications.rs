use async_trait::async_trait;
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use vmfleet_id::{NotificationId, TaskId};

use super::DbError;
use crate::notifications::{Notification, NotificationStore, Severity};

struct NotificationRow(Notification);

fn decode<E: std::error::Error + Send + Sync + 'static>(err: E) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

impl<'r> sqlx::FromRow<'r, PgRow> for NotificationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let severity: String = row.try_get("severity")?;
        let task_id: Option<String> = row.try_get("task_id")?;

        Ok(Self(Notification {
            id: NotificationId::parse(&id).map_err(decode)?,
            severity: severity
                .parse::<Severity>()
                .map_err(decode)?,
            title: row.try_get("title")?,
            message: row.try_get("message")?,
            task_id: task_id
                .as_deref()
                .map(TaskId::parse)
                .transpose()
                .map_err(decode)?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn push(&self, notification: Notification) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, severity, title, message, task_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(notification.id.to_string())
        .bind(notification.severity.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.task_id.map(|id| id.to_string()))
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Notification>, DbError> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT id, severity, title, message, task_id, created_at
            FROM notifications
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(rows.into_iter().map(|row| row.0).collect())
    }
}
