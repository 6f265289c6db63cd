//! Scheduled message repository
//!
//! Every status change is conditioned on the expected current status, so
//! concurrent workers cannot move the same message twice.

use crate::db::{db_err, DatabasePool};
use crate::models::{
    CreateScheduledMessage, PairHistory, QueueStats, ScheduledMessage, ScheduledMessageStatus,
    SendReceipt, StaleRelease,
};
use crate::models::ScheduledMessageStatus::{Delivered, Failed, Planned, Processing, Sent, Skipped};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comanda_common::types::{CustomerId, RuleId, ScheduledMessageId, TenantId};
use comanda_common::Result;
use sqlx::types::Json;
use uuid::Uuid;

/// Scheduled message repository trait
#[async_trait]
pub trait ScheduledMessageRepository: Send + Sync {
    /// Insert a new message in `planned`.
    /// None when the pair already has a planned or processing message.
    async fn create(&self, input: CreateScheduledMessage) -> Result<Option<ScheduledMessage>>;

    async fn get(&self, id: ScheduledMessageId) -> Result<Option<ScheduledMessage>>;

    /// Planned messages due at `now`, oldest first
    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledMessage>>;

    /// planned -> processing; false when another worker got there first
    async fn claim(&self, id: ScheduledMessageId, now: DateTime<Utc>) -> Result<bool>;

    /// processing -> sent
    async fn mark_sent(&self, id: ScheduledMessageId, receipt: &SendReceipt) -> Result<bool>;

    /// processing -> skipped
    async fn mark_skipped(
        &self,
        id: ScheduledMessageId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// processing -> planned with a new attempt time
    async fn reschedule(
        &self,
        id: ScheduledMessageId,
        retry_count: i32,
        scheduled_for: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// processing -> failed
    async fn mark_failed(
        &self,
        id: ScheduledMessageId,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// sent -> delivered, looked up by provider message id
    async fn confirm_delivery(
        &self,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledMessage>>;

    /// Send history for a (customer, rule) pair
    async fn pair_history(
        &self,
        customer_id: CustomerId,
        rule_id: RuleId,
        exclude: Option<ScheduledMessageId>,
    ) -> Result<PairHistory>;

    /// Messages in planned/processing/sent/delivered created in `[from, to)`
    async fn count_active_created_between(
        &self,
        tenant_id: TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        exclude: Option<ScheduledMessageId>,
    ) -> Result<i64>;

    /// Return claims older than `claimed_before` to the queue, failing the
    /// ones with no retries left
    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<StaleRelease>;

    async fn queue_stats(&self) -> Result<QueueStats>;
}

/// Error recorded on claims that were abandoned mid-delivery
pub const STALE_CLAIM_ERROR: &str = "delivery claim expired";

/// Database scheduled message repository
pub struct DbScheduledMessageRepository {
    pool: DatabasePool,
}

impl DbScheduledMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduledMessageRepository for DbScheduledMessageRepository {
    async fn create(&self, input: CreateScheduledMessage) -> Result<Option<ScheduledMessage>> {
        sqlx::query_as::<_, ScheduledMessage>(
            r#"
            INSERT INTO scheduled_messages (
                id, tenant_id, customer_id, rule_id, template_id, scheduled_for,
                channel_planned, subject, body, variables, previous_segment, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'planned', $12, $12)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.tenant_id)
        .bind(input.customer_id)
        .bind(input.rule_id)
        .bind(input.template_id)
        .bind(input.scheduled_for)
        .bind(input.channel_planned)
        .bind(&input.subject)
        .bind(&input.body)
        .bind(Json(&input.variables))
        .bind(input.previous_segment)
        .bind(input.created_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: ScheduledMessageId) -> Result<Option<ScheduledMessage>> {
        sqlx::query_as::<_, ScheduledMessage>("SELECT * FROM scheduled_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledMessage>> {
        sqlx::query_as::<_, ScheduledMessage>(
            r#"
            SELECT * FROM scheduled_messages
            WHERE status = 'planned' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn claim(&self, id: ScheduledMessageId, now: DateTime<Utc>) -> Result<bool> {
        let (from, to) = transition(Planned, Processing)?;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_messages SET
                status = $3,
                last_attempted_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(to)
        .bind(from)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_sent(&self, id: ScheduledMessageId, receipt: &SendReceipt) -> Result<bool> {
        let (from, to) = transition(Processing, Sent)?;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_messages SET
                status = $6,
                channel_final = $2,
                provider_message_id = $3,
                provider_response = $4,
                sent_at = $5,
                last_error = NULL,
                updated_at = $5
            WHERE id = $1 AND status = $7
            "#,
        )
        .bind(id)
        .bind(receipt.channel)
        .bind(&receipt.provider_message_id)
        .bind(&receipt.provider_response)
        .bind(receipt.sent_at)
        .bind(to)
        .bind(from)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_skipped(
        &self,
        id: ScheduledMessageId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (from, to) = transition(Processing, Skipped)?;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_messages SET
                status = $4,
                last_error = $2,
                updated_at = $3
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .bind(to)
        .bind(from)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reschedule(
        &self,
        id: ScheduledMessageId,
        retry_count: i32,
        scheduled_for: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (from, to) = transition(Processing, Planned)?;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_messages SET
                status = $6,
                retry_count = $2,
                scheduled_for = $3,
                last_error = $4,
                updated_at = $5
            WHERE id = $1 AND status = $7
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(scheduled_for)
        .bind(error)
        .bind(now)
        .bind(to)
        .bind(from)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        id: ScheduledMessageId,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (from, to) = transition(Processing, Failed)?;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_messages SET
                status = $5,
                retry_count = $2,
                last_error = $3,
                failed_at = $4,
                updated_at = $4
            WHERE id = $1 AND status = $6
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .bind(now)
        .bind(to)
        .bind(from)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn confirm_delivery(
        &self,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledMessage>> {
        let (from, to) = transition(Sent, Delivered)?;
        sqlx::query_as::<_, ScheduledMessage>(
            r#"
            UPDATE scheduled_messages SET
                status = $3,
                delivered_at = $2,
                updated_at = $2
            WHERE provider_message_id = $1 AND status = $4
            RETURNING *
            "#,
        )
        .bind(provider_message_id)
        .bind(now)
        .bind(to)
        .bind(from)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn pair_history(
        &self,
        customer_id: CustomerId,
        rule_id: RuleId,
        exclude: Option<ScheduledMessageId>,
    ) -> Result<PairHistory> {
        sqlx::query_as::<_, PairHistory>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status IN ('sent', 'delivered')) AS sent_count,
                MAX(sent_at) FILTER (WHERE status IN ('sent', 'delivered')) AS last_sent_at,
                COUNT(*) FILTER (
                    WHERE status IN ('planned', 'processing')
                      AND ($3::UUID IS NULL OR id <> $3)
                ) AS pending_count
            FROM scheduled_messages
            WHERE customer_id = $1 AND rule_id = $2
            "#,
        )
        .bind(customer_id)
        .bind(rule_id)
        .bind(exclude)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn count_active_created_between(
        &self,
        tenant_id: TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        exclude: Option<ScheduledMessageId>,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM scheduled_messages
            WHERE tenant_id = $1
              AND created_at >= $2 AND created_at < $3
              AND status IN ('planned', 'processing', 'sent', 'delivered')
              AND ($4::UUID IS NULL OR id <> $4)
            "#,
        )
        .bind(tenant_id)
        .bind(from)
        .bind(to)
        .bind(exclude)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<StaleRelease> {
        let (from, failed_to) = transition(Processing, Failed)?;
        let (_, requeued_to) = transition(Processing, Planned)?;

        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let failed = sqlx::query_as::<_, ScheduledMessage>(
            r#"
            UPDATE scheduled_messages SET
                status = $5,
                last_error = $3,
                failed_at = $4,
                updated_at = $4
            WHERE status = $6
              AND last_attempted_at < $1
              AND retry_count + 1 > $2
            RETURNING *
            "#,
        )
        .bind(claimed_before)
        .bind(max_retries)
        .bind(STALE_CLAIM_ERROR)
        .bind(now)
        .bind(failed_to)
        .bind(from)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let requeued = sqlx::query(
            r#"
            UPDATE scheduled_messages SET
                status = $4,
                retry_count = retry_count + 1,
                last_error = $2,
                updated_at = $3
            WHERE status = $5
              AND last_attempted_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(STALE_CLAIM_ERROR)
        .bind(now)
        .bind(requeued_to)
        .bind(from)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        tx.commit().await.map_err(db_err)?;

        Ok(StaleRelease { requeued, failed })
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query_as::<_, (ScheduledMessageStatus, i64)>(
            "SELECT status, COUNT(*) FROM scheduled_messages GROUP BY status",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status, count);
        }
        Ok(stats)
    }
}

/// Checked status pair for a conditional update
fn transition(
    from: ScheduledMessageStatus,
    to: ScheduledMessageStatus,
) -> Result<(ScheduledMessageStatus, ScheduledMessageStatus)> {
    from.ensure_transition(to)?;
    Ok((from, to))
}
