use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::digest::repo::SubscriberPreference;

/// Preference mutations behind the subscriber-facing endpoints. Production
/// uses [`PgSubscriptions`]; tests use an in-memory fake.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Turns off the weekly digest for a user. Returns `false` when no
    /// preference row exists for that id.
    async fn disable_weekly_digest(&self, user_id: Uuid) -> anyhow::Result<bool>;

    /// Creates or replaces a user's digest preferences. `last_digest_sent_at`
    /// is never touched here; only the job advances it.
    async fn upsert_preferences(
        &self,
        user_id: Uuid,
        weekly_digest_enabled: bool,
        skills_wanted: &[String],
        skills_wanted_custom: &[String],
    ) -> anyhow::Result<SubscriberPreference>;
}

pub struct PgSubscriptions {
    db: PgPool,
}

impl PgSubscriptions {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptions {
    async fn disable_weekly_digest(&self, user_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriber_preferences
            SET weekly_digest_enabled = false
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_preferences(
        &self,
        user_id: Uuid,
        weekly_digest_enabled: bool,
        skills_wanted: &[String],
        skills_wanted_custom: &[String],
    ) -> anyhow::Result<SubscriberPreference> {
        let row = sqlx::query_as::<_, SubscriberPreference>(
            r#"
            INSERT INTO subscriber_preferences
                (user_id, weekly_digest_enabled, skills_wanted, skills_wanted_custom)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET weekly_digest_enabled = EXCLUDED.weekly_digest_enabled,
                skills_wanted = EXCLUDED.skills_wanted,
                skills_wanted_custom = EXCLUDED.skills_wanted_custom
            RETURNING user_id, skills_wanted, skills_wanted_custom,
                      weekly_digest_enabled, last_digest_sent_at
            "#,
        )
        .bind(user_id)
        .bind(weekly_digest_enabled)
        .bind(skills_wanted)
        .bind(skills_wanted_custom)
        .fetch_one(&self.db)
        .await?;
        Ok(row)
    }
}
