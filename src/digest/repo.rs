use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

/// A skill exchange listing (offer or request) from the marketplace.
#[derive(Debug, Clone, FromRow)]
pub struct Listing {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub category: String,
    pub location: Option<String>,
    /// "offer" or "request".
    pub listing_type: String,
    pub created_at: OffsetDateTime,
}

/// A community board post (not a skill exchange).
#[derive(Debug, Clone, FromRow)]
pub struct CommunityPost {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub category: String,
    pub county: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub struct SubscriberPreference {
    pub user_id: Uuid,
    pub skills_wanted: Vec<String>,
    pub skills_wanted_custom: Vec<String>,
    pub weekly_digest_enabled: bool,
    pub last_digest_sent_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

/// Data access used by the digest job. Production uses [`PgStore`]; tests use
/// an in-memory fake.
#[async_trait]
pub trait DigestStore: Send + Sync {
    /// Active, approved listings created since `since`, newest first.
    async fn recent_listings(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> anyhow::Result<Vec<Listing>>;

    /// Active, approved, visible community posts created since `since`, newest first.
    async fn recent_community_posts(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> anyhow::Result<Vec<CommunityPost>>;

    /// Subscribers opted into the digest whose last send predates `cutoff`.
    async fn eligible_subscribers(
        &self,
        cutoff: OffsetDateTime,
    ) -> anyhow::Result<Vec<SubscriberPreference>>;

    /// Conditionally advances `last_digest_sent_at` to `now`. Returns `false`
    /// when the row was no longer claimable (lost a race, opted out, or the
    /// cooldown moved forward since the eligibility read).
    async fn claim_subscriber(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
        cutoff: OffsetDateTime,
    ) -> anyhow::Result<bool>;

    async fn find_profile(&self, user_id: Uuid) -> anyhow::Result<Option<Profile>>;
}

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DigestStore for PgStore {
    async fn recent_listings(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> anyhow::Result<Vec<Listing>> {
        let rows = sqlx::query_as::<_, Listing>(
            r#"
            SELECT id, title, description, category, location, listing_type, created_at
            FROM listings
            WHERE created_at >= $1
              AND status = 'active'
              AND moderation_status = 'approved'
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn recent_community_posts(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> anyhow::Result<Vec<CommunityPost>> {
        let rows = sqlx::query_as::<_, CommunityPost>(
            r#"
            SELECT id, title, description, category, county, created_at
            FROM community_posts
            WHERE created_at >= $1
              AND status = 'active'
              AND moderation_status = 'approved'
              AND is_visible
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn eligible_subscribers(
        &self,
        cutoff: OffsetDateTime,
    ) -> anyhow::Result<Vec<SubscriberPreference>> {
        let rows = sqlx::query_as::<_, SubscriberPreference>(
            r#"
            SELECT user_id, skills_wanted, skills_wanted_custom,
                   weekly_digest_enabled, last_digest_sent_at
            FROM subscriber_preferences
            WHERE weekly_digest_enabled
              AND (last_digest_sent_at IS NULL OR last_digest_sent_at < $1)
            ORDER BY user_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn claim_subscriber(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
        cutoff: OffsetDateTime,
    ) -> anyhow::Result<bool> {
        // Single conditional update: the predicate re-checks eligibility so
        // two overlapping runs cannot both claim the same subscriber, and the
        // timestamp can only move forward.
        let result = sqlx::query(
            r#"
            UPDATE subscriber_preferences
            SET last_digest_sent_at = $2
            WHERE user_id = $1
              AND weekly_digest_enabled
              AND (last_digest_sent_at IS NULL OR last_digest_sent_at < $3)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(cutoff)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_profile(&self, user_id: Uuid) -> anyhow::Result<Option<Profile>> {
        let profile = sqlx::query_as::<_, Profile>(
            r#"
            SELECT id, email, full_name
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(profile)
    }
}
