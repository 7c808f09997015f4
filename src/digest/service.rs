//! The digest delivery pipeline: content selection, subscriber selection,
//! per-subscriber claim/compose/send, and transport pacing.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::config::DigestConfig;
use crate::mailer::{EmailTransport, OutboundEmail};

use super::matcher;
use super::render;
use super::repo::DigestStore;

#[derive(Debug, Error)]
pub enum DigestJobError {
    #[error("failed to load digest content: {0}")]
    Content(anyhow::Error),
    #[error("failed to load subscribers: {0}")]
    Subscribers(anyhow::Error),
    #[error("test send to {to} failed: {cause}")]
    TestSend { to: String, cause: anyhow::Error },
}

/// How a run ended. Early exits are successes with zero sends, not errors.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { sent: u32 },
    NoNewContent,
    NoEligibleSubscribers,
}

#[derive(Debug, Default)]
pub struct RunOptions {
    /// Compose and count sends without contacting the transport.
    pub dry_run: bool,
    /// Single test-address mode: one email, no subscriber reads, no writes.
    pub test_email: Option<String>,
    /// If set, only these addresses may receive a send.
    pub only_emails: Option<Vec<String>>,
    /// Addresses never sent to, case-insensitive.
    pub exclude_emails: Option<Vec<String>>,
}

pub async fn run_digest(
    store: &dyn DigestStore,
    mailer: &dyn EmailTransport,
    cfg: &DigestConfig,
    base_url: &str,
    now: OffsetDateTime,
    opts: &RunOptions,
) -> Result<RunOutcome, DigestJobError> {
    let since = now - time::Duration::days(cfg.window_days);
    let listings = store
        .recent_listings(since, cfg.listing_limit)
        .await
        .map_err(DigestJobError::Content)?;
    let posts = store
        .recent_community_posts(since, cfg.community_post_limit)
        .await
        .map_err(DigestJobError::Content)?;

    if listings.is_empty() && posts.is_empty() {
        info!("no new content in window, nothing to send");
        return Ok(RunOutcome::NoNewContent);
    }

    let post_refs: Vec<_> = posts.iter().take(cfg.items_per_section).collect();

    // Test-address mode: render from the top of the candidate set and send a
    // single email, without touching subscriber state.
    if let Some(to) = &opts.test_email {
        let top: Vec<_> = listings.iter().take(cfg.items_per_section).collect();
        let email = render::render_digest(None, &top, false, &post_refs, base_url, None);
        if opts.dry_run {
            info!(%to, subject = %email.subject, "dry run: would send test digest");
        } else {
            let id = mailer
                .send(&OutboundEmail {
                    to: to.clone(),
                    subject: email.subject,
                    html: email.html,
                })
                .await
                .map_err(|cause| DigestJobError::TestSend {
                    to: to.clone(),
                    cause,
                })?;
            info!(%to, message_id = %id, "sent test digest");
        }
        return Ok(RunOutcome::Completed { sent: 1 });
    }

    let cutoff = now - time::Duration::hours(cfg.cooldown_hours);
    let subscribers = store
        .eligible_subscribers(cutoff)
        .await
        .map_err(DigestJobError::Subscribers)?;
    if subscribers.is_empty() {
        info!("no eligible subscribers");
        return Ok(RunOutcome::NoEligibleSubscribers);
    }

    let only: Option<HashSet<String>> = opts
        .only_emails
        .as_ref()
        .map(|v| v.iter().map(|e| e.to_lowercase()).collect());
    let exclude: Option<HashSet<String>> = opts
        .exclude_emails
        .as_ref()
        .map(|v| v.iter().map(|e| e.to_lowercase()).collect());

    info!(
        subscribers = subscribers.len(),
        listings = listings.len(),
        posts = posts.len(),
        dry_run = opts.dry_run,
        "starting digest run"
    );

    let mut sent: u32 = 0;
    for sub in &subscribers {
        // Claim before anything else: advancing the cooldown first means a
        // crash or transport failure costs a missed email, never a duplicate.
        match store.claim_subscriber(sub.user_id, now, cutoff).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(user_id = %sub.user_id, "claim lost, skipping");
                continue;
            }
            Err(e) => {
                warn!(user_id = %sub.user_id, error = %e, "claim failed, skipping");
                continue;
            }
        }

        // Claim is consumed from here on, even when we end up not sending.
        let profile = match store.find_profile(sub.user_id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(user_id = %sub.user_id, "no profile for subscriber, skipping");
                continue;
            }
            Err(e) => {
                error!(user_id = %sub.user_id, error = %e, "profile lookup failed, skipping");
                continue;
            }
        };
        let Some(address) = profile.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            warn!(user_id = %sub.user_id, "subscriber has no email address, skipping");
            continue;
        };
        let address_lower = address.to_lowercase();

        if let Some(only) = &only {
            if !only.contains(&address_lower) {
                debug!(user_id = %sub.user_id, "address not on allow-list, skipping");
                continue;
            }
        }
        if let Some(exclude) = &exclude {
            if exclude.contains(&address_lower) {
                debug!(user_id = %sub.user_id, "address on deny-list, skipping");
                continue;
            }
        }

        let tags = matcher::interest_tags(sub);
        let selection = matcher::select_listings(&listings, &tags, cfg.items_per_section);
        let email = render::render_digest(
            profile.full_name.as_deref(),
            &selection.listings,
            selection.personal_match,
            &post_refs,
            base_url,
            Some(sub.user_id),
        );

        if opts.dry_run {
            info!(
                user_id = %sub.user_id,
                to = %address,
                subject = %email.subject,
                "dry run: would send digest"
            );
            sent += 1;
        } else {
            match mailer
                .send(&OutboundEmail {
                    to: address.to_string(),
                    subject: email.subject,
                    html: email.html,
                })
                .await
            {
                Ok(id) => {
                    debug!(user_id = %sub.user_id, message_id = %id, "digest sent");
                    sent += 1;
                }
                Err(e) => {
                    // No claim rollback: the subscriber misses this cycle rather
                    // than risking a duplicate on retry.
                    error!(user_id = %sub.user_id, error = %e, "send failed, continuing");
                    continue;
                }
            }
        }

        // Pace sends under the provider's rate ceiling. Dry runs keep the
        // same cadence so their timing mirrors a real run.
        tokio::time::sleep(Duration::from_millis(cfg.send_delay_ms)).await;
    }

    info!(sent, "digest run complete");
    Ok(RunOutcome::Completed { sent })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::repo::{CommunityPost, DigestStore, Listing, Profile, SubscriberPreference};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn test_cfg() -> DigestConfig {
        DigestConfig {
            window_days: 7,
            listing_limit: 50,
            community_post_limit: 20,
            cooldown_hours: 24,
            items_per_section: 5,
            send_delay_ms: 1000,
            cron_secret: None,
        }
    }

    fn listing(title: &str, category: &str, age_days: i64, now: OffsetDateTime) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            category: category.into(),
            location: None,
            listing_type: "offer".into(),
            created_at: now - time::Duration::days(age_days),
        }
    }

    fn post(title: &str, now: OffsetDateTime) -> CommunityPost {
        CommunityPost {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            category: "general".into(),
            county: None,
            created_at: now,
        }
    }

    struct FakeStore {
        listings: Vec<Listing>,
        posts: Vec<CommunityPost>,
        subs: Mutex<Vec<SubscriberPreference>>,
        profiles: HashMap<Uuid, Profile>,
        fail_claims: bool,
        claims: Mutex<Vec<Uuid>>,
    }

    impl FakeStore {
        fn new(listings: Vec<Listing>, posts: Vec<CommunityPost>) -> Self {
            Self {
                listings,
                posts,
                subs: Mutex::new(Vec::new()),
                profiles: HashMap::new(),
                fail_claims: false,
                claims: Mutex::new(Vec::new()),
            }
        }

        fn with_subscriber(
            mut self,
            wanted: &[&str],
            last_sent: Option<OffsetDateTime>,
            email: Option<&str>,
        ) -> Self {
            let user_id = Uuid::new_v4();
            self.subs.get_mut().unwrap().push(SubscriberPreference {
                user_id,
                skills_wanted: wanted.iter().map(|s| s.to_string()).collect(),
                skills_wanted_custom: Vec::new(),
                weekly_digest_enabled: true,
                last_digest_sent_at: last_sent,
            });
            self.profiles.insert(
                user_id,
                Profile {
                    id: user_id,
                    email: email.map(|e| e.to_string()),
                    full_name: Some("Test User".into()),
                },
            );
            self
        }

        fn claim_count(&self) -> usize {
            self.claims.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DigestStore for FakeStore {
        async fn recent_listings(
            &self,
            since: OffsetDateTime,
            limit: i64,
        ) -> anyhow::Result<Vec<Listing>> {
            Ok(self
                .listings
                .iter()
                .filter(|l| l.created_at >= since)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn recent_community_posts(
            &self,
            since: OffsetDateTime,
            limit: i64,
        ) -> anyhow::Result<Vec<CommunityPost>> {
            Ok(self
                .posts
                .iter()
                .filter(|p| p.created_at >= since)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn eligible_subscribers(
            &self,
            cutoff: OffsetDateTime,
        ) -> anyhow::Result<Vec<SubscriberPreference>> {
            Ok(self
                .subs
                .lock()
                .unwrap()
                .iter()
                .filter(|s| {
                    s.weekly_digest_enabled
                        && s.last_digest_sent_at.map_or(true, |t| t < cutoff)
                })
                .cloned()
                .collect())
        }

        async fn claim_subscriber(
            &self,
            user_id: Uuid,
            now: OffsetDateTime,
            cutoff: OffsetDateTime,
        ) -> anyhow::Result<bool> {
            if self.fail_claims {
                anyhow::bail!("claim write failed");
            }
            let mut subs = self.subs.lock().unwrap();
            let Some(sub) = subs.iter_mut().find(|s| s.user_id == user_id) else {
                return Ok(false);
            };
            let claimable = sub.weekly_digest_enabled
                && sub.last_digest_sent_at.map_or(true, |t| t < cutoff);
            if !claimable {
                return Ok(false);
            }
            sub.last_digest_sent_at = Some(now);
            self.claims.lock().unwrap().push(user_id);
            Ok(true)
        }

        async fn find_profile(&self, user_id: Uuid) -> anyhow::Result<Option<Profile>> {
            Ok(self.profiles.get(&user_id).cloned())
        }
    }

    struct FakeMailer {
        sent: Mutex<Vec<OutboundEmail>>,
        fail: bool,
    }

    impl FakeMailer {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn sent(&self) -> Vec<OutboundEmail> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EmailTransport for FakeMailer {
        async fn send(&self, email: &OutboundEmail) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("transport unavailable");
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(format!("msg-{}", self.sent.lock().unwrap().len()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_a_matched_subscriber_gets_matching_listing() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(
            vec![
                listing("Hedge trimming", "gardening", 2, now),
                listing("Piano lessons", "music", 2, now),
                listing("Tax help", "finance", 2, now),
            ],
            vec![],
        )
        .with_subscriber(&["gardening"], None, Some("a@x.com"));
        let mailer = FakeMailer::new();

        let outcome = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 1 });
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@x.com");
        assert_eq!(sent[0].subject, "1 new skill offers match your interests");
        assert!(sent[0].html.contains("Hedge trimming"));
        assert!(!sent[0].html.contains("Piano lessons"));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_no_match_falls_back_to_all_listings() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(
            vec![
                listing("Hedge trimming", "gardening", 2, now),
                listing("Piano lessons", "music", 2, now),
                listing("Tax help", "finance", 2, now),
            ],
            vec![],
        )
        .with_subscriber(&["welding"], None, Some("a@x.com"));
        let mailer = FakeMailer::new();

        run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, render::GENERIC_SUBJECT);
        assert!(sent[0].html.contains("Hedge trimming"));
        assert!(sent[0].html.contains("Piano lessons"));
        assert!(sent[0].html.contains("Tax help"));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_c_cooldown_excludes_recent_recipient() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(
                &[],
                Some(now - time::Duration::hours(10)),
                Some("a@x.com"),
            );
        let mailer = FakeMailer::new();

        let outcome = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::NoEligibleSubscribers);
        assert!(mailer.sent().is_empty());
        assert_eq!(store.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_within_cooldown_sends_nothing() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(&[], None, Some("a@x.com"));
        let mailer = FakeMailer::new();
        let cfg = test_cfg();

        let first = run_digest(&store, &mailer, &cfg, "http://x", now, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(first, RunOutcome::Completed { sent: 1 });

        let later = now + time::Duration::hours(2);
        let second = run_digest(&store, &mailer, &cfg, "http://x", later, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(second, RunOutcome::NoEligibleSubscribers);
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_content_short_circuits_before_any_claim() {
        let now = OffsetDateTime::now_utc();
        let store =
            FakeStore::new(vec![], vec![]).with_subscriber(&[], None, Some("a@x.com"));
        let mailer = FakeMailer::new();

        let outcome = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::NoNewContent);
        assert!(mailer.sent().is_empty());
        assert_eq!(store.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_content_outside_window_does_not_count() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("old", "misc", 30, now)], vec![])
            .with_subscriber(&[], None, Some("a@x.com"));
        let mailer = FakeMailer::new();

        let outcome = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::NoNewContent);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_list_limits_recipients() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(&[], None, Some("a@x.com"))
            .with_subscriber(&[], None, Some("b@x.com"));
        let mailer = FakeMailer::new();

        let opts = RunOptions {
            only_emails: Some(vec!["A@X.com".into()]),
            ..Default::default()
        };
        let outcome = run_digest(&store, &mailer, &test_cfg(), "http://x", now, &opts)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 1 });
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@x.com");
    }

    #[tokio::test(start_paused = true)]
    async fn deny_list_skips_matching_address() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(&[], None, Some("a@x.com"))
            .with_subscriber(&[], None, Some("b@x.com"));
        let mailer = FakeMailer::new();

        let opts = RunOptions {
            exclude_emails: Some(vec!["B@x.com".into()]),
            ..Default::default()
        };
        let outcome = run_digest(&store, &mailer, &test_cfg(), "http://x", now, &opts)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 1 });
        assert_eq!(mailer.sent()[0].to, "a@x.com");
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_counts_but_never_reaches_transport() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(&[], None, Some("a@x.com"))
            .with_subscriber(&[], None, Some("b@x.com"));
        let mailer = FakeMailer::failing();

        let opts = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let outcome = run_digest(&store, &mailer, &test_cfg(), "http://x", now, &opts)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 2 });
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_keeps_the_send_cadence() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(&[], None, Some("a@x.com"))
            .with_subscriber(&[], None, Some("b@x.com"));
        let mailer = FakeMailer::new();

        let opts = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let started = tokio::time::Instant::now();
        let outcome = run_digest(&store, &mailer, &test_cfg(), "http://x", now, &opts)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 2 });
        // One pacing delay per counted send, same as a real run.
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_keeps_claim_and_continues() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(&[], None, Some("a@x.com"))
            .with_subscriber(&[], None, Some("b@x.com"));
        let mailer = FakeMailer::failing();

        let outcome = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        // Both failed, both claims consumed: missed send beats duplicate send.
        assert_eq!(outcome, RunOutcome::Completed { sent: 0 });
        assert_eq!(store.claim_count(), 2);
        let later = now + time::Duration::hours(2);
        let retry = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            later,
            &RunOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(retry, RunOutcome::NoEligibleSubscribers);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_failure_skips_without_sending() {
        let now = OffsetDateTime::now_utc();
        let mut store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(&[], None, Some("a@x.com"));
        store.fail_claims = true;
        let mailer = FakeMailer::new();

        let outcome = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 0 });
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_address_consumes_claim_without_send() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![])
            .with_subscriber(&[], None, None);
        let mailer = FakeMailer::new();

        let outcome = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 0 });
        assert!(mailer.sent().is_empty());
        assert_eq!(store.claim_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_email_mode_bypasses_subscribers_and_state() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![listing("x", "misc", 1, now)], vec![post("hello", now)])
            .with_subscriber(&[], None, Some("a@x.com"));
        let mailer = FakeMailer::new();

        let opts = RunOptions {
            test_email: Some("ops@x.com".into()),
            ..Default::default()
        };
        let outcome = run_digest(&store, &mailer, &test_cfg(), "http://x", now, &opts)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 1 });
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ops@x.com");
        // No subscriber claimed, the real subscriber untouched.
        assert_eq!(store.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn community_posts_alone_are_enough_content() {
        let now = OffsetDateTime::now_utc();
        let store = FakeStore::new(vec![], vec![post("Village fair", now)])
            .with_subscriber(&[], None, Some("a@x.com"));
        let mailer = FakeMailer::new();

        let outcome = run_digest(
            &store,
            &mailer,
            &test_cfg(),
            "http://x",
            now,
            &RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { sent: 1 });
        assert!(mailer.sent()[0].html.contains("Village fair"));
    }
}
