use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestConfig {
    /// Trailing window (days) for content eligibility.
    pub window_days: i64,
    pub listing_limit: i64,
    pub community_post_limit: i64,
    /// Minimum interval between digests to the same subscriber.
    pub cooldown_hours: i64,
    /// Cap per email section.
    pub items_per_section: usize,
    /// Pause after each outbound send; sized under the mail provider's rate ceiling.
    pub send_delay_ms: u64,
    /// Shared secret expected in the `x-cron-secret` header; unset disables the check.
    pub cron_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// Base URL for links embedded in outbound emails (unsubscribe).
    pub public_base_url: String,
    pub mail: MailConfig,
    pub digest: DigestConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let public_base_url =
            std::env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".into());
        let mail = MailConfig {
            api_url: std::env::var("MAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".into()),
            api_key: std::env::var("MAIL_API_KEY")?,
            from_address: std::env::var("MAIL_FROM_ADDRESS")
                .unwrap_or_else(|_| "SwapSkills <digest@swapskills.app>".into()),
        };
        let digest = DigestConfig {
            window_days: env_i64("DIGEST_WINDOW_DAYS", 7),
            listing_limit: env_i64("DIGEST_LISTING_LIMIT", 50),
            community_post_limit: env_i64("DIGEST_COMMUNITY_POST_LIMIT", 20),
            cooldown_hours: env_i64("DIGEST_COOLDOWN_HOURS", 24),
            items_per_section: env_i64("DIGEST_ITEMS_PER_SECTION", 5) as usize,
            send_delay_ms: env_i64("DIGEST_SEND_DELAY_MS", 1000) as u64,
            cron_secret: std::env::var("CRON_SECRET").ok(),
        };
        Ok(Self {
            database_url,
            public_base_url,
            mail,
            digest,
        })
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}
