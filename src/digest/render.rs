//! Email rendering: subject line, HTML body, and the unsubscribe token.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

use super::repo::{CommunityPost, Listing};

pub const GENERIC_SUBJECT: &str = "📬 Your Weekly SwapSkills Digest";

#[derive(Debug, Clone)]
pub struct DigestEmail {
    pub subject: String,
    pub html: String,
}

/// Reversible unsubscribe token: base64 of the raw user id. Not a secret,
/// just an opaque link parameter.
pub fn unsubscribe_token(user_id: Uuid) -> String {
    BASE64.encode(user_id.to_string())
}

/// Decodes a token back to a user id, rejecting anything that is not a
/// well-formed UUID underneath.
pub fn decode_unsubscribe_token(token: &str) -> Option<Uuid> {
    let raw = BASE64.decode(token.trim()).ok()?;
    let s = String::from_utf8(raw).ok()?;
    Uuid::parse_str(s.trim()).ok()
}

pub fn subject_for(personal_match: bool, match_count: usize) -> String {
    if personal_match {
        format!("{match_count} new skill offers match your interests")
    } else {
        GENERIC_SUBJECT.to_string()
    }
}

pub fn render_digest(
    recipient_name: Option<&str>,
    listings: &[&Listing],
    personal_match: bool,
    posts: &[&CommunityPost],
    base_url: &str,
    unsubscribe_user: Option<Uuid>,
) -> DigestEmail {
    let subject = subject_for(personal_match, listings.len());

    let mut html = String::new();
    html.push_str("<div style=\"font-family:sans-serif;max-width:600px;margin:0 auto\">");
    html.push_str("<h1>SwapSkills Weekly Digest</h1>");
    match recipient_name {
        Some(name) if !name.trim().is_empty() => {
            html.push_str(&format!("<p>Hi {},</p>", escape(name)));
        }
        _ => html.push_str("<p>Hi there,</p>"),
    }

    if !listings.is_empty() {
        if personal_match {
            html.push_str("<h2>Picked for you</h2>");
        } else {
            html.push_str("<h2>Fresh on SwapSkills</h2>");
        }
        html.push_str("<ul>");
        for l in listings {
            let kind = if l.listing_type == "request" {
                "Looking for"
            } else {
                "Offering"
            };
            html.push_str("<li><strong>");
            html.push_str(&escape(&l.title));
            html.push_str("</strong> — ");
            html.push_str(kind);
            html.push_str(" · ");
            html.push_str(&escape(&l.category));
            if let Some(location) = &l.location {
                html.push_str(" · ");
                html.push_str(&escape(location));
            }
            html.push_str("</li>");
        }
        html.push_str("</ul>");
    }

    if !posts.is_empty() {
        html.push_str("<h2>From the community board</h2><ul>");
        for p in posts {
            html.push_str("<li><strong>");
            html.push_str(&escape(&p.title));
            html.push_str("</strong> · ");
            html.push_str(&escape(&p.category));
            if let Some(county) = &p.county {
                html.push_str(" · ");
                html.push_str(&escape(county));
            }
            html.push_str("</li>");
        }
        html.push_str("</ul>");
    }

    html.push_str(&format!(
        "<p><a href=\"{base_url}/browse\">Browse everything on SwapSkills</a></p>"
    ));
    if let Some(user_id) = unsubscribe_user {
        let token = unsubscribe_token(user_id);
        html.push_str(&format!(
            "<p style=\"font-size:12px;color:#888\">\
             <a href=\"{base_url}/unsubscribe?token={token}\">Unsubscribe from the weekly digest</a></p>"
        ));
    }
    html.push_str("</div>");

    DigestEmail { subject, html }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
