//! Interest matching: pairs a subscriber's wanted skills against the candidate
//! listing set. Pure functions, no I/O.

use super::repo::{Listing, SubscriberPreference};

/// Listings chosen for one subscriber's email.
#[derive(Debug)]
pub struct Selection<'a> {
    pub listings: Vec<&'a Listing>,
    /// True when the listings were matched against the subscriber's
    /// interests, false when they are the unfiltered fallback set.
    pub personal_match: bool,
}

/// Combined interest tags, lowercased, blanks dropped.
pub fn interest_tags(prefs: &SubscriberPreference) -> Vec<String> {
    prefs
        .skills_wanted
        .iter()
        .chain(prefs.skills_wanted_custom.iter())
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

// Substring match in both directions so "garden" matches "gardening" and
// "vegetable gardening" matches "gardening".
fn field_matches(field: &str, tag: &str) -> bool {
    let field = field.trim().to_lowercase();
    if field.is_empty() {
        return false;
    }
    field.contains(tag) || tag.contains(&field)
}

pub fn listing_matches(listing: &Listing, tags: &[String]) -> bool {
    tags.iter().any(|tag| {
        field_matches(&listing.category, tag)
            || field_matches(&listing.title, tag)
            || field_matches(&listing.description, tag)
    })
}

/// Picks up to `cap` listings for a subscriber: interest matches when any
/// exist, otherwise the most recent candidates unfiltered, so every email has
/// content whenever any exists globally. `candidates` is assumed newest first.
pub fn select_listings<'a>(
    candidates: &'a [Listing],
    tags: &[String],
    cap: usize,
) -> Selection<'a> {
    let matched: Vec<&Listing> = candidates
        .iter()
        .filter(|l| listing_matches(l, tags))
        .take(cap)
        .collect();
    if matched.is_empty() {
        Selection {
            listings: candidates.iter().take(cap).collect(),
            personal_match: false,
        }
    } else {
        Selection {
            listings: matched,
            personal_match: true,
        }
    }
}
