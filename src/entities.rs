//! Standard entity namespaces and the edge table that keeps them consistent.
//!
//! | Namespace | Policy | Holds |
//! |-----------|--------|-------|
//! | `events-list` | 24h ttl, stale after 1h | list pages (`upcoming`, `past`, ...) |
//! | `event-detail` | 30m ttl, stale after 25m | one event by id |
//! | `rsvp-status` | 10m ttl, stale after 8m | the user's RSVP for an event id |
//! | `profile` | 1h ttl, stale after 50m | one user profile by id |
//! | `auth-token` | 300s, no stale window | the credential slot |

use crate::cache::FreshnessPolicy;

pub const EVENTS_LIST: &str = "events-list";
pub const EVENT_DETAIL: &str = "event-detail";
pub const RSVP_STATUS: &str = "rsvp-status";
pub const PROFILE: &str = "profile";
pub const AUTH_TOKEN: &str = "auth-token";

/// Policy for a standard namespace, `None` for anything else.
pub fn default_policy(namespace: &str) -> Option<FreshnessPolicy> {
    match namespace {
        EVENTS_LIST => Some(FreshnessPolicy::list()),
        EVENT_DETAIL => Some(FreshnessPolicy::detail()),
        RSVP_STATUS => Some(FreshnessPolicy::relationship()),
        PROFILE => Some(FreshnessPolicy::profile()),
        AUTH_TOKEN => Some(FreshnessPolicy::credential()),
        _ => None,
    }
}

/// `(from, to)` pairs: changing an RSVP changes the event's attendee count
/// and every list that shows it; editing an event changes every list.
pub fn default_edges() -> Vec<(&'static str, &'static str)> {
    vec![
        ("rsvp-status:{id}", "event-detail:{id}"),
        ("rsvp-status:{id}", "events-list:*"),
        ("event-detail:{id}", "events-list:*"),
    ]
}
