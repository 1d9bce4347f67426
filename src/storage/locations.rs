//! Canonical record locations for conversation event logs.
//!
//! One record per event, one record per archived page:
//!
//! ```text
//! users/{user_id}/sessions/{sid}/events/{id}.json
//! users/{user_id}/sessions/{sid}/event_pages/{first}-{end}.json
//! ```
//!
//! When no user id is known the `users/{user_id}/` prefix is omitted.

/// Root directory for a conversation's records.
pub fn session_dir(sid: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user_id) => format!("users/{}/sessions/{}", user_id, sid),
        None => format!("sessions/{}", sid),
    }
}

/// Directory holding the per-event records of a conversation.
pub fn events_dir(sid: &str, user_id: Option<&str>) -> String {
    format!("{}/events", session_dir(sid, user_id))
}

/// Path of the record for one event.
pub fn event_path(sid: &str, user_id: Option<&str>, event_id: i64) -> String {
    format!("{}/{}.json", events_dir(sid, user_id), event_id)
}

/// Directory holding a conversation's archived pages.
pub fn pages_dir(sid: &str, user_id: Option<&str>) -> String {
    format!("{}/event_pages", session_dir(sid, user_id))
}

/// Path of the page record covering ids `[first, end)`.
pub fn page_path(sid: &str, user_id: Option<&str>, first: i64, end: i64) -> String {
    format!("{}/{}-{}.json", pages_dir(sid, user_id), first, end)
}
