//! Render-only grouping of a reconciled conversation.
//!
//! The sync engine keeps one flat, sorted sequence per conversation. Calendar
//! days are a property of the viewer's time zone, so they are computed here
//! at render time and never stored.

use chrono::{NaiveDate, TimeZone};

use crate::sync::Message;

/// Consecutive messages that fall on the same local calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup<'a> {
    /// The local date shared by every message of the group.
    pub day: NaiveDate,
    /// Messages in display order.
    pub messages: Vec<&'a Message>,
}

/// Groups `messages` (already in display order) by calendar day in `tz`.
///
/// Groups appear in the order of their first message, so a sorted input
/// yields one group per day, oldest first.
pub fn group_by_day<'a, Tz: TimeZone>(messages: &'a [Message], tz: &Tz) -> Vec<DayGroup<'a>> {
    let mut groups: Vec<DayGroup<'a>> = Vec::new();
    for message in messages {
        let day = message
            .timestamp
            .as_datetime()
            .with_timezone(tz)
            .date_naive();
        match groups.last_mut() {
            Some(group) if group.day == day => group.messages.push(message),
            _ => groups.push(DayGroup {
                day,
                messages: vec![message],
            }),
        }
    }
    groups
}

/// Header shown above a day group, relative to `today`.
#[must_use]
pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    if day == today {
        return "Today".to_string();
    }
    if today.pred_opt() == Some(day) {
        return "Yesterday".to_string();
    }
    day.format("%a, %d %b %Y").to_string()
}
