//! Aggregation engine: snapshot-replacing derived views.
//!
//! Each change-feed delivery is a full result set for one category. The
//! engine normalizes timestamps, joins events to the roster to backfill
//! display fields, recomputes per-student counts and per-house/per-reason
//! tallies, and keeps a stable descending sort. A snapshot fully replaces
//! the previous view for its category, so redelivering the same batch can
//! never double-count.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::feed::{normalize_timestamp, EventCategory, RawEvent};
use crate::refdata::StudentRecord;

/// Placeholder for display fields that neither the event payload nor the
/// roster can supply.
pub const UNKNOWN: &str = "N/A";

/// Category-specific payload of one behavioral event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetails {
    Infringement { infringement_type: String },
    OutOfClass { reason: String, details: String },
    Affirmation { text: String },
}

impl EventDetails {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Infringement { .. } => EventCategory::Infringement,
            Self::OutOfClass { .. } => EventCategory::OutOfClass,
            Self::Affirmation { .. } => EventCategory::Affirmation,
        }
    }

    /// The label used for per-reason tallies.
    pub fn reason_label(&self) -> &str {
        match self {
            Self::Infringement { infringement_type } => infringement_type,
            Self::OutOfClass { reason, .. } => reason,
            Self::Affirmation { .. } => "affirmation",
        }
    }

    fn search_text(&self) -> String {
        match self {
            Self::Infringement { infringement_type } => infringement_type.clone(),
            Self::OutOfClass { reason, details } => format!("{reason} {details}"),
            Self::Affirmation { text } => text.clone(),
        }
    }
}

/// One normalized behavioral event in a derived view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralEvent {
    /// Store-assigned record id.
    pub id: String,
    pub student_id: String,
    pub name: String,
    pub house: String,
    pub year_level: String,
    pub staff: String,
    pub occurred_at: DateTime<Utc>,
    /// True when the timestamp could not be parsed and "now" was
    /// substituted during normalization.
    pub synthetic_ts: bool,
    pub details: EventDetails,
    /// Per-step notification gate, infringements only. Key is the step
    /// number (1..=6).
    pub notified_steps: BTreeMap<u8, bool>,
}

impl BehavioralEvent {
    /// Whether the gate for a step is already closed on this record.
    pub fn step_notified(&self, step: u8) -> bool {
        self.notified_steps.get(&step).copied().unwrap_or(false)
    }
}

/// Build a typed event from a raw feed document, backfilling display
/// fields from the roster. Events whose student id has no roster match
/// still participate, using the payload's own fields or [`UNKNOWN`].
fn event_from_raw(
    category: EventCategory,
    raw: &RawEvent,
    roster: &HashMap<String, StudentRecord>,
    now: DateTime<Utc>,
) -> BehavioralEvent {
    let student_id = raw
        .str_field("studentBCEID")
        .or_else(|| raw.str_field("student"))
        .unwrap_or(UNKNOWN)
        .to_string();
    let joined = roster.get(&student_id);

    let name = raw
        .str_field("studentName")
        .map(str::to_string)
        .or_else(|| joined.map(StudentRecord::full_name))
        .unwrap_or_else(|| UNKNOWN.to_string());
    let house = raw
        .str_field("studentHouse")
        .or_else(|| joined.map(|s| s.house.as_str()))
        .unwrap_or(UNKNOWN)
        .to_string();
    let year_level = raw
        .str_field("studentYearLevel")
        .or_else(|| joined.map(|s| s.year_level.as_str()))
        .unwrap_or(UNKNOWN)
        .to_string();
    let staff = raw
        .str_field("staffName")
        .or_else(|| raw.str_field("staff"))
        .unwrap_or(UNKNOWN)
        .to_string();

    let (occurred_at, synthetic_ts) = normalize_timestamp(raw.timestamp().as_ref(), now);
    if synthetic_ts {
        warn!(id = raw.id, %category, "event timestamp normalized to now");
    }

    let details = match category {
        EventCategory::Infringement => EventDetails::Infringement {
            infringement_type: raw
                .str_field("infringementType")
                .unwrap_or(UNKNOWN)
                .to_string(),
        },
        EventCategory::OutOfClass => EventDetails::OutOfClass {
            reason: raw.str_field("reason").unwrap_or(UNKNOWN).to_string(),
            details: raw.str_field("details").unwrap_or_default().to_string(),
        },
        EventCategory::Affirmation => EventDetails::Affirmation {
            text: raw.str_field("affirmation").unwrap_or(UNKNOWN).to_string(),
        },
    };

    BehavioralEvent {
        id: raw.id.clone(),
        student_id,
        name,
        house,
        year_level,
        staff,
        occurred_at,
        synthetic_ts,
        details,
        notified_steps: parse_notified_steps(raw),
    }
}

fn parse_notified_steps(raw: &RawEvent) -> BTreeMap<u8, bool> {
    let mut steps = BTreeMap::new();
    if let Some(Value::Object(map)) = raw.fields.get("notifiedSteps") {
        for (key, value) in map {
            if let Some(n) = key.strip_prefix("step").and_then(|n| n.parse::<u8>().ok()) {
                steps.insert(n, value.as_bool().unwrap_or(false));
            }
        }
    }
    steps
}

/// Derived view for one category. Returned references are read-only
/// snapshots; only the engine replaces them.
#[derive(Debug, Clone, Default)]
pub struct CategoryView {
    events: Vec<BehavioralEvent>,
    counts: HashMap<String, u32>,
    house_tally: HashMap<String, u32>,
    reason_tally: HashMap<String, u32>,
}

impl CategoryView {
    /// Events sorted descending by instant (ties broken by id, so the
    /// order is identical across identical snapshots).
    pub fn events(&self) -> &[BehavioralEvent] {
        &self.events
    }

    /// Cumulative per-student counts.
    pub fn counts(&self) -> &HashMap<String, u32> {
        &self.counts
    }

    pub fn count_for(&self, student_id: &str) -> u32 {
        self.counts.get(student_id).copied().unwrap_or(0)
    }

    pub fn house_tally(&self) -> &HashMap<String, u32> {
        &self.house_tally
    }

    pub fn reason_tally(&self) -> &HashMap<String, u32> {
        &self.reason_tally
    }

    pub fn total(&self) -> usize {
        self.events.len()
    }

    /// Most recently created event for a student, if any. "Most recent"
    /// is by normalized instant with id as the tiebreaker.
    pub fn most_recent_for(&self, student_id: &str) -> Option<&BehavioralEvent> {
        self.events.iter().find(|e| e.student_id == student_id)
    }

    /// Whether any of a student's records carries a closed gate for the
    /// step. The flag is written to the most recent record at confirmation
    /// time, but newer records arriving afterwards must not reopen it, so
    /// the read spans every record.
    pub fn step_notified_for(&self, student_id: &str, step: u8) -> bool {
        self.events
            .iter()
            .filter(|e| e.student_id == student_id)
            .any(|e| e.step_notified(step))
    }

    /// Events from the same UTC day as `now`.
    pub fn today_count(&self, now: DateTime<Utc>) -> usize {
        self.events
            .iter()
            .filter(|e| e.occurred_at.date_naive() == now.date_naive())
            .count()
    }
}

/// Relative-date windows for filtered views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateWindow {
    #[default]
    All,
    Today,
    /// The trailing seven days.
    ThisWeek,
}

impl DateWindow {
    fn contains(&self, instant: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::All => true,
            Self::Today => instant.date_naive() == now.date_naive(),
            Self::ThisWeek => instant >= now - Duration::days(7),
        }
    }
}

/// Display filter over one category's events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Case-insensitive free-text match against name, id, and payload.
    pub text: Option<String>,
    /// Exact house match.
    pub house: Option<String>,
    pub window: DateWindow,
}

impl EventFilter {
    pub fn matches(&self, event: &BehavioralEvent, now: DateTime<Utc>) -> bool {
        if !self.window.contains(event.occurred_at, now) {
            return false;
        }
        if let Some(house) = &self.house {
            if &event.house != house {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let haystack = format!(
                "{} {} {}",
                event.name,
                event.student_id,
                event.details.search_text()
            )
            .to_lowercase();
            if !haystack.contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// Owner of the per-category derived views.
pub struct AggregateEngine {
    views: HashMap<EventCategory, CategoryView>,
    degraded: HashMap<EventCategory, String>,
}

impl AggregateEngine {
    pub fn new() -> Self {
        let mut views = HashMap::new();
        for category in EventCategory::ALL {
            views.insert(category, CategoryView::default());
        }
        Self {
            views,
            degraded: HashMap::new(),
        }
    }

    /// Replace the derived view for a category with one computed from the
    /// delivered snapshot. Idempotent: the same batch yields the same view.
    pub fn apply_snapshot(
        &mut self,
        category: EventCategory,
        batch: &[RawEvent],
        roster: &HashMap<String, StudentRecord>,
        now: DateTime<Utc>,
    ) {
        let mut events: Vec<BehavioralEvent> = batch
            .iter()
            .map(|raw| event_from_raw(category, raw, roster, now))
            .collect();
        events.sort_by(|a, b| {
            b.occurred_at
                .cmp(&a.occurred_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let mut view = CategoryView {
            events,
            ..CategoryView::default()
        };
        for event in &view.events {
            *view.counts.entry(event.student_id.clone()).or_insert(0) += 1;
            *view.house_tally.entry(event.house.clone()).or_insert(0) += 1;
            *view
                .reason_tally
                .entry(event.details.reason_label().to_string())
                .or_insert(0) += 1;
        }

        debug!(%category, events = view.events.len(), "snapshot applied");
        self.views.insert(category, view);
        self.degraded.remove(&category);
    }

    /// Record a feed delivery failure. The previous view stays in place as
    /// the last-known-good ground truth.
    pub fn record_feed_error(&mut self, category: EventCategory, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%category, "feed degraded: {reason}");
        self.degraded.insert(category, reason);
    }

    /// Non-blocking degraded-data warning for a category, if any.
    pub fn degraded(&self, category: EventCategory) -> Option<&str> {
        self.degraded.get(&category).map(String::as_str)
    }

    pub fn view(&self, category: EventCategory) -> &CategoryView {
        &self.views[&category]
    }

    /// Filtered, sorted projection of one category's events.
    pub fn filtered(
        &self,
        category: EventCategory,
        filter: &EventFilter,
        now: DateTime<Utc>,
    ) -> Vec<&BehavioralEvent> {
        self.view(category)
            .events
            .iter()
            .filter(|e| filter.matches(e, now))
            .collect()
    }

    /// Flip a notification-gate flag on the local materialized copy so
    /// evaluations between the store patch and the next snapshot see the
    /// closed gate. Returns false when the record is no longer present.
    pub(crate) fn set_notified_local(&mut self, record_id: &str, step: u8) -> bool {
        if let Some(view) = self.views.get_mut(&EventCategory::Infringement) {
            if let Some(event) = view.events.iter_mut().find(|e| e.id == record_id) {
                event.notified_steps.insert(step, true);
                return true;
            }
        }
        false
    }
}

impl Default for AggregateEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 20, 12, 0, 0).unwrap()
    }

    fn roster() -> HashMap<String, StudentRecord> {
        let mut roster = HashMap::new();
        roster.insert(
            "S1".to_string(),
            StudentRecord {
                id: "S1".to_string(),
                first_name: "Ada".to_string(),
                surname: "Lovelace".to_string(),
                house: "Becket".to_string(),
                year_level: "Year 8".to_string(),
                email: Some("ada@example.edu".to_string()),
            },
        );
        roster
    }

    fn infringement(id: &str, student: &str, ts: &str) -> RawEvent {
        RawEvent::new(id)
            .with_field("studentBCEID", student)
            .with_field("infringementType", "No Hat")
            .with_field("staffName", "Mr T")
            .with_field("timestamp", ts)
    }

    #[test]
    fn test_roster_backfill_and_placeholder() {
        let mut engine = AggregateEngine::new();
        let batch = vec![
            infringement("a", "S1", "2025-06-20T10:00:00Z"),
            infringement("b", "GHOST", "2025-06-20T09:00:00Z"),
        ];
        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());

        let view = engine.view(EventCategory::Infringement);
        let joined = view.most_recent_for("S1").unwrap();
        assert_eq!(joined.name, "Ada Lovelace");
        assert_eq!(joined.house, "Becket");

        // Unknown student still aggregates, with placeholders.
        let ghost = view.most_recent_for("GHOST").unwrap();
        assert_eq!(ghost.name, UNKNOWN);
        assert_eq!(view.count_for("GHOST"), 1);
    }

    #[test]
    fn test_sort_descending_with_stable_ties() {
        let mut engine = AggregateEngine::new();
        let batch = vec![
            infringement("a", "S1", "2025-06-20T09:00:00Z"),
            infringement("b", "S1", "2025-06-20T10:00:00Z"),
            infringement("c", "S1", "2025-06-20T10:00:00Z"),
        ];
        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());

        let ids: Vec<&str> = engine
            .view(EventCategory::Infringement)
            .events()
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_reapplying_snapshot_is_idempotent() {
        let mut engine = AggregateEngine::new();
        let batch = vec![
            infringement("a", "S1", "2025-06-20T09:00:00Z"),
            infringement("b", "S1", "2025-06-20T10:00:00Z"),
        ];

        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());
        let first = engine.view(EventCategory::Infringement).clone();

        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());
        let second = engine.view(EventCategory::Infringement);

        assert_eq!(first.events(), second.events());
        assert_eq!(first.counts(), second.counts());
        assert_eq!(second.count_for("S1"), 2);
    }

    #[test]
    fn test_feed_error_keeps_last_good_view() {
        let mut engine = AggregateEngine::new();
        let batch = vec![infringement("a", "S1", "2025-06-20T09:00:00Z")];
        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());

        engine.record_feed_error(EventCategory::Infringement, "permission denied");
        assert_eq!(engine.view(EventCategory::Infringement).total(), 1);
        assert!(engine.degraded(EventCategory::Infringement).is_some());

        // A successful snapshot clears the warning.
        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());
        assert!(engine.degraded(EventCategory::Infringement).is_none());
    }

    #[test]
    fn test_synthetic_timestamp_keeps_event_in_aggregates() {
        let mut engine = AggregateEngine::new();
        let batch = vec![infringement("a", "S1", "garbage")];
        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());

        let view = engine.view(EventCategory::Infringement);
        assert_eq!(view.total(), 1);
        let event = view.most_recent_for("S1").unwrap();
        assert!(event.synthetic_ts);
        assert_eq!(event.occurred_at, now());
    }

    #[test]
    fn test_filters() {
        let mut engine = AggregateEngine::new();
        let batch = vec![
            infringement("a", "S1", "2025-06-20T10:00:00Z"),
            infringement("b", "GHOST", "2025-06-10T10:00:00Z"),
        ];
        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());

        let today = EventFilter {
            window: DateWindow::Today,
            ..EventFilter::default()
        };
        assert_eq!(engine.filtered(EventCategory::Infringement, &today, now()).len(), 1);

        let week = EventFilter {
            window: DateWindow::ThisWeek,
            ..EventFilter::default()
        };
        assert_eq!(engine.filtered(EventCategory::Infringement, &week, now()).len(), 1);

        let by_house = EventFilter {
            house: Some("Becket".to_string()),
            ..EventFilter::default()
        };
        assert_eq!(
            engine.filtered(EventCategory::Infringement, &by_house, now()).len(),
            1
        );

        let by_text = EventFilter {
            text: Some("lovelace".to_string()),
            ..EventFilter::default()
        };
        let matches = engine.filtered(EventCategory::Infringement, &by_text, now());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "a");
    }

    #[test]
    fn test_tallies() {
        let mut engine = AggregateEngine::new();
        let batch = vec![
            RawEvent::new("a")
                .with_field("studentBCEID", "S1")
                .with_field("reason", "Sick Bay")
                .with_field("timestamp", "2025-06-20T10:00:00Z"),
            RawEvent::new("b")
                .with_field("studentBCEID", "S1")
                .with_field("reason", "Errand")
                .with_field("timestamp", "2025-06-20T11:00:00Z"),
        ];
        engine.apply_snapshot(EventCategory::OutOfClass, &batch, &roster(), now());

        let view = engine.view(EventCategory::OutOfClass);
        assert_eq!(view.reason_tally()["Sick Bay"], 1);
        assert_eq!(view.reason_tally()["Errand"], 1);
        assert_eq!(view.house_tally()["Becket"], 2);
        assert_eq!(view.today_count(now()), 2);
    }

    #[test]
    fn test_notified_steps_parsed_from_raw() {
        let mut engine = AggregateEngine::new();
        let batch = vec![infringement("a", "S1", "2025-06-20T10:00:00Z").with_field(
            "notifiedSteps",
            serde_json::json!({"step1": true, "step2": false}),
        )];
        engine.apply_snapshot(EventCategory::Infringement, &batch, &roster(), now());

        let event = engine
            .view(EventCategory::Infringement)
            .most_recent_for("S1")
            .unwrap();
        assert!(event.step_notified(1));
        assert!(!event.step_notified(2));
        assert!(!event.step_notified(3));
    }
}
