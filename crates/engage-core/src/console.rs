//! Composition root for the behaviour console.
//!
//! [`ConsoleEngine`] is constructed explicitly by the hosting application
//! and passed by reference wherever it is needed; there is no global
//! singleton. It owns the reference cache indexes, the aggregate views,
//! and the template set, and wires feed deliveries through aggregation,
//! escalation, and composition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::aggregate::{AggregateEngine, BehavioralEvent, EventDetails, UNKNOWN};
use crate::error::{EngineError, EngineResult};
use crate::escalation::{self, PendingNotification};
use crate::feed::{EventCategory, FeedMessage};
use crate::identity::StaffIdentity;
use crate::notify::{
    compose_affirmation_message, compose_step_message, AffirmationLedger, AffirmationMessage,
    ComposedMessage, StepMessage, TemplateSet, TemplateSource,
};
use crate::refdata::{
    self, datasets, spawn_refresh, CompanionRecord, GuardianContact, ReferenceCache,
    RefreshHandle, StaffRecord, StudentRecord,
};
use crate::store::{BatchOutcome, EventStore};

/// The engine behind the staff console: reference data, aggregates,
/// escalation, and message composition under one lifecycle.
pub struct ConsoleEngine {
    cache: Arc<ReferenceCache>,
    store: Arc<dyn EventStore>,
    templates: TemplateSet,
    aggregates: AggregateEngine,
    roster: HashMap<String, StudentRecord>,
    guardians: HashMap<String, GuardianContact>,
    companions: HashMap<String, CompanionRecord>,
    affirmations: AffirmationLedger,
    refresh: Option<RefreshHandle>,
}

impl ConsoleEngine {
    pub fn new(
        cache: Arc<ReferenceCache>,
        store: Arc<dyn EventStore>,
        templates: TemplateSet,
    ) -> Self {
        Self {
            cache,
            store,
            templates,
            aggregates: AggregateEngine::new(),
            roster: HashMap::new(),
            guardians: HashMap::new(),
            companions: HashMap::new(),
            affirmations: AffirmationLedger::new(),
            refresh: None,
        }
    }

    /// Load the reference datasets and build the join indexes. Call once
    /// before consuming feed messages; call again to pick up a reload.
    pub async fn open(&mut self) -> EngineResult<()> {
        let students = self.cache.load(datasets::STUDENTS).await?;
        let parents = self.cache.load(datasets::PARENT_EMAILS).await?;
        let companions = self.cache.load(datasets::HOUSE_COMPANIONS).await?;

        self.roster = refdata::roster_index(&students);
        self.guardians = refdata::guardian_index(&parents);
        self.companions = refdata::companion_index(&companions);

        info!(
            students = self.roster.len(),
            guardians = self.guardians.len(),
            companions = self.companions.len(),
            "console engine opened"
        );
        Ok(())
    }

    /// Force-reload the reference datasets and rebuild the indexes. On
    /// failure the previous indexes stay usable.
    pub async fn refresh_reference_data(&mut self) -> EngineResult<()> {
        self.cache.force_reload(datasets::STUDENTS).await?;
        self.cache.force_reload(datasets::PARENT_EMAILS).await?;
        self.cache.force_reload(datasets::HOUSE_COMPANIONS).await?;
        self.open().await
    }

    /// Replace the template set from a source. A template the source
    /// cannot provide falls back to built-in text, never an error.
    pub async fn load_templates(&mut self, source: &dyn TemplateSource) {
        self.templates = TemplateSet::load(source).await;
    }

    /// Resolve a staff identifier against the staff directory dataset.
    /// Returns `None` for an id the directory does not know.
    pub async fn resolve_staff(&self, staff_id: &str) -> EngineResult<Option<StaffIdentity>> {
        let rows = self.cache.load(datasets::STAFF).await?;
        Ok(refdata::staff_index(&rows)
            .get(staff_id)
            .map(StaffRecord::identity))
    }

    /// Start a background task that keeps the reference datasets warm.
    /// Stopped by [`ConsoleEngine::dispose`].
    pub fn start_periodic_refresh(&mut self, interval: Duration) {
        if self.refresh.is_some() {
            return;
        }
        self.refresh = Some(spawn_refresh(
            Arc::clone(&self.cache),
            vec![
                datasets::STUDENTS.to_string(),
                datasets::PARENT_EMAILS.to_string(),
                datasets::HOUSE_COMPANIONS.to_string(),
            ],
            interval,
        ));
    }

    /// Tear down background work. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(handle) = self.refresh.take() {
            handle.dispose();
        }
    }

    /// Consume one change-feed delivery. Snapshots replace the category's
    /// derived view; errors degrade it without clearing the last good data.
    pub fn on_feed_message(
        &mut self,
        category: EventCategory,
        message: FeedMessage,
        now: DateTime<Utc>,
    ) {
        match message {
            FeedMessage::Snapshot(batch) => {
                self.aggregates
                    .apply_snapshot(category, &batch, &self.roster, now);
            }
            FeedMessage::Error(reason) => {
                self.aggregates.record_feed_error(category, reason);
            }
        }
    }

    /// Read-only access to the derived views.
    pub fn aggregates(&self) -> &AggregateEngine {
        &self.aggregates
    }

    /// Students at step > 0, with contact and gate status.
    pub fn pending_notifications(&self) -> Vec<PendingNotification> {
        escalation::pending_notifications(
            self.aggregates.view(EventCategory::Infringement),
            &self.guardians,
        )
    }

    /// Compose the step-escalation message for one student.
    pub fn compose_step_message(
        &self,
        student_id: &str,
        step: u8,
        submitting_staff: Option<&StaffIdentity>,
        now: DateTime<Utc>,
    ) -> EngineResult<ComposedMessage> {
        let guardian = self.guardians.get(student_id).ok_or_else(|| {
            EngineError::NotificationTargetMissing {
                student_id: student_id.to_string(),
            }
        })?;

        let (student_name, house) = match self.roster.get(student_id) {
            Some(student) => (student.full_name(), student.house.clone()),
            None => self
                .aggregates
                .view(EventCategory::Infringement)
                .most_recent_for(student_id)
                .map(|e| (e.name.clone(), e.house.clone()))
                .unwrap_or_else(|| (UNKNOWN.to_string(), UNKNOWN.to_string())),
        };

        compose_step_message(
            &self.templates,
            &StepMessage {
                step,
                student_name: &student_name,
                guardian,
                companion: self.companions.get(&house),
                submitting_staff,
                today: now.date_naive(),
            },
        )
    }

    /// Record that the operator confirmed dispatch of a step message:
    /// closes the notification gate on the most recent infringement
    /// record. Returns the flagged record id.
    pub async fn confirm_step_sent(&mut self, student_id: &str, step: u8) -> EngineResult<String> {
        escalation::mark_notified(&mut self.aggregates, self.store.as_ref(), student_id, step)
            .await
    }

    /// Compose the message for one affirmation event.
    pub fn compose_affirmation(&self, event_id: &str) -> EngineResult<ComposedMessage> {
        let event = self
            .affirmation_event(event_id)
            .ok_or_else(|| EngineError::Store(format!("no affirmation event {event_id}")))?;
        let EventDetails::Affirmation { text } = &event.details else {
            return Err(EngineError::Store(format!(
                "event {event_id} is not an affirmation"
            )));
        };

        let student = self.roster.get(&event.student_id).ok_or_else(|| {
            EngineError::NotificationTargetMissing {
                student_id: event.student_id.clone(),
            }
        })?;

        compose_affirmation_message(
            &self.templates,
            &AffirmationMessage {
                student,
                guardian: self.guardians.get(&event.student_id),
                companion: self.companions.get(&event.house),
                affirmation_text: text,
                staff_name: &event.staff,
            },
        )
    }

    /// Session-local confirmation that an affirmation message was opened.
    /// Never written to the event store.
    pub fn confirm_affirmation_shown(&mut self, event_id: &str) {
        self.affirmations.mark_shown(event_id);
    }

    pub fn affirmation_shown(&self, event_id: &str) -> bool {
        self.affirmations.is_shown(event_id)
    }

    /// Affirmation events not yet shown this session.
    pub fn pending_affirmations(&self) -> Vec<&BehavioralEvent> {
        self.aggregates
            .view(EventCategory::Affirmation)
            .events()
            .iter()
            .filter(|e| !self.affirmations.is_shown(&e.id))
            .collect()
    }

    /// Bulk delete, admin only. The store reports exactly which records
    /// went so the host can reconcile.
    pub async fn delete_events(
        &self,
        identity: &StaffIdentity,
        category: EventCategory,
        ids: &[String],
    ) -> EngineResult<BatchOutcome> {
        if !identity.is_admin {
            warn!(staff = %identity.id, "bulk delete refused: not an administrator");
            return Err(EngineError::Forbidden {
                operation: "bulk delete".to_string(),
            });
        }
        self.store.delete_many(category, ids).await
    }

    fn affirmation_event(&self, event_id: &str) -> Option<&BehavioralEvent> {
        self.aggregates
            .view(EventCategory::Affirmation)
            .events()
            .iter()
            .find(|e| e.id == event_id)
    }
}

impl Drop for ConsoleEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
