//! Notification composer: templates in, structured messages out.
//!
//! Composition is pure: it fills `{name}`-style placeholders, splits the
//! first template line off as the subject, and resolves recipients. It
//! never sends anything and has no idea whether the host's mail client
//! ever will; "sent" is recorded only when the operator confirms, which
//! closes the escalation gate (infringement steps) or flips a
//! session-local shown flag (affirmations).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::identity::StaffIdentity;
use crate::refdata::{CompanionRecord, GuardianContact, StudentRecord};

/// A composed message, ready to hand to the external mail-client
/// collaborator. Delivery is never observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedMessage {
    pub to: String,
    /// Copy recipients: resolvable entries only, de-duplicated, never
    /// repeating the primary.
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Fetches template text by id from wherever the host keeps it.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch_template(&self, id: &str) -> Result<String, String>;
}

/// Template ids as served by the template source.
fn step_template_id(step: u8) -> String {
    format!("step{step}_uniform_infringement")
}
const AFFIRMATION_TEMPLATE_ID: &str = "affirmation_notification";

/// The per-step and affirmation templates, with built-in fallback text for
/// anything the source cannot provide.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    steps: HashMap<u8, String>,
    affirmation: String,
}

impl TemplateSet {
    /// Built-in fallback text only.
    pub fn fallback() -> Self {
        Self {
            steps: (1..=6).map(|s| (s, fallback_step_template(s))).collect(),
            affirmation: fallback_affirmation_template(),
        }
    }

    /// Fetch all templates from a source, substituting the fallback text
    /// for any that fail. Never errors: a missing template is a degraded
    /// template, not a broken composer.
    pub async fn load(source: &dyn TemplateSource) -> Self {
        let mut set = Self::fallback();
        for step in 1..=6u8 {
            match source.fetch_template(&step_template_id(step)).await {
                Ok(text) => {
                    set.steps.insert(step, text);
                }
                Err(reason) => {
                    warn!(step, "step template unavailable, using fallback: {reason}");
                }
            }
        }
        match source.fetch_template(AFFIRMATION_TEMPLATE_ID).await {
            Ok(text) => set.affirmation = text,
            Err(reason) => {
                warn!("affirmation template unavailable, using fallback: {reason}");
            }
        }
        set
    }

    pub fn step_template(&self, step: u8) -> Option<&str> {
        self.steps.get(&step).map(String::as_str)
    }

    pub fn affirmation_template(&self) -> &str {
        &self.affirmation
    }
}

fn fallback_step_template(step: u8) -> String {
    let counts = [
        "five", "ten", "fifteen", "twenty", "twenty-five", "thirty",
    ];
    let spelled = counts[(step as usize) - 1];
    format!(
        "Subject: Uniform Infringement Notification – Step {step}\n\
         \n\
         Dear {{parentName}},\n\
         \n\
         This email is to notify you that {{studentName}} has now received \
         {spelled} uniform infringements this year. As part of the College's \
         uniform policy, {{studentName}} is required to attend a re-engagement \
         session on {{date}} from {{startTime}} to {{endTime}}.\n\
         \n\
         Kind regards,\n\
         {{houseCompanion}}\n\
         House Companion"
    )
}

fn fallback_affirmation_template() -> String {
    "Subject: Positive Affirmation for {studentName}\n\
     \n\
     Dear {parentName},\n\
     \n\
     We are delighted to share a positive affirmation that was recently \
     submitted for {studentName}:\n\
     \n\
     \"{affirmationText}\"\n\
     \n\
     This recognition was submitted by: {staffName}.\n\
     \n\
     Kind regards"
        .to_string()
}

/// Substitute `{name}` placeholders. Every placeholder is replaced:
/// unknown names substitute to the empty string, never an error.
fn substitute(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();

    while let Some(ch) = chars.next() {
        if ch != '{' {
            out.push(ch);
            continue;
        }
        let mut name = String::new();
        let mut closed = false;
        for inner in chars.by_ref() {
            if inner == '}' {
                closed = true;
                break;
            }
            name.push(inner);
        }
        if closed {
            if let Some(value) = vars.get(name.as_str()) {
                out.push_str(value);
            }
            // Unknown placeholder: substitute empty.
        } else {
            // Unterminated brace: keep the literal text.
            out.push('{');
            out.push_str(&name);
        }
    }
    out
}

/// Render a template into subject and body. The first line becomes the
/// subject (a literal `Subject:` prefix is stripped); the rest is the body.
fn render(template: &str, vars: &HashMap<&str, String>) -> (String, String) {
    let filled = substitute(template, vars);
    let mut lines = filled.lines();
    let subject = match lines.next() {
        Some(first) => first
            .strip_prefix("Subject:")
            .map(str::trim)
            .unwrap_or("Notification")
            .to_string(),
        None => "Notification".to_string(),
    };
    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    (subject, body)
}

/// Assemble a de-duplicated cc list, skipping unresolvable entries and the
/// primary recipient.
fn cc_list(to: &str, candidates: &[Option<&str>]) -> Vec<String> {
    let mut seen = HashSet::new();
    seen.insert(to.to_string());
    candidates
        .iter()
        .flatten()
        .filter(|email| !email.is_empty())
        .filter(|email| seen.insert((**email).to_string()))
        .map(|email| (*email).to_string())
        .collect()
}

/// The next school day after `today`: Friday and Saturday roll to Monday,
/// everything else to tomorrow.
pub fn next_school_day(today: NaiveDate) -> NaiveDate {
    let days = match today.weekday() {
        Weekday::Fri => 3,
        Weekday::Sat => 2,
        _ => 1,
    };
    today + chrono::Duration::days(days)
}

/// Inputs for one escalation-step message.
#[derive(Debug, Clone)]
pub struct StepMessage<'a> {
    pub step: u8,
    pub student_name: &'a str,
    pub guardian: &'a GuardianContact,
    pub companion: Option<&'a CompanionRecord>,
    /// Staff member confirming the dispatch, copied when they have a
    /// mailbox.
    pub submitting_staff: Option<&'a StaffIdentity>,
    /// "Today" from the caller; composition stays pure.
    pub today: NaiveDate,
}

/// Compose a step-escalation message to the guardian.
pub fn compose_step_message(
    templates: &TemplateSet,
    msg: &StepMessage<'_>,
) -> EngineResult<ComposedMessage> {
    let template = templates
        .step_template(msg.step)
        .ok_or_else(|| EngineError::Template {
            id: step_template_id(msg.step),
        })?;

    let companion_name = msg
        .companion
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "House Companion".to_string());
    let session_date = next_school_day(msg.today)
        .format("%A, %d %B %Y")
        .to_string();

    let mut vars = HashMap::new();
    vars.insert("parentName", msg.guardian.name.clone());
    vars.insert("studentName", msg.student_name.to_string());
    vars.insert("houseCompanion", companion_name);
    vars.insert("date", session_date);
    vars.insert("startTime", "3:30 PM".to_string());
    vars.insert("endTime", "4:30 PM".to_string());

    let (subject, body) = render(template, &vars);
    let to = msg.guardian.email.clone();
    let cc = cc_list(
        &to,
        &[
            msg.companion.and_then(|c| c.email.as_deref()),
            msg.submitting_staff.and_then(|s| s.email.as_deref()),
        ],
    );

    debug!(step = msg.step, to, cc = cc.len(), "step message composed");
    Ok(ComposedMessage {
        to,
        cc,
        subject,
        body,
    })
}

/// Inputs for one affirmation message.
#[derive(Debug, Clone)]
pub struct AffirmationMessage<'a> {
    /// Roster entry; the student's own mailbox is the primary recipient.
    pub student: &'a StudentRecord,
    pub guardian: Option<&'a GuardianContact>,
    pub companion: Option<&'a CompanionRecord>,
    pub affirmation_text: &'a str,
    /// Name of the staff member who submitted the affirmation.
    pub staff_name: &'a str,
}

/// Compose an affirmation message to the student, copying guardian and
/// house companion where resolvable.
pub fn compose_affirmation_message(
    templates: &TemplateSet,
    msg: &AffirmationMessage<'_>,
) -> EngineResult<ComposedMessage> {
    let to = msg
        .student
        .email
        .clone()
        .ok_or_else(|| EngineError::NotificationTargetMissing {
            student_id: msg.student.id.clone(),
        })?;

    let mut vars = HashMap::new();
    vars.insert(
        "parentName",
        msg.guardian
            .map(|g| g.name.clone())
            .unwrap_or_else(|| "Parent/Guardian".to_string()),
    );
    vars.insert("studentName", msg.student.full_name());
    vars.insert("affirmationText", msg.affirmation_text.to_string());
    vars.insert("staffName", msg.staff_name.to_string());

    let (subject, body) = render(templates.affirmation_template(), &vars);
    let cc = cc_list(
        &to,
        &[
            msg.guardian.map(|g| g.email.as_str()),
            msg.companion.and_then(|c| c.email.as_deref()),
        ],
    );

    Ok(ComposedMessage {
        to,
        cc,
        subject,
        body,
    })
}

/// Session-local record of affirmation messages the operator has already
/// opened. Never persisted to the event store.
#[derive(Debug, Default)]
pub struct AffirmationLedger {
    shown: HashSet<String>,
}

impl AffirmationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_shown(&mut self, event_id: &str) {
        self.shown.insert(event_id.to_string());
    }

    pub fn is_shown(&self, event_id: &str) -> bool {
        self.shown.contains(event_id)
    }

    pub fn shown_count(&self) -> usize {
        self.shown.len()
    }
}
