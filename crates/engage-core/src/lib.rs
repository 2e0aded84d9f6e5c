//! Behaviour Console Sync & Escalation Engine
//!
//! This library is the data core of a staff-facing behaviour-management
//! console: staff log uniform infringements, out-of-class movements, and
//! positive affirmations against a student roster; an administrator view
//! aggregates those events, escalates repeated infringements through a
//! six-step parent-notification ladder, and composes notification emails
//! with at-most-once semantics per step.
//!
//! # Components
//!
//! - [`refdata`]: caching, retrying loader for slow-changing reference
//!   tables (roster, guardian contacts, house companions, staff directory)
//! - [`feed`]: change-feed types and the timestamp normalizer that folds
//!   heterogeneous encodings into one comparable instant
//! - [`aggregate`]: snapshot-replacing aggregation into per-student counts,
//!   tallies, and filterable sorted views
//! - [`escalation`]: infringement-count → step mapping and the per-step
//!   notification gate
//! - [`notify`]: template-driven message composition (recipients, subject,
//!   body) without any knowledge of delivery
//! - [`store`]: the event-store write boundary, plus an in-memory
//!   implementation for tests and embedded hosts
//! - [`console`]: the explicitly constructed composition root with an
//!   `open`/`dispose` lifecycle
//!
//! The engine never renders UI, never authenticates staff, and never sends
//! mail; those are external collaborators. Its job is to keep the derived
//! views correct under redelivery, slow loads, and partial failure.

pub mod aggregate;
pub mod console;
pub mod error;
pub mod escalation;
pub mod feed;
pub mod identity;
pub mod notify;
pub mod refdata;
pub mod store;

pub use aggregate::{AggregateEngine, BehavioralEvent, CategoryView, DateWindow, EventDetails, EventFilter};
pub use console::ConsoleEngine;
pub use error::{EngineError, EngineResult};
pub use escalation::{step_for_count, PendingNotification};
pub use feed::{EventCategory, FeedMessage, RawEvent};
pub use identity::StaffIdentity;
pub use notify::{ComposedMessage, TemplateSet};
pub use refdata::{CachePolicy, ReferenceCache};
pub use store::{BatchOutcome, EventStore, MemoryEventStore};
