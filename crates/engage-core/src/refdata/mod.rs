//! Reference data: slow-changing lookup tables behind a retrying cache.
//!
//! Reference datasets (student roster, guardian contacts, house companions,
//! staff directory) arrive as header-row-delimited tabular payloads from a
//! remote source. [`ReferenceCache`] owns loading them: TTL-based caching,
//! retry with exponential backoff, and coalescing of concurrent requests
//! for the same dataset into one fetch.
//!
//! Rows are loosely typed (`HashMap<String, String>`); the typed record
//! mappers below skip rows missing their key fields and warn rather than
//! failing the whole dataset.

mod cache;
mod source;

pub use cache::{spawn_refresh, CachePolicy, ReferenceCache, RefreshHandle};
pub use source::{HttpTableSource, TableSource};

use std::collections::HashMap;

use tracing::warn;

use crate::identity::StaffIdentity;

/// One parsed row of a reference table, keyed by header name.
pub type Row = HashMap<String, String>;

/// Well-known dataset names served by the reference source.
pub mod datasets {
    pub const STUDENTS: &str = "students";
    pub const PARENT_EMAILS: &str = "parentemail";
    pub const HOUSE_COMPANIONS: &str = "housecompanions";
    pub const STAFF: &str = "staffid";
}

/// A roster entry for one student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRecord {
    /// Stable student identifier.
    pub id: String,
    pub first_name: String,
    pub surname: String,
    pub house: String,
    pub year_level: String,
    /// Student mailbox, when the roster has one.
    pub email: Option<String>,
}

impl StudentRecord {
    /// Display name in "First Last" form.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.surname)
    }
}

/// Guardian contact for one student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianContact {
    pub student_id: String,
    pub name: String,
    pub email: String,
}

/// House companion staff member for one house.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionRecord {
    pub house: String,
    pub name: String,
    pub email: Option<String>,
}

/// One staff directory entry. The identity check itself happens in the
/// host layer; this is only the dataset it reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffRecord {
    /// Fixed-format staff identifier (6-digit numeric).
    pub id: String,
    pub name: String,
    pub is_admin: bool,
    pub email: Option<String>,
}

impl StaffRecord {
    /// Resolve this directory entry into the identity object the engine
    /// consumes.
    pub fn identity(&self) -> StaffIdentity {
        let mut identity = StaffIdentity::new(self.name.clone(), self.id.clone());
        if let Some(email) = &self.email {
            identity = identity.with_email(email.clone());
        }
        if self.is_admin {
            identity = identity.admin();
        }
        identity
    }
}

/// Parse a header-row-delimited payload into rows.
///
/// The first non-empty line is the header; subsequent lines map
/// positionally onto it. Double-quoted fields may contain the delimiter.
/// Rows shorter than the header keep only the columns they have.
pub fn parse_table(text: &str) -> Vec<Row> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let headers: Vec<String> = match lines.next() {
        Some(header) => split_fields(header),
        None => return Vec::new(),
    };

    lines
        .map(|line| {
            let fields = split_fields(line);
            headers
                .iter()
                .zip(fields)
                .map(|(h, f)| (h.clone(), f))
                .collect()
        })
        .collect()
}

fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

fn field<'a>(row: &'a Row, name: &str) -> Option<&'a str> {
    row.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

/// Map roster rows into typed student records, keyed by student id.
///
/// Rows missing the identifier or either name field are skipped with a
/// warning; they cannot be joined or displayed meaningfully.
pub fn roster_index(rows: &[Row]) -> HashMap<String, StudentRecord> {
    let mut roster = HashMap::new();
    for row in rows {
        let (Some(id), Some(first), Some(last)) = (
            field(row, "BCEID1"),
            field(row, "FirstName"),
            field(row, "LegalSurname1"),
        ) else {
            warn!("skipping roster row with missing key fields");
            continue;
        };
        roster.insert(
            id.to_string(),
            StudentRecord {
                id: id.to_string(),
                first_name: first.to_string(),
                surname: last.to_string(),
                house: field(row, "HouseName").unwrap_or("Unassigned").to_string(),
                year_level: field(row, "YearLevelName").unwrap_or("N/A").to_string(),
                email: field(row, "BCEEmail1").map(str::to_string),
            },
        );
    }
    roster
}

/// Map contact rows into guardian contacts, keyed by student id.
pub fn guardian_index(rows: &[Row]) -> HashMap<String, GuardianContact> {
    let mut contacts = HashMap::new();
    for row in rows {
        let (Some(id), Some(email)) = (field(row, "BCEID1"), field(row, "ParentEmail")) else {
            continue;
        };
        let name = [
            field(row, "ParentTitle"),
            field(row, "ParentFirstName"),
            field(row, "ParentSecondName"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
        contacts.insert(
            id.to_string(),
            GuardianContact {
                student_id: id.to_string(),
                name: if name.is_empty() {
                    "Parent/Guardian".to_string()
                } else {
                    name
                },
                email: email.to_string(),
            },
        );
    }
    contacts
}

/// Map staff directory rows into staff records, keyed by staff id.
///
/// Ids are fixed-format 6-digit numerics; anything else is skipped with a
/// warning. The admin marker is the literal `Y`.
pub fn staff_index(rows: &[Row]) -> HashMap<String, StaffRecord> {
    let mut staff = HashMap::new();
    for row in rows {
        let (Some(id), Some(name)) = (field(row, "StaffID"), field(row, "Name")) else {
            continue;
        };
        if id.len() != 6 || !id.chars().all(|c| c.is_ascii_digit()) {
            warn!(id, "skipping staff row with malformed id");
            continue;
        }
        staff.insert(
            id.to_string(),
            StaffRecord {
                id: id.to_string(),
                name: name.to_string(),
                is_admin: field(row, "AdminAccess")
                    .map(|v| v.eq_ignore_ascii_case("y"))
                    .unwrap_or(false),
                email: field(row, "Email").map(str::to_string),
            },
        );
    }
    staff
}

/// Map companion rows into house companions, keyed by house name.
pub fn companion_index(rows: &[Row]) -> HashMap<String, CompanionRecord> {
    let mut companions = HashMap::new();
    for row in rows {
        let Some(house) = field(row, "House").or_else(|| field(row, "HouseName")) else {
            continue;
        };
        let name = field(row, "Name")
            .or_else(|| field(row, "CompanionName"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{house} House Companion"));
        companions.insert(
            house.to_string(),
            CompanionRecord {
                house: house.to_string(),
                name,
                email: field(row, "Email")
                    .or_else(|| field(row, "CompanionEmail"))
                    .map(str::to_string),
            },
        );
    }
    companions
}
