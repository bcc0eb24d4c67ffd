//! Local reminders store.
//!
//! [`OsascriptStore`] drives the Reminders app through JavaScript for
//! Automation. Every script reads its inputs from `argv`, so titles and notes
//! are never spliced into script source.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Reminder {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReminder {
    pub title: String,
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// `Some(None)` clears the due date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
}

impl ReminderPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.notes.is_none() && self.due_date.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderStoreError {
    /// The OS has not granted this process access to Reminders.
    PermissionDenied(String),
    NotFound,
    Backend(String),
}

impl fmt::Display for ReminderStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReminderStoreError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            ReminderStoreError::NotFound => write!(f, "reminder not found"),
            ReminderStoreError::Backend(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for ReminderStoreError {}

pub trait ReminderStore {
    /// Fails with `PermissionDenied` when the process may not touch Reminders.
    fn check_access(&self) -> Result<(), ReminderStoreError>;

    /// All reminders of the named list, completed ones included. The list is
    /// created when it does not exist yet.
    fn list_reminders(&self, list: &str) -> Result<Vec<Reminder>, ReminderStoreError>;

    fn create_reminder(&self, list: &str, reminder: &NewReminder)
    -> Result<String, ReminderStoreError>;

    fn update_reminder(&self, id: &str, patch: &ReminderPatch) -> Result<(), ReminderStoreError>;

    fn complete_reminder(&self, id: &str) -> Result<(), ReminderStoreError>;

    fn delete_reminder(&self, id: &str) -> Result<(), ReminderStoreError>;
}

const CHECK_ACCESS_SCRIPT: &str = r#"
function run(argv) {
  Application('Reminders').lists.name();
  return 'ok';
}
"#;

const LIST_SCRIPT: &str = r#"
function run(argv) {
  const app = Application('Reminders');
  const name = argv[0];
  if (app.lists.whose({ name: name })().length === 0) {
    app.lists.push(app.List({ name: name }));
  }
  const items = app.lists.byName(name).reminders;
  const ids = items.id();
  const titles = items.name();
  const bodies = items.body();
  const done = items.completed();
  const dues = items.dueDate();
  const pad = (n) => (n < 10 ? '0' : '') + n;
  const day = (d) => d ? d.getFullYear() + '-' + pad(d.getMonth() + 1) + '-' + pad(d.getDate()) : null;
  return JSON.stringify(ids.map((id, i) => ({
    id: id,
    title: titles[i] || '',
    notes: bodies[i] || null,
    due_date: day(dues[i]),
    completed: !!done[i],
  })));
}
"#;

const CREATE_SCRIPT: &str = r#"
function run(argv) {
  const app = Application('Reminders');
  const draft = JSON.parse(argv[1]);
  const props = { name: draft.title };
  if (draft.notes) props.body = draft.notes;
  if (draft.due_date) {
    const p = draft.due_date.split('-').map(Number);
    props.alldayDueDate = new Date(p[0], p[1] - 1, p[2]);
  }
  const reminder = app.Reminder(props);
  app.lists.byName(argv[0]).reminders.push(reminder);
  return reminder.id();
}
"#;

const UPDATE_SCRIPT: &str = r#"
function run(argv) {
  const app = Application('Reminders');
  const r = app.reminders.byId(argv[0]);
  r.name();
  const patch = JSON.parse(argv[1]);
  if (patch.title !== undefined) r.name = patch.title;
  if (patch.notes !== undefined) r.body = patch.notes;
  if (patch.due_date === null) {
    r.dueDate = null;
  } else if (patch.due_date !== undefined) {
    const p = patch.due_date.split('-').map(Number);
    r.alldayDueDate = new Date(p[0], p[1] - 1, p[2]);
  }
  return 'ok';
}
"#;

const COMPLETE_SCRIPT: &str = r#"
function run(argv) {
  const r = Application('Reminders').reminders.byId(argv[0]);
  r.name();
  r.completed = true;
  return 'ok';
}
"#;

const DELETE_SCRIPT: &str = r#"
function run(argv) {
  const app = Application('Reminders');
  const r = app.reminders.byId(argv[0]);
  r.name();
  app.delete(r);
  return 'ok';
}
"#;

#[derive(Serialize)]
struct CreateDraft<'a> {
    title: &'a str,
    notes: Option<&'a str>,
    due_date: Option<NaiveDate>,
}

#[derive(Debug, Default)]
pub struct OsascriptStore;

impl OsascriptStore {
    pub fn new() -> Self {
        Self
    }

    fn run_script(&self, script: &str, args: &[&str]) -> Result<String, ReminderStoreError> {
        let output = Command::new("osascript")
            .args(["-l", "JavaScript", "-e", script])
            .args(args)
            .output()
            .map_err(|e| ReminderStoreError::Backend(format!("failed to run osascript: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
    }
}

fn classify_failure(stderr: &str) -> ReminderStoreError {
    let message = stderr.trim().replace(['\n', '\r'], " ");
    let lower = message.to_lowercase();
    if lower.contains("-1743") || lower.contains("not authorized") || lower.contains("not allowed")
    {
        ReminderStoreError::PermissionDenied(
            "grant access in System Settings > Privacy & Security > Reminders".to_string(),
        )
    } else if lower.contains("-1728") || lower.contains("can't get object") {
        ReminderStoreError::NotFound
    } else {
        ReminderStoreError::Backend(message)
    }
}

impl ReminderStore for OsascriptStore {
    fn check_access(&self) -> Result<(), ReminderStoreError> {
        self.run_script(CHECK_ACCESS_SCRIPT, &[]).map(|_| ())
    }

    fn list_reminders(&self, list: &str) -> Result<Vec<Reminder>, ReminderStoreError> {
        let raw = self.run_script(LIST_SCRIPT, &[list])?;
        serde_json::from_str(&raw)
            .map_err(|e| ReminderStoreError::Backend(format!("unexpected list output: {e}")))
    }

    fn create_reminder(
        &self,
        list: &str,
        reminder: &NewReminder,
    ) -> Result<String, ReminderStoreError> {
        let draft = serde_json::to_string(&CreateDraft {
            title: &reminder.title,
            notes: reminder.notes.as_deref(),
            due_date: reminder.due_date,
        })
        .map_err(|e| ReminderStoreError::Backend(e.to_string()))?;
        let id = self.run_script(CREATE_SCRIPT, &[list, &draft])?;
        if id.is_empty() {
            return Err(ReminderStoreError::Backend(
                "reminder created without an identifier".to_string(),
            ));
        }
        Ok(id)
    }

    fn update_reminder(&self, id: &str, patch: &ReminderPatch) -> Result<(), ReminderStoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let patch =
            serde_json::to_string(patch).map_err(|e| ReminderStoreError::Backend(e.to_string()))?;
        self.run_script(UPDATE_SCRIPT, &[id, &patch]).map(|_| ())
    }

    fn complete_reminder(&self, id: &str) -> Result<(), ReminderStoreError> {
        self.run_script(COMPLETE_SCRIPT, &[id]).map(|_| ())
    }

    fn delete_reminder(&self, id: &str) -> Result<(), ReminderStoreError> {
        self.run_script(DELETE_SCRIPT, &[id]).map(|_| ())
    }
}
