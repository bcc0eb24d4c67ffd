//! In-memory stand-ins for the Notion API and the Reminders app.

use super::notion::{NotionPage, RemoteDraft, RemotePatch, RemoteTasks};
use super::reminders::{NewReminder, Reminder, ReminderPatch, ReminderStore, ReminderStoreError};
use crate::error::SyncError;
use chrono::NaiveDate;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

pub const USER_ID: &str = "user-1";

/// Page in the default property layout, assigned to [`USER_ID`].
pub fn page(id: &str, title: &str, status: &str, due: Option<NaiveDate>) -> NotionPage {
    let due = due.map(|d| json!({ "start": d.format("%Y-%m-%d").to_string() }));
    let properties = json!({
        "Request": { "type": "title", "title": [{ "plain_text": title }] },
        "Assignee": { "people": [{ "id": USER_ID }] },
        "Status": { "status": { "name": status } },
        "Due date": { "date": due },
    });
    NotionPage {
        id: id.to_string(),
        archived: false,
        in_trash: false,
        properties: properties.as_object().cloned().unwrap_or_default(),
        customer: None,
    }
}

pub fn page_id(n: u32) -> String {
    format!("{n:032x}")
}

#[derive(Default)]
pub struct MockRemote {
    pub pages: Mutex<BTreeMap<String, NotionPage>>,
    pub failing: Mutex<HashSet<String>>,
    pub fail_query: Mutex<bool>,
    pub fail_create: Mutex<bool>,
    pub calls: Mutex<Vec<String>>,
    next_id: Mutex<u32>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(0xa000),
            ..Self::default()
        }
    }

    pub fn insert(&self, page: NotionPage) {
        self.pages.lock().unwrap().insert(page.id.clone(), page);
    }

    pub fn remove(&self, id: &str) {
        self.pages.lock().unwrap().remove(id);
    }

    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<NotionPage> {
        self.pages.lock().unwrap().get(id).cloned()
    }

    pub fn title(&self, id: &str) -> Option<String> {
        self.get(id).and_then(|p| {
            p.properties["Request"]["title"][0]["plain_text"]
                .as_str()
                .map(str::to_string)
        })
    }

    pub fn status(&self, id: &str) -> Option<String> {
        self.get(id).and_then(|p| {
            p.properties["Status"]["status"]["name"]
                .as_str()
                .map(str::to_string)
        })
    }

    pub fn set_status(&self, id: &str, status: &str) {
        if let Some(page) = self.pages.lock().unwrap().get_mut(id) {
            page.properties["Status"] = json!({ "status": { "name": status } });
        }
    }

    pub fn set_title(&self, id: &str, title: &str) {
        if let Some(page) = self.pages.lock().unwrap().get_mut(id) {
            page.properties["Request"] = json!({ "type": "title", "title": [{ "plain_text": title }] });
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, id: &str) -> Result<(), SyncError> {
        if self.failing.lock().unwrap().contains(id) {
            return Err(SyncError::Http {
                status: 503,
                detail: format!("{id} unavailable"),
            });
        }
        Ok(())
    }
}

impl RemoteTasks for MockRemote {
    fn query_assigned(&self) -> Result<Vec<NotionPage>, SyncError> {
        if *self.fail_query.lock().unwrap() {
            return Err(SyncError::Request("timeout".to_string()));
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .values()
            .filter(|p| !p.archived)
            .filter(|p| {
                let status = p.properties["Status"]["status"]["name"].as_str();
                status != Some("Done") && status != Some("Canceled")
            })
            .cloned()
            .collect())
    }

    fn fetch_page(&self, page_id: &str) -> Result<Option<NotionPage>, SyncError> {
        self.check(page_id)?;
        self.calls.lock().unwrap().push(format!("fetch {page_id}"));
        Ok(self.get(page_id).filter(|p| !p.archived))
    }

    fn create_task(&self, draft: &RemoteDraft) -> Result<String, SyncError> {
        if *self.fail_create.lock().unwrap() {
            return Err(SyncError::Request("create refused".to_string()));
        }
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            page_id(*next)
        };
        self.calls.lock().unwrap().push(format!("create {}", draft.title));
        self.insert(page(&id, &draft.title, "New", draft.due_date));
        Ok(id)
    }

    fn update_task(&self, page_id: &str, patch: &RemotePatch) -> Result<(), SyncError> {
        self.check(page_id)?;
        self.calls.lock().unwrap().push(format!("update {page_id}"));
        let mut pages = self.pages.lock().unwrap();
        let page = pages.get_mut(page_id).ok_or(SyncError::Http {
            status: 404,
            detail: "not found".to_string(),
        })?;
        if let Some(title) = &patch.title {
            page.properties["Request"] =
                json!({ "type": "title", "title": [{ "plain_text": title }] });
        }
        if let Some(due) = patch.due_date {
            let value = due
                .map(|d| json!({ "start": d.format("%Y-%m-%d").to_string() }))
                .unwrap_or(Value::Null);
            page.properties["Due date"] = json!({ "date": value });
        }
        if let Some(status) = &patch.status {
            page.properties["Status"] = json!({ "status": { "name": status } });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockReminderStore {
    pub reminders: Mutex<Vec<Reminder>>,
    pub failing: Mutex<HashSet<String>>,
    pub fail_create: Mutex<bool>,
    pub denied: Mutex<bool>,
    pub calls: Mutex<Vec<String>>,
    next_id: Mutex<u32>,
}

impl MockReminderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: &str, title: &str, notes: Option<&str>) {
        self.reminders.lock().unwrap().push(Reminder {
            id: id.to_string(),
            title: title.to_string(),
            notes: notes.map(str::to_string),
            due_date: None,
            completed: false,
        });
    }

    pub fn get(&self, id: &str) -> Option<Reminder> {
        self.reminders
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Reminder> {
        self.reminders.lock().unwrap().clone()
    }

    pub fn edit(&self, id: &str, f: impl FnOnce(&mut Reminder)) {
        if let Some(reminder) = self.reminders.lock().unwrap().iter_mut().find(|r| r.id == id) {
            f(reminder);
        }
    }

    pub fn remove(&self, id: &str) {
        self.reminders.lock().unwrap().retain(|r| r.id != id);
    }

    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, id: &str) -> Result<(), ReminderStoreError> {
        if *self.denied.lock().unwrap() {
            return Err(ReminderStoreError::PermissionDenied("-1743".to_string()));
        }
        if self.failing.lock().unwrap().contains(id) {
            return Err(ReminderStoreError::Backend(format!("{id} busy")));
        }
        Ok(())
    }

    fn with<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Reminder) -> T,
    ) -> Result<T, ReminderStoreError> {
        self.check(id)?;
        let mut reminders = self.reminders.lock().unwrap();
        let reminder = reminders
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(ReminderStoreError::NotFound)?;
        Ok(f(reminder))
    }
}

impl ReminderStore for MockReminderStore {
    fn check_access(&self) -> Result<(), ReminderStoreError> {
        self.check("")
    }

    fn list_reminders(&self, _list: &str) -> Result<Vec<Reminder>, ReminderStoreError> {
        self.check("")?;
        Ok(self.all())
    }

    fn create_reminder(
        &self,
        _list: &str,
        reminder: &NewReminder,
    ) -> Result<String, ReminderStoreError> {
        self.check("")?;
        if *self.fail_create.lock().unwrap() {
            return Err(ReminderStoreError::Backend("create refused".to_string()));
        }
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("x-apple-reminder://new-{}", *next)
        };
        self.calls.lock().unwrap().push(format!("create {}", reminder.title));
        self.reminders.lock().unwrap().push(Reminder {
            id: id.clone(),
            title: reminder.title.clone(),
            notes: reminder.notes.clone(),
            due_date: reminder.due_date,
            completed: false,
        });
        Ok(id)
    }

    fn update_reminder(&self, id: &str, patch: &ReminderPatch) -> Result<(), ReminderStoreError> {
        self.with(id, |r| {
            if let Some(title) = &patch.title {
                r.title = title.clone();
            }
            if let Some(notes) = &patch.notes {
                r.notes = Some(notes.clone());
            }
            if let Some(due) = patch.due_date {
                r.due_date = due;
            }
        })?;
        self.calls.lock().unwrap().push(format!("update {id}"));
        Ok(())
    }

    fn complete_reminder(&self, id: &str) -> Result<(), ReminderStoreError> {
        self.with(id, |r| r.completed = true)?;
        self.calls.lock().unwrap().push(format!("complete {id}"));
        Ok(())
    }

    fn delete_reminder(&self, id: &str) -> Result<(), ReminderStoreError> {
        self.with(id, |_| ())?;
        self.remove(id);
        self.calls.lock().unwrap().push(format!("delete {id}"));
        Ok(())
    }
}
