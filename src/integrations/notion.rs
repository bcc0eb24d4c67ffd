use crate::config::NotionConfig;
use crate::error::SyncError;
use crate::normalize::notion_id;
use chrono::NaiveDate;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const NOTION_API: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const PAGE_SIZE: u32 = 100;

/// A database page as returned by the API, plus the resolved customer name.
#[derive(Debug, Clone, Deserialize)]
pub struct NotionPage {
    pub id: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub in_trash: bool,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(skip)]
    pub customer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDraft {
    pub title: String,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemotePatch {
    pub title: Option<String>,
    /// `Some(None)` clears the due date.
    pub due_date: Option<Option<NaiveDate>>,
    pub status: Option<String>,
}

impl RemotePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.due_date.is_none() && self.status.is_none()
    }
}

pub trait RemoteTasks {
    /// Open tasks assigned to the configured user.
    fn query_assigned(&self) -> Result<Vec<NotionPage>, SyncError>;

    /// A single page regardless of the query filter. `None` when it no longer exists.
    fn fetch_page(&self, page_id: &str) -> Result<Option<NotionPage>, SyncError>;

    /// Returns the normalised id of the new page.
    fn create_task(&self, draft: &RemoteDraft) -> Result<String, SyncError>;

    fn update_task(&self, page_id: &str, patch: &RemotePatch) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotionUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub person: Option<PersonInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonInfo {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub bot: NotionUser,
    pub users: Vec<NotionUser>,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    results: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct CreatedPage {
    id: String,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct NotionClient {
    client: Client,
    config: NotionConfig,
    customers: RefCell<HashMap<String, Option<String>>>,
}

impl NotionClient {
    pub fn new(config: &NotionConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(5)))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            customers: RefCell::new(HashMap::new()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{NOTION_API}{path}"))
            .bearer_auth(&self.config.api_key)
            .header("Notion-Version", NOTION_VERSION)
    }

    /// The integration's bot user and every user visible to it.
    pub fn whoami(&self) -> Result<Identity, SyncError> {
        let resp = self.request(Method::GET, "/users/me").send()?;
        let bot: NotionUser = check(resp, "Bot lookup")?.json()?;

        let mut users = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("page_size", PAGE_SIZE.to_string())];
            if let Some(cursor) = &cursor {
                query.push(("start_cursor", cursor.clone()));
            }
            let resp = self.request(Method::GET, "/users").query(&query).send()?;
            let page: ListResponse<NotionUser> = check(resp, "User list")?.json()?;
            users.extend(page.results);
            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }
        Ok(Identity { bot, users })
    }

    fn resolve_customer(&self, page: &mut NotionPage) {
        let relation_id = page
            .properties
            .get(&self.config.properties.customer)
            .and_then(|p| p.get("relation"))
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        page.customer = relation_id.and_then(|id| self.customer_name(&id));
    }

    fn customer_name(&self, page_id: &str) -> Option<String> {
        if let Some(cached) = self.customers.borrow().get(page_id) {
            return cached.clone();
        }
        let name = match self.get_page(page_id) {
            Ok(Some(page)) => title_of(&page),
            Ok(None) => None,
            Err(err) => {
                warn!(page = %page_id, error = %err, "failed to resolve customer name");
                return None;
            }
        };
        self.customers
            .borrow_mut()
            .insert(page_id.to_string(), name.clone());
        name
    }

    fn get_page(&self, page_id: &str) -> Result<Option<NotionPage>, SyncError> {
        let resp = self
            .request(Method::GET, &format!("/pages/{page_id}"))
            .send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let page: NotionPage = check(resp, "Page fetch")?.json()?;
        Ok(Some(page))
    }
}

impl RemoteTasks for NotionClient {
    fn query_assigned(&self) -> Result<Vec<NotionPage>, SyncError> {
        let path = format!("/databases/{}/query", self.config.database_id);
        let filter = query_filter(&self.config);
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = json!({ "filter": filter, "page_size": PAGE_SIZE });
            if let Some(cursor) = &cursor {
                body["start_cursor"] = json!(cursor);
            }
            let resp = self.request(Method::POST, &path).json(&body).send()?;
            let batch: ListResponse<NotionPage> = check(resp, "Database query")?.json()?;
            debug!(count = batch.results.len(), "fetched task page");
            pages.extend(batch.results);
            match batch.next_cursor {
                Some(next) if batch.has_more => cursor = Some(next),
                _ => break,
            }
        }

        for page in &mut pages {
            self.resolve_customer(page);
        }
        Ok(pages)
    }

    fn fetch_page(&self, page_id: &str) -> Result<Option<NotionPage>, SyncError> {
        let Some(mut page) = self.get_page(page_id)? else {
            return Ok(None);
        };
        if page.archived || page.in_trash {
            return Ok(None);
        }
        self.resolve_customer(&mut page);
        Ok(Some(page))
    }

    fn create_task(&self, draft: &RemoteDraft) -> Result<String, SyncError> {
        let body = create_payload(&self.config, draft);
        let resp = self.request(Method::POST, "/pages").json(&body).send()?;
        let created: CreatedPage = check(resp, "Task create")?.json()?;
        notion_id(&created.id).ok_or_else(|| SyncError::Http {
            status: 200,
            detail: format!("Task create returned an unexpected id {:?}", created.id),
        })
    }

    fn update_task(&self, page_id: &str, patch: &RemotePatch) -> Result<(), SyncError> {
        if patch.is_empty() {
            return Ok(());
        }
        let body = patch_payload(&self.config, patch);
        let resp = self
            .request(Method::PATCH, &format!("/pages/{page_id}"))
            .json(&body)
            .send()?;
        check(resp, "Task update")?;
        Ok(())
    }
}

fn check(resp: Response, what: &str) -> Result<Response, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(SyncError::Http {
        status: status.as_u16(),
        detail: format!("{what} failed: {}", format_api_error(&body)),
    })
}

fn format_api_error(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response".to_string();
    }
    match serde_json::from_str::<ApiErrorResponse>(trimmed) {
        Ok(ApiErrorResponse {
            code: Some(code),
            message: Some(message),
        }) => truncate_error(&format!("{message} ({code})")),
        Ok(ApiErrorResponse {
            message: Some(message),
            ..
        }) => truncate_error(&message),
        _ => truncate_error(trimmed),
    }
}

fn truncate_error(message: &str) -> String {
    let mut out = message.replace(['\n', '\r'], " ");
    if out.len() > 240 {
        let mut end = 240;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
        out.push_str("...");
    }
    out
}

fn title_of(page: &NotionPage) -> Option<String> {
    page.properties
        .values()
        .find(|p| p.get("type").and_then(Value::as_str) == Some("title"))
        .and_then(|p| p.get("title"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn query_filter(config: &NotionConfig) -> Value {
    let names = &config.properties;
    let mut conditions = vec![
        json!({ "property": names.assignee, "people": { "contains": config.user_id } }),
        json!({ "property": names.status, "status": { "does_not_equal": config.status.done } }),
        json!({ "property": names.status, "status": { "does_not_equal": config.status.canceled } }),
    ];
    let exclude = config.type_exclude.trim();
    if !exclude.is_empty() {
        conditions.push(
            json!({ "property": names.task_type, "select": { "does_not_equal": exclude } }),
        );
    }
    json!({ "and": conditions })
}

fn date_value(due: Option<NaiveDate>) -> Value {
    match due {
        Some(date) => json!({ "start": date.format("%Y-%m-%d").to_string() }),
        None => Value::Null,
    }
}

fn title_value(title: &str) -> Value {
    json!([{ "type": "text", "text": { "content": title } }])
}

fn create_payload(config: &NotionConfig, draft: &RemoteDraft) -> Value {
    let names = &config.properties;
    let mut properties = Map::new();
    properties.insert(names.title.clone(), json!({ "title": title_value(&draft.title) }));
    properties.insert(
        names.assignee.clone(),
        json!({ "people": [{ "id": config.user_id }] }),
    );
    properties.insert(
        names.status.clone(),
        json!({ "status": { "name": config.status.new } }),
    );
    if draft.due_date.is_some() {
        properties.insert(names.due_date.clone(), json!({ "date": date_value(draft.due_date) }));
    }
    json!({
        "parent": { "database_id": config.database_id },
        "properties": properties,
    })
}

fn patch_payload(config: &NotionConfig, patch: &RemotePatch) -> Value {
    let names = &config.properties;
    let mut properties = Map::new();
    if let Some(title) = &patch.title {
        properties.insert(names.title.clone(), json!({ "title": title_value(title) }));
    }
    if let Some(due) = patch.due_date {
        properties.insert(names.due_date.clone(), json!({ "date": date_value(due) }));
    }
    if let Some(status) = &patch.status {
        properties.insert(names.status.clone(), json!({ "status": { "name": status } }));
    }
    json!({ "properties": properties })
}
