use crate::config::Config;
use crate::integrations::notion::NotionPage;
use crate::integrations::reminders::Reminder;
use crate::models::TaskRecord;
use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const CUSTOMER_PREFIX: &str = "Customer: ";
const UNTITLED: &str = "Untitled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Excluded {
    /// Legitimately not ours: treated as absent by the reconciler.
    OutOfScope(String),
    /// Shape we cannot trust: the record is skipped for this run.
    Malformed(String),
}

impl std::fmt::Display for Excluded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Excluded::OutOfScope(reason) => write!(f, "out of scope: {reason}"),
            Excluded::Malformed(reason) => write!(f, "malformed: {reason}"),
        }
    }
}

fn dashed_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b([0-9a-f]{8})-([0-9a-f]{4})-([0-9a-f]{4})-([0-9a-f]{4})-([0-9a-f]{12})\b")
            .unwrap()
    })
}

fn bare_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:^|[^0-9a-f])([0-9a-f]{32})(?:$|[^0-9a-f])").unwrap())
}

fn notion_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://(?:www\.)?notion\.so/[^\s<>)\]]+").unwrap())
}

/// Pulls a Notion page id out of a bare id, a dashed UUID or a page URL.
pub fn notion_id(text: &str) -> Option<String> {
    if let Some(caps) = dashed_id_regex().captures(text) {
        let joined: String = (1..=5).filter_map(|i| caps.get(i)).map(|m| m.as_str()).collect();
        return Some(joined.to_lowercase());
    }
    bare_id_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

pub fn cross_reference_url(remote_id: &str) -> String {
    format!("https://www.notion.so/{remote_id}")
}

/// Remote id referenced by the first Notion URL found in `text`.
pub fn extract_link(text: &str) -> Option<String> {
    notion_url_regex()
        .find_iter(text)
        .find_map(|m| notion_id(m.as_str()))
}

fn is_link_line(line: &str) -> bool {
    let trimmed = line.trim();
    notion_url_regex()
        .find(trimmed)
        .is_some_and(|m| m.start() == 0 && m.end() == trimmed.len())
        && notion_id(trimmed).is_some()
}

/// Lays out a managed note: user text, then the enrichment line, then the link.
pub fn compose_note(user_text: &str, customer: Option<&str>, remote_id: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let body = user_text.trim_end();
    if !body.trim().is_empty() {
        parts.push(body.to_string());
    }
    if let Some(customer) = customer.filter(|c| !c.trim().is_empty()) {
        parts.push(format!("{CUSTOMER_PREFIX}{}", customer.trim()));
    }
    if let Some(id) = remote_id {
        parts.push(cross_reference_url(id));
    }
    parts.join("\n")
}

/// Lines of `note` above the managed trailer. The link line is trailer when it
/// comes last; the line right above it is trailer when `is_customer` accepts it.
fn body_lines<'n>(note: &'n str, is_customer: impl Fn(&str) -> bool) -> Vec<&'n str> {
    let mut lines: Vec<&str> = note.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.last().is_some_and(|l| is_link_line(l)) {
        lines.pop();
        if lines.last().is_some_and(|l| is_customer(*l)) {
            lines.pop();
        }
    }
    lines
}

/// Inverse of [`compose_note`]: removes the managed trailer and the creation tag.
/// `customer` is the name the trailer was written with; a `Customer:` line
/// naming anyone else is user text.
pub fn user_note(note: &str, customer: Option<&str>, tag: &TagPattern) -> String {
    let written = customer
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| format!("{CUSTOMER_PREFIX}{c}"));
    let lines = body_lines(note, |line| written.as_deref() == Some(line.trim_end()));

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if tag.is_match(line) {
            let stripped = tag.strip(line);
            if stripped.is_empty() {
                continue;
            }
            out.push(stripped);
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n").trim_end().to_string()
}

/// Matcher for the creation tag, compiled once per run. Notion URLs are never
/// searched, since their host contains the bare word `notion`.
#[derive(Debug, Clone)]
pub struct TagPattern {
    regex: Regex,
}

impl TagPattern {
    pub fn new(tag: &str) -> Self {
        let trimmed = tag.trim();
        let word = regex::escape(trimmed.trim_start_matches('#'));
        let pattern = if trimmed.starts_with('#') {
            format!(r"(?i)#{word}\b")
        } else {
            format!(r"(?i)#?\b{word}\b")
        };
        // The word is escaped, so the pattern always compiles.
        let regex = Regex::new(&pattern).unwrap_or_else(|_| Regex::new(r"[^\s\S]").unwrap());
        Self { regex }
    }

    pub fn is_match(&self, text: &str) -> bool {
        notion_url_regex()
            .split(text)
            .any(|segment| self.regex.is_match(segment))
    }

    /// Removes every tag token outside Notion URLs and collapses the
    /// surrounding whitespace.
    pub fn strip(&self, text: &str) -> String {
        let mut replaced = String::with_capacity(text.len());
        let mut rest = 0;
        for url in notion_url_regex().find_iter(text) {
            replaced.push_str(&self.regex.replace_all(&text[rest..url.start()], " "));
            replaced.push_str(url.as_str());
            rest = url.end();
        }
        replaced.push_str(&self.regex.replace_all(&text[rest..], " "));
        replaced.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Title key used to pair reminders with tasks when no link exists.
pub fn normalize_title(text: &str, tag: &TagPattern) -> String {
    tag.strip(text).to_lowercase()
}

pub struct Normalizer<'a> {
    config: &'a Config,
    tag: TagPattern,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            tag: TagPattern::new(&config.reminders.tag),
        }
    }

    pub fn tag(&self) -> &TagPattern {
        &self.tag
    }

    pub fn remote(&self, page: &NotionPage) -> Result<TaskRecord, Excluded> {
        let names = &self.config.notion.properties;
        let statuses = &self.config.notion.status;

        let id = notion_id(&page.id)
            .ok_or_else(|| Excluded::Malformed(format!("page id {:?}", page.id)))?;
        if page.archived || page.in_trash {
            return Err(Excluded::OutOfScope("archived".to_string()));
        }

        let assignee = page.properties.get(&names.assignee).ok_or_else(|| {
            Excluded::Malformed(format!("missing property {:?}", names.assignee))
        })?;
        if !assigned_to(assignee, &self.config.notion.user_id) {
            return Err(Excluded::OutOfScope("not assigned to configured user".to_string()));
        }

        let exclude = self.config.notion.type_exclude.trim();
        if !exclude.is_empty()
            && let Some(kind) = page.properties.get(&names.task_type)
            && option_names(kind).iter().any(|name| name == exclude)
        {
            return Err(Excluded::OutOfScope(format!("type {exclude}")));
        }

        let title_items = page
            .properties
            .get(&names.title)
            .and_then(|p| p.get("title"))
            .and_then(Value::as_array)
            .ok_or_else(|| Excluded::Malformed(format!("missing title property {:?}", names.title)))?;
        let title = plain_text(title_items);
        let title = if title.is_empty() {
            UNTITLED.to_string()
        } else {
            title
        };

        let due_date = page
            .properties
            .get(&names.due_date)
            .and_then(|p| p.get("date"))
            .and_then(|d| d.get("start"))
            .and_then(Value::as_str)
            .and_then(parse_due);

        let status = page
            .properties
            .get(&names.status)
            .and_then(|p| p.get("status").or_else(|| p.get("select")))
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .unwrap_or(statuses.new.as_str());

        Ok(TaskRecord {
            title,
            due_date,
            completed: status == statuses.done,
            canceled: status == statuses.canceled,
            note: String::new(),
            link: Some(id.clone()),
            source_id: id,
            customer: page.customer.clone(),
            tagged: false,
        })
    }

    pub fn local(&self, reminder: &Reminder) -> TaskRecord {
        let notes = reminder.notes.clone().unwrap_or_default();
        TaskRecord {
            title: self.tag.strip(&reminder.title),
            due_date: reminder.due_date,
            completed: reminder.completed,
            canceled: false,
            link: extract_link(&notes),
            tagged: self.tag.is_match(&reminder.title)
                || body_lines(&notes, |l| l.starts_with(CUSTOMER_PREFIX))
                    .iter()
                    .any(|line| self.tag.is_match(line)),
            note: notes,
            source_id: reminder.id.clone(),
            customer: None,
        }
    }
}

fn assigned_to(assignee: &Value, user_id: &str) -> bool {
    let wanted = user_id.replace('-', "").to_lowercase();
    assignee
        .get("people")
        .and_then(Value::as_array)
        .is_some_and(|people| {
            people.iter().any(|person| {
                person
                    .get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.replace('-', "").to_lowercase() == wanted)
            })
        })
}

fn option_names(property: &Value) -> Vec<String> {
    let single = ["select", "status"]
        .iter()
        .filter_map(|kind| property.get(*kind))
        .filter_map(|v| v.get("name").and_then(Value::as_str))
        .map(str::to_string);
    let multi = property
        .get("multi_select")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|v| v.get("name").and_then(Value::as_str))
        .map(str::to_string);
    single.chain(multi).collect()
}

fn plain_text(items: &[Value]) -> String {
    items
        .iter()
        .filter_map(|item| item.get("plain_text").and_then(Value::as_str))
        .collect::<String>()
        .trim()
        .to_string()
}

fn parse_due(value: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.date_naive())
}
