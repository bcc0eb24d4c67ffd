use crate::error::SyncError;
use crate::normalize::notion_id;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "meghendra", "notion-reminders-sync")
}

fn default_data_dir() -> PathBuf {
    if let Some(path) = std::env::var_os("NRS_DATA_DIR") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.data_dir().to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".notion-reminders-sync")
}

fn default_state_path() -> PathBuf {
    default_data_dir().join("sync_state.json")
}

pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("NRS_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.config_dir().join("config.toml");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".notion-reminders-sync.toml")
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub notion: NotionConfig,
    pub reminders: RemindersConfig,
    pub data: DataConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotionConfig {
    pub api_key: String,
    pub database_id: String,
    pub user_id: String,
    /// Tasks whose type equals this value are never synced. Empty disables the filter.
    pub type_exclude: String,
    pub timeout_seconds: u64,
    pub properties: PropertyNames,
    pub status: StatusValues,
}

impl Default for NotionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            database_id: String::new(),
            user_id: String::new(),
            type_exclude: "Onboarding".to_string(),
            timeout_seconds: 30,
            properties: PropertyNames::default(),
            status: StatusValues::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PropertyNames {
    pub title: String,
    pub assignee: String,
    pub status: String,
    pub due_date: String,
    pub customer: String,
    #[serde(rename = "type")]
    pub task_type: String,
}

impl Default for PropertyNames {
    fn default() -> Self {
        Self {
            title: "Request".to_string(),
            assignee: "Assignee".to_string(),
            status: "Status".to_string(),
            due_date: "Due date".to_string(),
            customer: "Customer".to_string(),
            task_type: "Type".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StatusValues {
    pub done: String,
    pub canceled: String,
    pub new: String,
}

impl Default for StatusValues {
    fn default() -> Self {
        Self {
            done: "Done".to_string(),
            canceled: "Canceled".to_string(),
            new: "New".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RemindersConfig {
    pub list_name: String,
    pub tag: String,
}

impl Default for RemindersConfig {
    fn default() -> Self {
        Self {
            list_name: "Work".to_string(),
            tag: "#Notion".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DataConfig {
    pub state_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: Option<PathBuf>,
}

impl Config {
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, SyncError> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(config_path);

        let mut config = match fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content)
                .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound && explicit_path.is_none() => {
                Config::default()
            }
            Err(err) => {
                return Err(SyncError::Config(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.normalize();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Config>(content)
    }

    /// Environment variables take precedence over the file. Names match the
    /// keys documented for the `.env`/`config.json` era of the tool.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *target = value.trim().to_string();
            }
        };

        set(&mut self.notion.api_key, "NOTION_API_KEY");
        set(&mut self.notion.database_id, "NOTION_DATABASE_ID");
        set(&mut self.notion.user_id, "NOTION_USER_ID");
        set(&mut self.reminders.list_name, "REMINDERS_LIST_NAME");
        set(&mut self.reminders.tag, "NOTION_TAG");
        set(&mut self.notion.properties.title, "PROP_TITLE");
        set(&mut self.notion.properties.assignee, "PROP_ASSIGNEE");
        set(&mut self.notion.properties.status, "PROP_STATUS");
        set(&mut self.notion.properties.due_date, "PROP_DUE_DATE");
        set(&mut self.notion.properties.customer, "PROP_CUSTOMER");
        set(&mut self.notion.properties.task_type, "PROP_TYPE");
        set(&mut self.notion.status.done, "STATUS_DONE");
        set(&mut self.notion.status.canceled, "STATUS_CANCELED");
        set(&mut self.notion.status.new, "STATUS_NEW");
        set(&mut self.notion.type_exclude, "TYPE_EXCLUDE");
    }

    fn normalize(&mut self) {
        if self.data.state_path.as_os_str().is_empty() {
            self.data.state_path = default_state_path();
        }
        if self.data.state_path.is_relative() {
            self.data.state_path = default_data_dir().join(&self.data.state_path);
        }
        if let Some(id) = notion_id(&self.notion.database_id) {
            self.notion.database_id = id;
        }
        self.notion.api_key = self.notion.api_key.trim().to_string();
        self.notion.user_id = self.notion.user_id.trim().to_string();
    }

    pub fn validate_credentials(&self) -> Result<(), SyncError> {
        if self.notion.api_key.is_empty() {
            return Err(SyncError::MissingConfig(vec!["NOTION_API_KEY"]));
        }
        if self.notion.api_key.chars().any(char::is_whitespace) {
            return Err(SyncError::Config(
                "NOTION_API_KEY must not contain whitespace".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_for_sync(&self) -> Result<(), SyncError> {
        let missing: Vec<&'static str> = [
            ("NOTION_API_KEY", self.notion.api_key.is_empty()),
            ("NOTION_DATABASE_ID", self.notion.database_id.is_empty()),
            ("NOTION_USER_ID", self.notion.user_id.is_empty()),
        ]
        .into_iter()
        .filter(|(_, empty)| *empty)
        .map(|(key, _)| key)
        .collect();
        if !missing.is_empty() {
            return Err(SyncError::MissingConfig(missing));
        }

        self.validate_credentials()?;

        if notion_id(&self.notion.database_id).as_deref() != Some(self.notion.database_id.as_str())
        {
            return Err(SyncError::Config(format!(
                "NOTION_DATABASE_ID is not a Notion id: {}",
                self.notion.database_id
            )));
        }
        if self.reminders.tag.trim().trim_start_matches('#').is_empty() {
            return Err(SyncError::Config("NOTION_TAG must not be empty".to_string()));
        }
        if self.reminders.list_name.trim().is_empty() {
            return Err(SyncError::Config(
                "REMINDERS_LIST_NAME must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.notion.api_key = "secret_test".to_string();
    config.notion.database_id = "0123456789abcdef0123456789abcdef".to_string();
    config.notion.user_id = "user-1".to_string();
    config
}
