use crate::config::Config;
use crate::error::SyncError;
use crate::executor::{SyncReport, execute, link_patch};
use crate::integrations::notion::{NotionPage, RemoteTasks};
use crate::integrations::reminders::{ReminderStore, ReminderStoreError};
use crate::models::TaskRecord;
use crate::normalize::{Excluded, Normalizer, normalize_title, notion_id, user_note};
use crate::pairing::{PROVISIONAL_PREFIX, PairingStore, StateLock};
use crate::reconcile::{Plan, Snapshot, reconcile};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Plan only: no writes to either side, state file untouched.
    DryRun,
    Apply,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub plan: Plan,
    /// `None` for dry runs.
    pub report: Option<SyncReport>,
}

pub fn run(
    config: &Config,
    remote: &dyn RemoteTasks,
    local: &dyn ReminderStore,
    mode: RunMode,
) -> Result<RunOutcome, SyncError> {
    let _lock = StateLock::acquire(&config.data.state_path)?;
    local.check_access()?;

    let mut store = PairingStore::load(&config.data.state_path)?;
    if store.is_empty() {
        info!("no sync state yet; pairing by cross-reference links only");
    }
    let snapshot = collect_snapshot(config, remote, local, &store)?;
    let plan = reconcile(&snapshot, &store, config);
    info!(
        keys = plan.entries.len(),
        pairs = store.len(),
        operations = plan.operation_count(),
        skipped = plan.skipped.len(),
        "planned sync"
    );
    for skip in &plan.skipped {
        warn!(key = %skip.key, reason = %skip.reason, "key skipped");
    }

    if mode == RunMode::DryRun {
        return Ok(RunOutcome { plan, report: None });
    }

    let mut report = execute(&plan, config, remote, local, &mut store, Utc::now());
    store.save(&config.data.state_path)?;
    if let Some(err) = report.fatal.take() {
        return Err(err);
    }
    info!(summary = %report.summary(), "sync finished");
    Ok(RunOutcome {
        plan,
        report: Some(report),
    })
}

fn collect_snapshot(
    config: &Config,
    remote: &dyn RemoteTasks,
    local: &dyn ReminderStore,
    store: &PairingStore,
) -> Result<Snapshot, SyncError> {
    let normalizer = Normalizer::new(config);
    let mut snapshot = Snapshot::default();

    let pages = remote.query_assigned()?;
    debug!(count = pages.len(), "fetched assigned tasks");
    for page in &pages {
        absorb_page(&normalizer, page, &mut snapshot);
    }

    // Paired tasks missing from the query were finished, reassigned or deleted.
    let missing: Vec<String> = store
        .keys()
        .filter(|key| !key.starts_with(PROVISIONAL_PREFIX))
        .filter(|key| !snapshot.remote.contains_key(*key) && !snapshot.unreachable.contains(*key))
        .map(str::to_string)
        .collect();
    for key in missing {
        match remote.fetch_page(&key) {
            Ok(Some(page)) => absorb_page(&normalizer, &page, &mut snapshot),
            Ok(None) => debug!(key = %key, "remote task no longer exists"),
            Err(err) => {
                warn!(key = %key, error = %err, "could not read remote task");
                snapshot.unreachable.insert(key);
            }
        }
    }

    let reminders = local.list_reminders(&config.reminders.list_name)?;
    debug!(count = reminders.len(), list = %config.reminders.list_name, "fetched reminders");
    snapshot.local = reminders.iter().map(|r| normalizer.local(r)).collect();
    Ok(snapshot)
}

fn absorb_page(normalizer: &Normalizer<'_>, page: &NotionPage, snapshot: &mut Snapshot) {
    match normalizer.remote(page) {
        Ok(record) => {
            snapshot.remote.insert(record.source_id.clone(), record);
        }
        Err(Excluded::OutOfScope(reason)) => {
            debug!(page = %page.id, reason = %reason, "task out of scope");
        }
        Err(Excluded::Malformed(reason)) => {
            warn!(page = %page.id, reason = %reason, "skipping malformed task");
            if let Some(id) = notion_id(&page.id) {
                snapshot.unreachable.insert(id);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFix {
    pub local_id: String,
    pub title: String,
    pub remote_id: String,
}

#[derive(Debug, Default)]
pub struct FixReport {
    pub linked: Vec<LinkFix>,
    pub unmatched: Vec<String>,
    pub failed: usize,
}

/// Links tagged reminders that carry no cross-reference yet to the open
/// Notion task with the same title. Ambiguous titles are left alone.
pub fn fix_urls(
    config: &Config,
    remote: &dyn RemoteTasks,
    local: &dyn ReminderStore,
    dry_run: bool,
) -> Result<FixReport, SyncError> {
    let _lock = StateLock::acquire(&config.data.state_path)?;
    local.check_access()?;
    let normalizer = Normalizer::new(config);
    let tag = normalizer.tag();

    let mut by_title: HashMap<String, Vec<TaskRecord>> = HashMap::new();
    for page in remote.query_assigned()? {
        if let Ok(record) = normalizer.remote(&page) {
            by_title
                .entry(normalize_title(&record.title, tag))
                .or_default()
                .push(record);
        }
    }

    let mut report = FixReport::default();
    let mut claimed: HashSet<String> = HashSet::new();
    for reminder in local.list_reminders(&config.reminders.list_name)? {
        let record = normalizer.local(&reminder);
        if !record.tagged || record.link.is_some() || record.completed {
            continue;
        }
        let task = match by_title.get(&normalize_title(&record.title, tag)).map(Vec::as_slice) {
            Some([task]) if !claimed.contains(&task.source_id) => task,
            Some([task]) => {
                warn!(reminder = %record.source_id, task = %task.source_id, "task already linked to another reminder");
                report.unmatched.push(record.title);
                continue;
            }
            Some([_, _, ..]) => {
                warn!(reminder = %record.source_id, title = %record.title, "title matches more than one task");
                report.unmatched.push(record.title);
                continue;
            }
            _ => {
                report.unmatched.push(record.title);
                continue;
            }
        };

        info!(reminder = %record.source_id, task = %task.source_id, "linking reminder");
        if !dry_run {
            let patch = link_patch(
                &record.title,
                &user_note(&record.note, None, tag),
                task.customer.as_deref(),
                &task.source_id,
            );
            match local.update_reminder(&record.source_id, &patch) {
                Ok(()) => {}
                Err(ReminderStoreError::PermissionDenied(msg)) => {
                    return Err(SyncError::PermissionDenied(msg));
                }
                Err(err) => {
                    warn!(reminder = %record.source_id, error = %err, "failed to link reminder");
                    report.failed += 1;
                    continue;
                }
            }
        }
        claimed.insert(task.source_id.clone());
        report.linked.push(LinkFix {
            local_id: record.source_id,
            title: record.title,
            remote_id: task.source_id.clone(),
        });
    }
    Ok(report)
}
