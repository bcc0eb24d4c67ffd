//! Decides, per pairing key, which writes bring the two sides back in line.
//!
//! Every key is planned from its own remote record, local record and pair
//! entry only. When both sides changed since the last sync the local side wins
//! title, due date and completion, but a remote move into Done or Canceled is
//! still applied. The asymmetry is intentional.

use crate::config::Config;
use crate::integrations::notion::RemotePatch;
use crate::integrations::reminders::ReminderPatch;
use crate::models::TaskRecord;
use crate::normalize::{TagPattern, compose_note, user_note};
use crate::pairing::{PROVISIONAL_PREFIX, PairEntry, PairingStore, fingerprint_local, fingerprint_remote};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

const UNTITLED: &str = "Untitled";

/// Both sides as observed at the start of a run.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// In-scope remote records keyed by pairing key.
    pub remote: HashMap<String, TaskRecord>,
    pub local: Vec<TaskRecord>,
    /// Keys whose remote state could not be determined this run.
    pub unreachable: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateLocal {
        title: String,
        due_date: Option<NaiveDate>,
        note: String,
    },
    CreateRemote {
        title: String,
        due_date: Option<NaiveDate>,
    },
    UpdateRemote {
        remote_id: String,
        patch: RemotePatch,
    },
    UpdateLocal {
        local_id: String,
        patch: ReminderPatch,
    },
    CompleteLocal {
        local_id: String,
    },
    /// Remote counterpart of a deletion: the task is moved to the canceled status.
    CancelRemote {
        remote_id: String,
        status: String,
    },
    DeleteLocal {
        local_id: String,
    },
    /// Rewrites the reminder with the tag removed and the cross-reference
    /// trailer in its note. The remote id is the one the key resolves to at
    /// execution time.
    LinkLocal {
        local_id: String,
        title: String,
        user_text: String,
        customer: Option<String>,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateLocal { .. } => "create_local",
            Operation::CreateRemote { .. } => "create_remote",
            Operation::UpdateRemote { .. } => "update_remote",
            Operation::UpdateLocal { .. } => "update_local",
            Operation::CompleteLocal { .. } => "complete_local",
            Operation::CancelRemote { .. } => "cancel_remote",
            Operation::DeleteLocal { .. } => "delete_local",
            Operation::LinkLocal { .. } => "link_local",
        }
    }
}

fn show_due(due: Option<NaiveDate>) -> String {
    due.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn describe_fields(
    title: Option<&String>,
    due: Option<Option<NaiveDate>>,
    extra: Option<String>,
) -> String {
    let mut parts = Vec::new();
    if let Some(title) = title {
        parts.push(format!("title {title:?}"));
    }
    if let Some(due) = due {
        parts.push(format!("due {}", show_due(due)));
    }
    parts.extend(extra);
    parts.join(", ")
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateLocal {
                title, due_date, ..
            } => write!(f, "create reminder {title:?} (due {})", show_due(*due_date)),
            Operation::CreateRemote { title, due_date } => {
                write!(f, "create Notion task {title:?} (due {})", show_due(*due_date))
            }
            Operation::UpdateRemote { remote_id, patch } => write!(
                f,
                "update Notion task {remote_id}: {}",
                describe_fields(
                    patch.title.as_ref(),
                    patch.due_date,
                    patch.status.as_ref().map(|s| format!("status {s:?}")),
                )
            ),
            Operation::UpdateLocal { local_id, patch } => write!(
                f,
                "update reminder {local_id}: {}",
                describe_fields(
                    patch.title.as_ref(),
                    patch.due_date,
                    patch.notes.as_ref().map(|_| "note".to_string()),
                )
            ),
            Operation::CompleteLocal { local_id } => write!(f, "complete reminder {local_id}"),
            Operation::CancelRemote { remote_id, status } => {
                write!(f, "set Notion task {remote_id} to {status:?}")
            }
            Operation::DeleteLocal { local_id } => write!(f, "delete reminder {local_id}"),
            Operation::LinkLocal {
                local_id, title, ..
            } => write!(f, "link reminder {local_id} ({title:?})"),
        }
    }
}

/// Pair entry to store once every operation of the key succeeded. Ids are
/// `None` when the operation that creates them has not run yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairDraft {
    pub remote_id: Option<String>,
    pub local_id: Option<String>,
    pub remote_fingerprint: String,
    pub local_fingerprint: String,
    pub customer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairChange {
    Keep,
    Upsert(PairDraft),
    Remove,
    /// Removes the pair and records that it ended in completion.
    Retire,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPlan {
    pub key: String,
    pub ops: Vec<Operation>,
    pub pair: PairChange,
}

impl KeyPlan {
    fn new(key: &str, ops: Vec<Operation>, pair: PairChange) -> Self {
        Self {
            key: key.to_string(),
            ops,
            pair,
        }
    }

    fn keep(key: &str) -> Self {
        Self::new(key, Vec::new(), PairChange::Keep)
    }

    pub fn is_noop(&self) -> bool {
        self.ops.is_empty() && self.pair == PairChange::Keep
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skip {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub entries: Vec<KeyPlan>,
    pub skipped: Vec<Skip>,
    /// Retired keys no reminder links any more.
    pub forget_retired: Vec<String>,
}

impl Plan {
    pub fn operation_count(&self) -> usize {
        self.entries.iter().map(|e| e.ops.len()).sum()
    }

    #[cfg(test)]
    pub fn operations(&self) -> impl Iterator<Item = (&str, &Operation)> {
        self.entries
            .iter()
            .flat_map(|e| e.ops.iter().map(move |op| (e.key.as_str(), op)))
    }

    #[cfg(test)]
    pub fn entry(&self, key: &str) -> Option<&KeyPlan> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Human-readable listing used for dry runs.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for entry in &self.entries {
            for op in &entry.ops {
                lines.push(format!("[{}] {op}", entry.key));
            }
            match entry.pair {
                PairChange::Remove => lines.push(format!("[{}] forget pair", entry.key)),
                PairChange::Retire => lines.push(format!("[{}] retire pair", entry.key)),
                PairChange::Upsert(_) if entry.ops.is_empty() => {
                    lines.push(format!("[{}] record pair", entry.key))
                }
                _ => {}
            }
        }
        for key in &self.forget_retired {
            lines.push(format!("[{key}] forget retirement"));
        }
        for skip in &self.skipped {
            lines.push(format!("[{}] skipped: {}", skip.key, skip.reason));
        }
        lines
    }
}

/// Pure decision step: same inputs, same plan.
pub fn reconcile(snapshot: &Snapshot, store: &PairingStore, config: &Config) -> Plan {
    let tag = TagPattern::new(&config.reminders.tag);
    let planner = Planner {
        config,
        store,
        tag: &tag,
    };
    let mut plan = Plan::default();

    let (local_by_key, duplicates) = assign_local_keys(&snapshot.local, store);
    plan.skipped.extend(duplicates);

    let mut keys: BTreeSet<&str> = BTreeSet::new();
    keys.extend(snapshot.remote.keys().map(String::as_str));
    keys.extend(local_by_key.keys().map(String::as_str));
    keys.extend(store.keys());

    for key in keys {
        if snapshot.unreachable.contains(key) {
            plan.skipped.push(Skip {
                key: key.to_string(),
                reason: "remote task could not be read".to_string(),
            });
            continue;
        }
        let entry = planner.plan_key(
            key,
            snapshot.remote.get(key),
            local_by_key.get(key).copied(),
            store.get(key),
        );
        if !entry.is_noop() {
            plan.entries.push(entry);
        }
    }

    plan.forget_retired = store
        .retired()
        .filter(|key| !local_by_key.contains_key(*key))
        .map(str::to_string)
        .collect();
    plan
}

/// Maps each sync candidate reminder to a pairing key. A key claimed by more
/// than one reminder goes to the one the pair already knows, else the lowest id.
fn assign_local_keys<'a>(
    local: &'a [TaskRecord],
    store: &PairingStore,
) -> (BTreeMap<String, &'a TaskRecord>, Vec<Skip>) {
    let mut sorted: Vec<&TaskRecord> = local.iter().collect();
    sorted.sort_by(|a, b| a.source_id.cmp(&b.source_id));

    let mut claims: BTreeMap<String, Vec<&TaskRecord>> = BTreeMap::new();
    for record in sorted {
        let key = if let Some(key) = store.key_for_local(&record.source_id) {
            key.to_string()
        } else if let Some(link) = &record.link {
            link.clone()
        } else if record.tagged {
            format!("{PROVISIONAL_PREFIX}{}", record.source_id)
        } else {
            continue;
        };
        claims.entry(key).or_default().push(record);
    }

    let mut assigned = BTreeMap::new();
    let mut skipped = Vec::new();
    for (key, mut records) in claims {
        let bound = store.get(&key).map(|p| p.local_id.as_str());
        let winner = records
            .iter()
            .position(|r| Some(r.source_id.as_str()) == bound)
            .unwrap_or(0);
        let chosen = records.remove(winner);
        for loser in records {
            skipped.push(Skip {
                key: key.clone(),
                reason: format!(
                    "duplicate reminder {} also links this task; keeping {}",
                    loser.source_id, chosen.source_id
                ),
            });
        }
        assigned.insert(key, chosen);
    }
    (assigned, skipped)
}

struct Planner<'a> {
    config: &'a Config,
    store: &'a PairingStore,
    tag: &'a TagPattern,
}

impl Planner<'_> {
    fn plan_key(
        &self,
        key: &str,
        remote: Option<&TaskRecord>,
        local: Option<&TaskRecord>,
        pair: Option<&PairEntry>,
    ) -> KeyPlan {
        match (remote, local, pair) {
            (Some(remote), None, None) => self.create_local(key, remote),
            (None, Some(local), None) => self.create_remote(key, local),
            (Some(remote), Some(local), None) => self.adopt(key, remote, local),
            (Some(remote), None, Some(_)) => self.local_deleted(key, remote),
            (None, Some(local), Some(_)) => KeyPlan::new(
                key,
                vec![Operation::DeleteLocal {
                    local_id: local.source_id.clone(),
                }],
                PairChange::Remove,
            ),
            (None, None, Some(_)) => KeyPlan::new(key, Vec::new(), PairChange::Remove),
            (Some(remote), Some(local), Some(pair)) => self.diff(key, remote, local, pair),
            (None, None, None) => KeyPlan::keep(key),
        }
    }

    /// Title a reminder gets for a remote title: tag-free, whitespace collapsed.
    fn local_title(&self, remote_title: &str) -> String {
        let title = self.tag.strip(remote_title);
        if title.is_empty() {
            UNTITLED.to_string()
        } else {
            title
        }
    }

    /// `written` is the customer the current note trailer carries.
    fn link_op(
        &self,
        local: &TaskRecord,
        title: &str,
        written: Option<&str>,
        customer: Option<&String>,
    ) -> Operation {
        Operation::LinkLocal {
            local_id: local.source_id.clone(),
            title: title.to_string(),
            user_text: user_note(&local.note, written, self.tag),
            customer: customer.cloned(),
        }
    }

    fn create_local(&self, key: &str, remote: &TaskRecord) -> KeyPlan {
        if remote.is_terminal() {
            return KeyPlan::keep(key);
        }
        let title = self.local_title(&remote.title);
        let mut expected = remote.clone();
        expected.title = title.clone();
        expected.completed = false;
        expected.canceled = false;

        KeyPlan::new(
            key,
            vec![Operation::CreateLocal {
                title,
                due_date: remote.due_date,
                note: compose_note("", remote.customer.as_deref(), Some(key)),
            }],
            PairChange::Upsert(PairDraft {
                remote_id: Some(key.to_string()),
                local_id: None,
                remote_fingerprint: fingerprint_remote(remote),
                local_fingerprint: fingerprint_local(&expected),
                customer: remote.customer.clone(),
            }),
        )
    }

    fn create_remote(&self, key: &str, local: &TaskRecord) -> KeyPlan {
        if !key.starts_with(PROVISIONAL_PREFIX) || !local.tagged || local.completed {
            return KeyPlan::keep(key);
        }
        let mut expected_remote = local.clone();
        expected_remote.canceled = false;

        KeyPlan::new(
            key,
            vec![
                Operation::CreateRemote {
                    title: local.title.clone(),
                    due_date: local.due_date,
                },
                self.link_op(local, &local.title, None, None),
            ],
            PairChange::Upsert(PairDraft {
                remote_id: None,
                local_id: Some(local.source_id.clone()),
                remote_fingerprint: fingerprint_remote(&expected_remote),
                local_fingerprint: fingerprint_local(local),
                customer: None,
            }),
        )
    }

    /// Both sides exist but were never paired, e.g. after `fix-urls` or after
    /// the state file was lost.
    fn adopt(&self, key: &str, remote: &TaskRecord, local: &TaskRecord) -> KeyPlan {
        if remote.is_terminal() {
            return KeyPlan::keep(key);
        }
        if local.completed {
            return self.finish_remote(key);
        }
        let mut ops = Vec::new();
        let patch = fields_from_local(remote, local);
        let mut remote_after = remote.clone();
        remote_after.title = local.title.clone();
        remote_after.due_date = local.due_date;
        if !patch.is_empty() {
            ops.push(Operation::UpdateRemote {
                remote_id: key.to_string(),
                patch,
            });
        }
        if needs_link(key, local) {
            ops.push(self.link_op(
                local,
                &local.title,
                remote.customer.as_deref(),
                remote.customer.as_ref(),
            ));
        }
        KeyPlan::new(
            key,
            ops,
            PairChange::Upsert(PairDraft {
                remote_id: Some(key.to_string()),
                local_id: Some(local.source_id.clone()),
                remote_fingerprint: fingerprint_remote(&remote_after),
                local_fingerprint: fingerprint_local(local),
                customer: remote.customer.clone(),
            }),
        )
    }

    /// A completed reminder linking an open task it was never paired with.
    /// The task is finished, unless this key retired before: then the task
    /// was reopened in Notion after the reminder was completed.
    fn finish_remote(&self, key: &str) -> KeyPlan {
        if self.store.is_retired(key) {
            return KeyPlan::keep(key);
        }
        KeyPlan::new(
            key,
            vec![Operation::UpdateRemote {
                remote_id: key.to_string(),
                patch: RemotePatch {
                    status: Some(self.config.notion.status.done.clone()),
                    ..RemotePatch::default()
                },
            }],
            PairChange::Retire,
        )
    }

    fn local_deleted(&self, key: &str, remote: &TaskRecord) -> KeyPlan {
        if remote.is_terminal() {
            return KeyPlan::new(key, Vec::new(), PairChange::Remove);
        }
        KeyPlan::new(
            key,
            vec![Operation::CancelRemote {
                remote_id: key.to_string(),
                status: self.config.notion.status.canceled.clone(),
            }],
            PairChange::Remove,
        )
    }

    fn diff(&self, key: &str, remote: &TaskRecord, local: &TaskRecord, pair: &PairEntry) -> KeyPlan {
        let remote_changed = fingerprint_remote(remote) != pair.remote_fingerprint;
        let local_changed = fingerprint_local(local) != pair.local_fingerprint;

        if remote_changed && remote.canceled {
            return KeyPlan::new(
                key,
                vec![Operation::DeleteLocal {
                    local_id: local.source_id.clone(),
                }],
                PairChange::Remove,
            );
        }

        let mut ops = Vec::new();
        let mut remote_after = remote.clone();
        let mut local_after = local.clone();
        let written = written_customer(pair, remote);
        let mut customer_after = pair.customer.clone();

        if local_changed {
            let mut patch = fields_from_local(remote, local);
            remote_after.title = local.title.clone();
            remote_after.due_date = local.due_date;
            if local.completed && !remote.is_terminal() {
                patch.status = Some(self.config.notion.status.done.clone());
                remote_after.completed = true;
            }
            if !patch.is_empty() {
                ops.push(Operation::UpdateRemote {
                    remote_id: key.to_string(),
                    patch,
                });
            }
        } else if remote_changed {
            let mut patch = ReminderPatch::default();
            let title = self.local_title(&remote.title);
            if title != local.title {
                patch.title = Some(title.clone());
                local_after.title = title;
            }
            if remote.due_date != local.due_date {
                patch.due_date = Some(remote.due_date);
                local_after.due_date = remote.due_date;
            }
            let note = compose_note(
                &user_note(&local.note, written, self.tag),
                remote.customer.as_deref(),
                Some(key),
            );
            if note != local.note {
                patch.notes = Some(note);
            }
            customer_after = remote.customer.clone();
            if !patch.is_empty() {
                ops.push(Operation::UpdateLocal {
                    local_id: local.source_id.clone(),
                    patch,
                });
            }
        }

        if remote_changed && remote.completed && !local_after.completed {
            ops.push(Operation::CompleteLocal {
                local_id: local.source_id.clone(),
            });
            local_after.completed = true;
        }

        let retired = local_after.completed && remote_after.is_terminal();
        if !retired && needs_link(key, local) {
            ops.push(self.link_op(
                local,
                &local_after.title,
                written,
                remote.customer.as_ref(),
            ));
            customer_after = remote.customer.clone();
        }

        let pair_change = if retired {
            PairChange::Retire
        } else if !ops.is_empty()
            || remote_changed
            || local_changed
            || pair.local_id != local.source_id
        {
            PairChange::Upsert(PairDraft {
                remote_id: Some(key.to_string()),
                local_id: Some(local.source_id.clone()),
                remote_fingerprint: fingerprint_remote(&remote_after),
                local_fingerprint: fingerprint_local(&local_after),
                customer: customer_after,
            })
        } else {
            PairChange::Keep
        };
        KeyPlan::new(key, ops, pair_change)
    }
}

/// Customer the note trailer was last written with. An entry that never
/// recorded one falls back to the task's current customer.
fn written_customer<'r>(pair: &'r PairEntry, remote: &'r TaskRecord) -> Option<&'r str> {
    pair.customer.as_deref().or(remote.customer.as_deref())
}

fn needs_link(key: &str, local: &TaskRecord) -> bool {
    local.link.as_deref() != Some(key) || local.tagged
}

/// Title and due date the remote side must take over from the local side.
fn fields_from_local(remote: &TaskRecord, local: &TaskRecord) -> RemotePatch {
    RemotePatch {
        title: (local.title != remote.title).then(|| local.title.clone()),
        due_date: (local.due_date != remote.due_date).then_some(local.due_date),
        status: None,
    }
}
