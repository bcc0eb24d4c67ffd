use crate::config::Config;
use crate::error::SyncError;
use crate::integrations::notion::{RemoteDraft, RemotePatch, RemoteTasks};
use crate::integrations::reminders::{NewReminder, ReminderPatch, ReminderStore, ReminderStoreError};
use crate::normalize::compose_note;
use crate::pairing::{PROVISIONAL_PREFIX, PairEntry, PairingStore};
use crate::reconcile::{KeyPlan, Operation, PairChange, Plan};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct Failure {
    pub key: String,
    pub op: &'static str,
    pub error: String,
}

#[derive(Default, Debug)]
pub struct SyncReport {
    pub remote_created: usize,
    pub remote_updated: usize,
    pub remote_canceled: usize,
    pub local_created: usize,
    pub local_updated: usize,
    pub local_completed: usize,
    pub local_deleted: usize,
    pub local_linked: usize,
    pub pairs_saved: usize,
    pub pairs_removed: usize,
    pub skipped: usize,
    pub failures: Vec<Failure>,
    /// Set when the run stopped early; everything before it was applied.
    pub fatal: Option<SyncError>,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        format!(
            "Notion +{} ~{} x{} | Reminders +{} ~{} done {} -{} linked {} | Pairs ~{} -{} | Skipped {} | Failed {}",
            self.remote_created,
            self.remote_updated,
            self.remote_canceled,
            self.local_created,
            self.local_updated,
            self.local_completed,
            self.local_deleted,
            self.local_linked,
            self.pairs_saved,
            self.pairs_removed,
            self.skipped,
            self.failures.len()
        )
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Ids a key resolves to while its operations run.
struct Resolved {
    remote_id: Option<String>,
    local_id: Option<String>,
}

/// Applies `plan` key by key. A failed operation stops the rest of its key
/// and leaves that key's pair entry untouched, so the next run plans the same
/// work again. Only a fatal error stops the remaining keys.
pub fn execute(
    plan: &Plan,
    config: &Config,
    remote: &dyn RemoteTasks,
    local: &dyn ReminderStore,
    store: &mut PairingStore,
    now: DateTime<Utc>,
) -> SyncReport {
    let mut report = SyncReport {
        skipped: plan.skipped.len(),
        ..SyncReport::default()
    };

    for entry in &plan.entries {
        let mut resolved = Resolved {
            remote_id: (!entry.key.starts_with(PROVISIONAL_PREFIX)).then(|| entry.key.clone()),
            local_id: None,
        };

        let mut pair_allowed = true;
        for op in &entry.ops {
            info!(key = %entry.key, op = op.kind(), "{op}");
            let Err(err) = apply(op, config, remote, local, &mut resolved, &mut report) else {
                continue;
            };
            if err.is_fatal() {
                error!(key = %entry.key, op = op.kind(), error = %err, "stopping run");
                report.fatal = Some(err);
                return report;
            }
            warn!(key = %entry.key, op = op.kind(), error = %err, "operation failed");
            report.failures.push(Failure {
                key: entry.key.clone(),
                op: op.kind(),
                error: err.to_string(),
            });
            // The link trailer is not part of any fingerprint; the next run re-links.
            pair_allowed = matches!(op, Operation::LinkLocal { .. });
            break;
        }

        if pair_allowed {
            apply_pair_change(entry, &resolved, store, now, &mut report);
        }
    }

    for key in &plan.forget_retired {
        if store.forget_retired(key) {
            debug!(key = %key, "forgot retired task");
        }
    }
    report
}

fn apply(
    op: &Operation,
    config: &Config,
    remote: &dyn RemoteTasks,
    local: &dyn ReminderStore,
    resolved: &mut Resolved,
    report: &mut SyncReport,
) -> Result<(), SyncError> {
    match op {
        Operation::CreateLocal {
            title,
            due_date,
            note,
        } => {
            let id = local.create_reminder(
                &config.reminders.list_name,
                &NewReminder {
                    title: title.clone(),
                    notes: (!note.is_empty()).then(|| note.clone()),
                    due_date: *due_date,
                },
            )?;
            resolved.local_id = Some(id);
            report.local_created += 1;
        }
        Operation::CreateRemote { title, due_date } => {
            let id = remote.create_task(&RemoteDraft {
                title: title.clone(),
                due_date: *due_date,
            })?;
            resolved.remote_id = Some(id);
            report.remote_created += 1;
        }
        Operation::UpdateRemote { remote_id, patch } => {
            remote.update_task(remote_id, patch)?;
            report.remote_updated += 1;
        }
        Operation::UpdateLocal { local_id, patch } => {
            local.update_reminder(local_id, patch)?;
            report.local_updated += 1;
        }
        Operation::CompleteLocal { local_id } => {
            local.complete_reminder(local_id)?;
            report.local_completed += 1;
        }
        Operation::CancelRemote { remote_id, status } => {
            remote.update_task(
                remote_id,
                &RemotePatch {
                    status: Some(status.clone()),
                    ..RemotePatch::default()
                },
            )?;
            report.remote_canceled += 1;
        }
        Operation::DeleteLocal { local_id } => {
            match local.delete_reminder(local_id) {
                Ok(()) => {}
                Err(ReminderStoreError::NotFound) => {
                    debug!(local_id = %local_id, "reminder already gone");
                }
                Err(err) => return Err(err.into()),
            }
            report.local_deleted += 1;
        }
        Operation::LinkLocal {
            local_id,
            title,
            user_text,
            customer,
        } => {
            let remote_id = resolved.remote_id.as_deref().ok_or_else(|| {
                SyncError::Store(format!("no Notion task to link {local_id} to"))
            })?;
            let patch = link_patch(title, user_text, customer.as_deref(), remote_id);
            local.update_reminder(local_id, &patch)?;
            report.local_linked += 1;
        }
    }
    Ok(())
}

/// Reminder rewrite that drops the creation tag and points the note at `remote_id`.
pub fn link_patch(
    title: &str,
    user_text: &str,
    customer: Option<&str>,
    remote_id: &str,
) -> ReminderPatch {
    ReminderPatch {
        title: Some(title.to_string()),
        notes: Some(compose_note(user_text, customer, Some(remote_id))),
        due_date: None,
    }
}

fn apply_pair_change(
    entry: &KeyPlan,
    resolved: &Resolved,
    store: &mut PairingStore,
    now: DateTime<Utc>,
    report: &mut SyncReport,
) {
    match &entry.pair {
        PairChange::Keep => {}
        PairChange::Remove => {
            if store.remove(&entry.key).is_some() {
                report.pairs_removed += 1;
            }
        }
        PairChange::Retire => {
            if store.retire(&entry.key).is_some() {
                report.pairs_removed += 1;
            }
        }
        PairChange::Upsert(draft) => {
            let remote_id = draft.remote_id.clone().or_else(|| resolved.remote_id.clone());
            let local_id = draft.local_id.clone().or_else(|| resolved.local_id.clone());
            let (Some(remote_id), Some(local_id)) = (remote_id, local_id) else {
                warn!(key = %entry.key, "pair left unrecorded: missing id");
                report.failures.push(Failure {
                    key: entry.key.clone(),
                    op: "record_pair",
                    error: "missing remote or local id".to_string(),
                });
                return;
            };
            let pair = PairEntry {
                remote_id: remote_id.clone(),
                local_id,
                remote_fingerprint: draft.remote_fingerprint.clone(),
                local_fingerprint: draft.local_fingerprint.clone(),
                last_synced_at: now,
                customer: draft.customer.clone(),
            };
            match store.set(&remote_id, pair) {
                Ok(()) => {
                    if remote_id != entry.key {
                        store.remove(&entry.key);
                    }
                    report.pairs_saved += 1;
                }
                Err(conflict) => {
                    warn!(key = %entry.key, error = %conflict, "pair conflict");
                    report.failures.push(Failure {
                        key: entry.key.clone(),
                        op: "record_pair",
                        error: conflict.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::integrations::mock::{MockReminderStore, MockRemote, page, page_id};
    use crate::normalize::cross_reference_url;
    use crate::reconcile::PairDraft;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn draft(remote_id: Option<&str>, local_id: Option<&str>) -> PairDraft {
        PairDraft {
            remote_id: remote_id.map(str::to_string),
            local_id: local_id.map(str::to_string),
            remote_fingerprint: "rf".to_string(),
            local_fingerprint: "lf".to_string(),
            customer: None,
        }
    }

    fn plan(entries: Vec<KeyPlan>) -> Plan {
        Plan {
            entries,
            ..Plan::default()
        }
    }

    #[test]
    fn created_reminder_id_is_recorded_in_the_pair() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        let mut store = PairingStore::default();
        let key = page_id(1);

        let plan = plan(vec![KeyPlan {
            key: key.clone(),
            ops: vec![Operation::CreateLocal {
                title: "Call vendor".to_string(),
                due_date: None,
                note: compose_note("", None, Some(key.as_str())),
            }],
            pair: PairChange::Upsert(draft(Some(key.as_str()), None)),
        }]);
        let report = execute(&plan, &config, &remote, &local, &mut store, now());

        assert_eq!(report.local_created, 1);
        assert_eq!(report.pairs_saved, 1);
        let created = &local.all()[0];
        assert_eq!(created.notes.as_deref(), Some(cross_reference_url(&key).as_str()));
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.local_id, created.id);
        assert_eq!(entry.last_synced_at, now());
    }

    #[test]
    fn created_remote_task_rebinds_provisional_key_and_links_reminder() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        local.add("L1", "Call vendor #Notion", Some("bring contract"));
        let mut store = PairingStore::default();

        let plan = plan(vec![KeyPlan {
            key: "local:L1".to_string(),
            ops: vec![
                Operation::CreateRemote {
                    title: "Call vendor".to_string(),
                    due_date: None,
                },
                Operation::LinkLocal {
                    local_id: "L1".to_string(),
                    title: "Call vendor".to_string(),
                    user_text: "bring contract".to_string(),
                    customer: None,
                },
            ],
            pair: PairChange::Upsert(draft(None, Some("L1"))),
        }]);
        let report = execute(&plan, &config, &remote, &local, &mut store, now());

        assert_eq!(report.remote_created, 1);
        assert_eq!(report.local_linked, 1);
        let new_id = store.key_for_local("L1").unwrap().to_string();
        assert!(!new_id.starts_with(PROVISIONAL_PREFIX));
        assert!(store.get("local:L1").is_none());
        assert_eq!(remote.status(&new_id).as_deref(), Some("New"));

        let reminder = local.get("L1").unwrap();
        assert_eq!(reminder.title, "Call vendor");
        assert_eq!(
            reminder.notes.unwrap(),
            format!("bring contract\n{}", cross_reference_url(&new_id))
        );
    }

    #[test]
    fn failed_key_keeps_its_pair_while_other_keys_proceed() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        let (k1, k2) = (page_id(1), page_id(2));
        remote.insert(page(&k1, "One", "New", None));
        remote.insert(page(&k2, "Two", "New", None));
        remote.fail(&k1);

        let mut store = PairingStore::default();
        for (key, local_id) in [(&k1, "L1"), (&k2, "L2")] {
            store
                .set(
                    key,
                    PairEntry {
                        remote_id: key.clone(),
                        local_id: local_id.to_string(),
                        remote_fingerprint: "old".to_string(),
                        local_fingerprint: "old".to_string(),
                        last_synced_at: now(),
                        customer: None,
                    },
                )
                .unwrap();
        }
        let before = store.get(&k1).cloned();

        let update = |key: &String| KeyPlan {
            key: key.clone(),
            ops: vec![Operation::UpdateRemote {
                remote_id: key.clone(),
                patch: RemotePatch {
                    title: Some("Renamed".to_string()),
                    ..RemotePatch::default()
                },
            }],
            pair: PairChange::Upsert(draft(Some(key.as_str()), Some(if *key == k1 { "L1" } else { "L2" }))),
        };
        let plan = plan(vec![update(&k1), update(&k2)]);
        let report = execute(&plan, &config, &remote, &local, &mut store, now());

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, k1);
        assert_eq!(report.failures[0].op, "update_remote");
        assert!(report.fatal.is_none());
        assert_eq!(store.get(&k1).cloned(), before);
        assert_eq!(store.get(&k2).unwrap().remote_fingerprint, "rf");
        assert_eq!(remote.title(&k2).as_deref(), Some("Renamed"));
        assert_eq!(remote.title(&k1).as_deref(), Some("One"));
    }

    #[test]
    fn first_failure_stops_the_rest_of_the_key() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        local.add("L1", "Call vendor", None);
        local.fail("L1");
        let key = page_id(1);
        remote.insert(page(&key, "Call vendor", "Done", None));

        let plan = plan(vec![KeyPlan {
            key: key.clone(),
            ops: vec![
                Operation::UpdateLocal {
                    local_id: "L1".to_string(),
                    patch: ReminderPatch {
                        title: Some("x".to_string()),
                        ..ReminderPatch::default()
                    },
                },
                Operation::CompleteLocal {
                    local_id: "L1".to_string(),
                },
            ],
            pair: PairChange::Remove,
        }]);
        let mut store = PairingStore::default();
        store
            .set(
                &key,
                PairEntry {
                    remote_id: key.clone(),
                    local_id: "L1".to_string(),
                    remote_fingerprint: "r".to_string(),
                    local_fingerprint: "l".to_string(),
                    last_synced_at: now(),
                    customer: None,
                },
            )
            .unwrap();
        let report = execute(&plan, &config, &remote, &local, &mut store, now());

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.local_completed, 0);
        assert!(!local.get("L1").unwrap().completed);
        assert!(store.get(&key).is_some());
    }

    #[test]
    fn failed_link_still_records_the_new_pair() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        local.add("L1", "Call vendor #Notion", None);
        local.fail("L1");
        let mut store = PairingStore::default();

        let plan = plan(vec![KeyPlan {
            key: "local:L1".to_string(),
            ops: vec![
                Operation::CreateRemote {
                    title: "Call vendor".to_string(),
                    due_date: None,
                },
                Operation::LinkLocal {
                    local_id: "L1".to_string(),
                    title: "Call vendor".to_string(),
                    user_text: String::new(),
                    customer: None,
                },
            ],
            pair: PairChange::Upsert(draft(None, Some("L1"))),
        }]);
        let report = execute(&plan, &config, &remote, &local, &mut store, now());

        assert_eq!(report.remote_created, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].op, "link_local");
        assert!(store.key_for_local("L1").is_some());
    }

    #[test]
    fn permission_denied_stops_the_run_but_keeps_earlier_results() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        let (k1, k2) = (page_id(1), page_id(2));
        remote.insert(page(&k1, "One", "New", None));

        let mut store = PairingStore::default();
        store
            .set(
                &k2,
                PairEntry {
                    remote_id: k2.clone(),
                    local_id: "L2".to_string(),
                    remote_fingerprint: "r".to_string(),
                    local_fingerprint: "l".to_string(),
                    last_synced_at: now(),
                    customer: None,
                },
            )
            .unwrap();

        let plan = plan(vec![
            KeyPlan {
                key: k1.clone(),
                ops: vec![Operation::UpdateRemote {
                    remote_id: k1.clone(),
                    patch: RemotePatch {
                        title: Some("Renamed".to_string()),
                        ..RemotePatch::default()
                    },
                }],
                pair: PairChange::Upsert(draft(Some(k1.as_str()), Some("L1"))),
            },
            KeyPlan {
                key: k2.clone(),
                ops: vec![Operation::DeleteLocal {
                    local_id: "L2".to_string(),
                }],
                pair: PairChange::Remove,
            },
        ]);
        *local.denied.lock().unwrap() = true;
        let report = execute(&plan, &config, &remote, &local, &mut store, now());

        assert!(matches!(report.fatal, Some(SyncError::PermissionDenied(_))));
        assert_eq!(report.remote_updated, 1);
        assert!(store.get(&k1).is_some());
        assert!(store.get(&k2).is_some());
    }

    #[test]
    fn deleting_a_missing_reminder_counts_as_done() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        let key = page_id(1);
        let mut store = PairingStore::default();
        store
            .set(
                &key,
                PairEntry {
                    remote_id: key.clone(),
                    local_id: "gone".to_string(),
                    remote_fingerprint: "r".to_string(),
                    local_fingerprint: "l".to_string(),
                    last_synced_at: now(),
                    customer: None,
                },
            )
            .unwrap();

        let plan = plan(vec![KeyPlan {
            key: key.clone(),
            ops: vec![Operation::DeleteLocal {
                local_id: "gone".to_string(),
            }],
            pair: PairChange::Remove,
        }]);
        let report = execute(&plan, &config, &remote, &local, &mut store, now());
        assert!(!report.has_failures());
        assert_eq!(report.local_deleted, 1);
        assert_eq!(report.pairs_removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn finished_remote_retires_its_key_and_stale_retirements_are_dropped() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        let (k1, k2) = (page_id(1), page_id(2));
        remote.insert(page(&k1, "Call vendor", "New", None));
        let mut store = PairingStore::default();
        store.retire(&k2);

        let mut plan = plan(vec![KeyPlan {
            key: k1.clone(),
            ops: vec![Operation::UpdateRemote {
                remote_id: k1.clone(),
                patch: RemotePatch {
                    status: Some("Done".to_string()),
                    ..RemotePatch::default()
                },
            }],
            pair: PairChange::Retire,
        }]);
        plan.forget_retired.push(k2.clone());
        let report = execute(&plan, &config, &remote, &local, &mut store, now());

        assert!(!report.has_failures());
        assert_eq!(remote.status(&k1).as_deref(), Some("Done"));
        assert!(store.is_retired(&k1));
        assert!(!store.is_retired(&k2));
        assert!(store.is_empty());
    }

    #[test]
    fn recorded_pair_keeps_the_customer_written_into_the_note() {
        let config = test_config();
        let remote = MockRemote::new();
        let local = MockReminderStore::new();
        let key = page_id(1);
        let mut with_customer = draft(Some(key.as_str()), None);
        with_customer.customer = Some("Acme".to_string());

        let plan = plan(vec![KeyPlan {
            key: key.clone(),
            ops: vec![Operation::CreateLocal {
                title: "Call vendor".to_string(),
                due_date: None,
                note: compose_note("", Some("Acme"), Some(key.as_str())),
            }],
            pair: PairChange::Upsert(with_customer),
        }]);
        let mut store = PairingStore::default();
        execute(&plan, &config, &remote, &local, &mut store, now());

        assert_eq!(store.get(&key).unwrap().customer.as_deref(), Some("Acme"));
    }

    #[test]
    fn summary_lists_every_counter() {
        let report = SyncReport {
            remote_created: 1,
            local_completed: 2,
            skipped: 3,
            ..SyncReport::default()
        };
        assert_eq!(
            report.summary(),
            "Notion +1 ~0 x0 | Reminders +0 ~0 done 2 -0 linked 0 | Pairs ~0 -0 | Skipped 3 | Failed 0"
        );
    }
}
