//! Whitelist access control over the durable store.
//!
//! Membership checks go straight to the store. When the store fails, the
//! decision falls back to the last good [`WhitelistSnapshot`] (fail-open) or
//! denies (fail-closed), depending on [`FailMode`]. A background refresh keeps
//! the snapshot current and first reconciles the store against the backup
//! file, only ever adding members to the store.

use crate::{
    backup::BackupFile,
    store::{Store, StoreError, WHITELIST_SET_KEY},
};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeSet, HashSet},
    str::FromStr,
    sync::{Arc, Mutex, RwLock},
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Open,
    Closed,
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    ColdStart,
    Steady,
    Degraded,
}

/// Immutable membership copy; replaced wholesale, never edited in place.
#[derive(Debug, Clone, Default)]
pub struct WhitelistSnapshot {
    pub members: HashSet<u64>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl WhitelistSnapshot {
    pub fn contains(&self, principal: u64) -> bool {
        self.members.contains(&principal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Replaced { members: usize, reconciled: usize },
    RetainedEmptyPull { retained: usize },
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum MembershipChange {
    Add(u64),
    Remove(u64),
}

pub struct AccessGate {
    store: Arc<dyn Store>,
    backup: BackupFile,
    admins: HashSet<u64>,
    fail_mode: FailMode,
    snapshot: RwLock<Arc<WhitelistSnapshot>>,
    state: Mutex<GateState>,
    backup_writer: tokio::sync::Mutex<()>,
    backup_tasks: tokio::sync::Mutex<JoinSet<()>>,
    /// Denied members the backup file may still list. Reconcile skips them
    /// until a rewrite without them has been saved.
    pending_removals: Mutex<HashSet<u64>>,
}

impl AccessGate {
    pub fn new(
        store: Arc<dyn Store>,
        backup: BackupFile,
        admins: HashSet<u64>,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            store,
            backup,
            admins,
            fail_mode,
            snapshot: RwLock::new(Arc::new(WhitelistSnapshot::default())),
            state: Mutex::new(GateState::ColdStart),
            backup_writer: tokio::sync::Mutex::new(()),
            backup_tasks: tokio::sync::Mutex::new(JoinSet::new()),
            pending_removals: Mutex::new(HashSet::new()),
        }
    }

    /// Seeds the fallback snapshot from the backup file before the first refresh.
    pub async fn bootstrap(&self) {
        let ids = self.backup.load().await;
        if ids.is_empty() {
            return;
        }
        info!(
            target = "listing_bot.access",
            members = ids.len(),
            path = %self.backup.path().display(),
            "snapshot_seeded_from_backup"
        );
        self.replace_snapshot(WhitelistSnapshot {
            members: ids.into_iter().collect(),
            refreshed_at: None,
        });
    }

    pub fn is_admin(&self, principal: u64) -> bool {
        self.admins.contains(&principal)
    }

    pub fn state(&self) -> GateState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Arc<WhitelistSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn is_allowed(&self, principal: u64) -> bool {
        if self.is_admin(principal) {
            return true;
        }
        match self
            .store
            .set_contains(WHITELIST_SET_KEY, &principal.to_string())
            .await
        {
            Ok(member) => {
                self.mark_healthy();
                member
            }
            Err(err) => {
                self.mark_degraded(&err);
                match self.fail_mode {
                    FailMode::Open => {
                        let snapshot = self.snapshot();
                        let allowed = snapshot.contains(principal);
                        debug!(
                            target = "listing_bot.access",
                            principal,
                            allowed,
                            refreshed_at = ?snapshot.refreshed_at,
                            "decided_from_snapshot"
                        );
                        allowed
                    }
                    FailMode::Closed => false,
                }
            }
        }
    }

    /// Adds backup members missing from the store. Never removes anything,
    /// and never restores a member whose removal the backup has not caught up with.
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        let _writer = self.backup_writer.lock().await;
        let backup = self.backup.load().await;
        if backup.is_empty() {
            return Ok(0);
        }
        let live: HashSet<String> = self
            .store
            .set_members(WHITELIST_SET_KEY)
            .await?
            .into_iter()
            .collect();
        let pending = self.pending_removals();
        let missing: Vec<String> = backup
            .iter()
            .filter(|id| !pending.contains(id))
            .map(u64::to_string)
            .filter(|id| !live.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        self.store.set_add(WHITELIST_SET_KEY, &missing).await?;
        info!(target = "listing_bot.access", restored = missing.len(), "whitelist_restored_from_backup");
        Ok(missing.len())
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        let reconciled = match self.reconcile().await {
            Ok(count) => count,
            Err(err) => {
                self.mark_degraded(&err);
                return RefreshOutcome::Failed;
            }
        };

        let pulled = match self.store.set_members(WHITELIST_SET_KEY).await {
            Ok(members) => members,
            Err(err) => {
                self.mark_degraded(&err);
                return RefreshOutcome::Failed;
            }
        };

        let members = parse_members(pulled);
        if members.is_empty() {
            let retained = self.snapshot().members.len();
            warn!(target = "listing_bot.access", retained, "empty_membership_pull_discarded");
            self.mark_refreshed();
            return RefreshOutcome::RetainedEmptyPull { retained };
        }

        let count = members.len();
        self.replace_snapshot(WhitelistSnapshot {
            members,
            refreshed_at: Some(Utc::now()),
        });
        self.mark_refreshed();
        debug!(target = "listing_bot.access", members = count, reconciled, "snapshot_refreshed");
        RefreshOutcome::Replaced {
            members: count,
            reconciled,
        }
    }

    pub async fn allow(self: &Arc<Self>, principal: u64) -> Result<(), StoreError> {
        self.lock_pending().remove(&principal);
        self.store
            .set_add(WHITELIST_SET_KEY, &[principal.to_string()])
            .await?;
        self.apply_locally(MembershipChange::Add(principal));
        self.schedule_backup(MembershipChange::Add(principal)).await;
        info!(target = "listing_bot.access", principal, "whitelist_add");
        Ok(())
    }

    pub async fn deny(self: &Arc<Self>, principal: u64) -> Result<(), StoreError> {
        self.lock_pending().insert(principal);
        if let Err(err) = self
            .store
            .set_remove(WHITELIST_SET_KEY, &principal.to_string())
            .await
        {
            self.lock_pending().remove(&principal);
            return Err(err);
        }
        self.apply_locally(MembershipChange::Remove(principal));
        self.schedule_backup(MembershipChange::Remove(principal)).await;
        info!(target = "listing_bot.access", principal, "whitelist_remove");
        Ok(())
    }

    pub async fn members(&self) -> Result<BTreeSet<u64>, StoreError> {
        let pulled = self.store.set_members(WHITELIST_SET_KEY).await?;
        Ok(parse_members(pulled).into_iter().collect())
    }

    /// Waits for every scheduled backup rewrite to finish.
    pub async fn flush_backups(&self) {
        let mut tasks = std::mem::take(&mut *self.backup_tasks.lock().await);
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(target = "listing_bot.backup", error = %err, "backup_task_panicked");
            }
        }
    }

    async fn schedule_backup(self: &Arc<Self>, change: MembershipChange) {
        let gate = self.clone();
        let mut tasks = self.backup_tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move { gate.rewrite_backup(change).await });
    }

    async fn rewrite_backup(&self, change: MembershipChange) {
        let _writer = self.backup_writer.lock().await;
        let mut merged = self.backup.load().await;
        match self.store.set_members(WHITELIST_SET_KEY).await {
            Ok(live) => merged.extend(parse_members(live)),
            Err(err) => {
                warn!(target = "listing_bot.backup", error = %err, "store_unavailable_merging_snapshot");
                merged.extend(self.snapshot().members.iter().copied());
            }
        }
        // additions are already visible through the store or the snapshot
        if let MembershipChange::Remove(id) = change {
            merged.remove(&id);
        }
        let pending = self.pending_removals();
        merged.retain(|id| !pending.contains(id));
        match self.backup.save(&merged).await {
            Ok(()) => {
                if let MembershipChange::Remove(id) = change {
                    self.lock_pending().remove(&id);
                }
                debug!(target = "listing_bot.backup", members = merged.len(), "backup_written");
            }
            Err(err) => warn!(target = "listing_bot.backup", error = %err, "backup_write_failed"),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.pending_removals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending_removals(&self) -> HashSet<u64> {
        self.lock_pending().clone()
    }

    fn apply_locally(&self, change: MembershipChange) {
        let current = self.snapshot();
        let mut next = (*current).clone();
        match change {
            MembershipChange::Add(id) => {
                next.members.insert(id);
            }
            MembershipChange::Remove(id) => {
                next.members.remove(&id);
            }
        }
        self.replace_snapshot(next);
    }

    fn replace_snapshot(&self, next: WhitelistSnapshot) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(next);
    }

    fn mark_healthy(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == GateState::Degraded {
            info!(target = "listing_bot.access", "store_recovered");
            *state = GateState::Steady;
        }
    }

    fn mark_refreshed(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != GateState::Steady {
            info!(target = "listing_bot.access", from = ?*state, "gate_steady");
        }
        *state = GateState::Steady;
    }

    fn mark_degraded(&self, err: &StoreError) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != GateState::Degraded {
            warn!(target = "listing_bot.access", error = %err, fail_mode = ?self.fail_mode, "store_degraded");
        }
        *state = GateState::Degraded;
    }
}

fn parse_members(raw: Vec<String>) -> HashSet<u64> {
    raw.into_iter()
        .filter_map(|value| match value.trim().parse::<u64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(target = "listing_bot.access", value = %value, "non_numeric_whitelist_member_skipped");
                None
            }
        })
        .collect()
}
