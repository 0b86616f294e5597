//! RBAC policy engine: role inheritance graph plus an allow-only grant relation.
//!
//! The engine keeps the whole policy in memory and answers every check from
//! there. Durable storage sits behind [`PolicyAdapter`]; mutations become
//! durable only once [`PolicyEngine::save_policy`] has been called.
//!
//! ## Concurrency
//!
//! - Checks take a shared read lock and never block each other.
//! - Every mutation, including the delete-then-insert of
//!   [`PolicyEngine::set_permissions`], runs inside a single write critical
//!   section, so concurrent replacements of the same subject are linearizable:
//!   the final grant set is always exactly one caller's list.
//! - Every mutation bumps a revision and is kept until it has been saved.
//!   Saves are serialized and compare-and-swap against the stored revision;
//!   a lost race reloads the stored policy and replays the unsaved changes,
//!   so engines sharing one store never overwrite each other.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use leash_core::{ApiKey, User};

use crate::{Permission, Role, Subject};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("role edge {parent} <- {child} would create an inheritance cycle")]
    Cycle { parent: Role, child: Role },

    #[error("policy storage failure: {0}")]
    Storage(String),

    #[error("stored policy is corrupt: {0}")]
    Corrupt(String),

    #[error("stored policy kept changing; changes not saved")]
    Stale,
}

/// A single allow grant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Grant {
    pub subject: Subject,
    pub permission: Permission,
}

/// `parent` includes every grant reachable from `child`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleEdge {
    pub parent: Role,
    pub child: Role,
}

/// Point-in-time copy of the full policy, as handed to a [`PolicyAdapter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub revision: u64,
    pub grants: Vec<Grant>,
    pub edges: Vec<RoleEdge>,
}

/// Durable storage for the policy.
#[async_trait]
pub trait PolicyAdapter: Send + Sync {
    async fn load_policy(&self) -> Result<PolicySnapshot, PolicyError>;

    /// Persist `snapshot`, replacing what is stored, if and only if the
    /// stored revision is still `expected_revision` (0 when nothing is stored).
    ///
    /// Returns `Ok(false)` without writing when it is not.
    async fn save_policy(&self, snapshot: &PolicySnapshot, expected_revision: u64) -> Result<bool, PolicyError>;
}

/// Retries of [`PolicyEngine::save_policy`] after losing a race.
const SAVE_ATTEMPTS: usize = 3;

/// One mutation, kept until it is durable so it can be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PolicyChange {
    SetPermissions {
        subject: Subject,
        permissions: BTreeSet<Permission>,
    },
    AddInheritance {
        parent: Role,
        child: Role,
    },
    RemoveInheritance {
        parent: Role,
        child: Role,
    },
    RemoveSubject(Subject),
}

#[derive(Debug, Default)]
struct PolicyModel {
    grants: HashMap<Subject, BTreeSet<Permission>>,
    children: HashMap<Role, BTreeSet<Role>>,
    revision: u64,
    /// Changes not yet saved, tagged with the revision they produced.
    unsaved: Vec<(u64, PolicyChange)>,
}

impl PolicyModel {
    fn from_snapshot(snapshot: PolicySnapshot) -> Result<Self, PolicyError> {
        let mut model = PolicyModel {
            revision: snapshot.revision,
            ..Default::default()
        };
        for grant in snapshot.grants {
            model.grants.entry(grant.subject).or_default().insert(grant.permission);
        }
        for edge in snapshot.edges {
            if model.reaches(&edge.child, &edge.parent) {
                return Err(PolicyError::Corrupt(format!(
                    "inheritance cycle through {} and {}",
                    edge.parent, edge.child
                )));
            }
            model.children.entry(edge.parent).or_default().insert(edge.child);
        }
        Ok(model)
    }

    fn snapshot(&self) -> PolicySnapshot {
        let mut grants: Vec<Grant> = self
            .grants
            .iter()
            .flat_map(|(subject, perms)| {
                perms.iter().map(move |p| Grant {
                    subject: subject.clone(),
                    permission: p.clone(),
                })
            })
            .collect();
        grants.sort();

        let mut edges: Vec<RoleEdge> = self
            .children
            .iter()
            .flat_map(|(parent, children)| {
                children.iter().map(move |c| RoleEdge {
                    parent: parent.clone(),
                    child: c.clone(),
                })
            })
            .collect();
        edges.sort();

        PolicySnapshot {
            revision: self.revision,
            grants,
            edges,
        }
    }

    /// Breadth-first closure over inheritance edges, including `role` itself.
    fn reachable(&self, role: &Role) -> BTreeSet<Role> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([role.clone()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                queue.extend(children.iter().filter(|c| !seen.contains(*c)).cloned());
            }
        }
        seen
    }

    fn record(&mut self, change: PolicyChange) {
        self.revision += 1;
        self.unsaved.push((self.revision, change));
    }

    /// Re-run a recorded change; `Ok(false)` when it no longer changes anything.
    fn apply(&mut self, change: &PolicyChange) -> Result<bool, PolicyError> {
        match change {
            PolicyChange::SetPermissions { subject, permissions } => {
                self.set_grants(subject, permissions.clone());
                Ok(true)
            }
            PolicyChange::AddInheritance { parent, child } => self.add_edge(parent, child),
            PolicyChange::RemoveInheritance { parent, child } => Ok(self.remove_edge(parent, child)),
            PolicyChange::RemoveSubject(subject) => Ok(self.remove_subject(subject)),
        }
    }

    fn set_grants(&mut self, subject: &Subject, permissions: BTreeSet<Permission>) {
        if permissions.is_empty() {
            self.grants.remove(subject);
        } else {
            self.grants.insert(subject.clone(), permissions);
        }
    }

    fn add_edge(&mut self, parent: &Role, child: &Role) -> Result<bool, PolicyError> {
        if parent == child || self.reaches(child, parent) {
            return Err(PolicyError::Cycle {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        Ok(self.children.entry(parent.clone()).or_default().insert(child.clone()))
    }

    fn remove_edge(&mut self, parent: &Role, child: &Role) -> bool {
        let removed = self
            .children
            .get_mut(parent)
            .is_some_and(|children| children.remove(child));
        self.children.retain(|_, children| !children.is_empty());
        removed
    }

    fn remove_subject(&mut self, subject: &Subject) -> bool {
        let mut removed = self.grants.remove(subject).is_some();
        if let Subject::Role(role) = subject {
            removed |= self.children.remove(role).is_some();
            for children in self.children.values_mut() {
                removed |= children.remove(role);
            }
            self.children.retain(|_, children| !children.is_empty());
        }
        removed
    }

    fn reaches(&self, from: &Role, to: &Role) -> bool {
        self.reachable(from).contains(to)
    }

    fn has(&self, subject: &Subject, permission: &Permission) -> bool {
        self.grants.get(subject).is_some_and(|perms| perms.contains(permission))
    }

    /// First subject on the user's path that holds `permission`.
    fn granting_subject(&self, user: &User, permission: &Permission) -> Option<Subject> {
        let role = Role::new(user.role.clone());
        self.reachable(&role)
            .into_iter()
            .map(Subject::Role)
            .chain(std::iter::once(Subject::for_user(user)))
            .find(|subject| self.has(subject, permission))
    }
}

/// Process-wide policy engine.
///
/// Constructed once at startup and shared (`Arc`) with every component that
/// needs authorization decisions.
pub struct PolicyEngine {
    model: RwLock<PolicyModel>,
    adapter: Arc<dyn PolicyAdapter>,
    /// Stored revision as last read from or written to the adapter.
    stored_revision: tokio::sync::Mutex<u64>,
}

impl core::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let model = self.model.read();
        f.debug_struct("PolicyEngine")
            .field("subjects", &model.grants.len())
            .field("revision", &model.revision)
            .finish()
    }
}

impl PolicyEngine {
    /// Empty engine; nothing is read from the adapter.
    pub fn new(adapter: Arc<dyn PolicyAdapter>) -> Self {
        Self {
            model: RwLock::new(PolicyModel::default()),
            adapter,
            stored_revision: tokio::sync::Mutex::new(0),
        }
    }

    /// Hydrate an engine from whatever the adapter holds.
    #[instrument(skip(adapter), err)]
    pub async fn load(adapter: Arc<dyn PolicyAdapter>) -> Result<Self, PolicyError> {
        let snapshot = adapter.load_policy().await?;
        let revision = snapshot.revision;
        let model = PolicyModel::from_snapshot(snapshot)?;
        debug!(revision, subjects = model.grants.len(), "policy loaded");
        Ok(Self {
            model: RwLock::new(model),
            adapter,
            stored_revision: tokio::sync::Mutex::new(revision),
        })
    }

    /// Direct grant lookup; no inheritance.
    pub fn has_permission(&self, subject: &Subject, permission: &Permission) -> bool {
        self.model.read().has(subject, permission)
    }

    /// Transitive closure over inheritance edges, including `role` itself.
    pub fn roles_reachable_from(&self, role: &Role) -> BTreeSet<Role> {
        self.model.read().reachable(role)
    }

    /// Role grants along the user's inheritance path, plus the `user:<id>` overlay.
    pub fn authorize_user(&self, user: &User, permission: &Permission) -> bool {
        self.model.read().granting_subject(user, permission).is_some()
    }

    /// Full-access keys pass unconditionally; otherwise only the key's own
    /// subject is consulted, never the owner's grants.
    pub fn authorize_api_key(&self, key: &ApiKey, permission: &Permission) -> bool {
        if key.full_access {
            return true;
        }
        self.model.read().has(&Subject::for_api_key(key), permission)
    }

    /// Which subject grants `permission` to `user`, if any.
    pub fn explain_user(&self, user: &User, permission: &Permission) -> Option<Subject> {
        self.model.read().granting_subject(user, permission)
    }

    /// Direct grants held by `subject`, sorted.
    pub fn permissions_for(&self, subject: &Subject) -> Vec<Permission> {
        self.model
            .read()
            .grants
            .get(subject)
            .map(|perms| perms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Everything `user` is allowed: reachable role grants plus the overlay.
    pub fn effective_permissions(&self, user: &User) -> BTreeSet<Permission> {
        let model = self.model.read();
        let role = Role::new(user.role.clone());
        model
            .reachable(&role)
            .into_iter()
            .map(Subject::Role)
            .chain(std::iter::once(Subject::for_user(user)))
            .filter_map(|subject| model.grants.get(&subject))
            .flat_map(|perms| perms.iter().cloned())
            .collect()
    }

    /// Replace every grant of `subject` with exactly `permissions`.
    ///
    /// An empty list clears the subject.
    pub fn set_permissions<I>(&self, subject: &Subject, permissions: I)
    where
        I: IntoIterator<Item = Permission>,
    {
        let permissions: BTreeSet<Permission> = permissions.into_iter().collect();
        let count = permissions.len();
        let mut model = self.model.write();
        model.set_grants(subject, permissions.clone());
        model.record(PolicyChange::SetPermissions {
            subject: subject.clone(),
            permissions,
        });
        debug!(subject = %subject.redacted(), count, revision = model.revision, "permissions replaced");
    }

    /// Declare that `parent` inherits every grant of `child`.
    pub fn add_inheritance(&self, parent: &Role, child: &Role) -> Result<(), PolicyError> {
        let mut model = self.model.write();
        if model.add_edge(parent, child)? {
            model.record(PolicyChange::AddInheritance {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        Ok(())
    }

    pub fn remove_inheritance(&self, parent: &Role, child: &Role) -> bool {
        let mut model = self.model.write();
        let removed = model.remove_edge(parent, child);
        if removed {
            model.record(PolicyChange::RemoveInheritance {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        removed
    }

    /// Drop every grant of `subject`; role subjects also lose their edges.
    pub fn remove_subject(&self, subject: &Subject) -> bool {
        let mut model = self.model.write();
        let removed = model.remove_subject(subject);
        if removed {
            model.record(PolicyChange::RemoveSubject(subject.clone()));
        }
        removed
    }

    pub fn revision(&self) -> u64 {
        self.model.read().revision
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        self.model.read().snapshot()
    }

    /// Whether some mutation has not reached the adapter yet.
    pub fn has_unsaved_changes(&self) -> bool {
        !self.model.read().unsaved.is_empty()
    }

    /// Commit pending mutations to durable storage.
    ///
    /// The write is a compare-and-swap against the revision this engine last
    /// read from or wrote to the adapter. When another writer got there first
    /// the stored policy is reloaded, the unsaved changes are replayed on top
    /// of it and the save is retried. [`PolicyError::Stale`] means every
    /// attempt lost; the changes stay pending for the next call.
    #[instrument(skip(self), err)]
    pub async fn save_policy(&self) -> Result<(), PolicyError> {
        let mut stored = self.stored_revision.lock().await;
        for attempt in 1..=SAVE_ATTEMPTS {
            let snapshot = {
                let model = self.model.read();
                if model.unsaved.is_empty() {
                    return Ok(());
                }
                model.snapshot()
            };

            if self.adapter.save_policy(&snapshot, *stored).await? {
                *stored = snapshot.revision;
                self.model
                    .write()
                    .unsaved
                    .retain(|(revision, _)| *revision > snapshot.revision);
                debug!(revision = snapshot.revision, "policy saved");
                return Ok(());
            }

            let latest = self.adapter.load_policy().await?;
            warn!(
                attempt,
                expected = *stored,
                found = latest.revision,
                "stored policy changed underneath; replaying local changes"
            );
            *stored = latest.revision;
            self.rebase(latest)?;
        }
        Err(PolicyError::Stale)
    }

    /// Swap in `latest` and re-apply every unsaved change on top of it.
    fn rebase(&self, latest: PolicySnapshot) -> Result<(), PolicyError> {
        let mut rebased = PolicyModel::from_snapshot(latest)?;
        let mut model = self.model.write();
        for (_, change) in std::mem::take(&mut model.unsaved) {
            match rebased.apply(&change) {
                Ok(true) => rebased.record(change),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "local policy change no longer applies; dropped"),
            }
        }
        *model = rebased;
        Ok(())
    }
}
