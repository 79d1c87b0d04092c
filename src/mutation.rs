use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::cache::{CacheStore, PostLocation};
use crate::dispatch::{Completion, Spawner, Ticket};
use crate::error::{GatewayError, SyncError};
use crate::gateway::Gateway;
use crate::model::{FeedQueryKey, KindClass, MutationKind, MutationPayload, PostEdit, PostSummary};

const FINISHED_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRequest {
    pub post_id: String,
    pub viewer_id: String,
    pub kind: MutationKind,
    pub payload: MutationPayload,
}

impl MutationRequest {
    pub fn new(post_id: &str, viewer_id: &str, kind: MutationKind) -> Self {
        Self {
            post_id: post_id.to_string(),
            viewer_id: viewer_id.to_string(),
            kind,
            payload: MutationPayload::None,
        }
    }

    pub fn edit(post_id: &str, viewer_id: &str, edit: PostEdit) -> Self {
        Self {
            payload: MutationPayload::Edit(edit),
            ..Self::new(post_id, viewer_id, MutationKind::Edit)
        }
    }
}

/// Caller's view of one optimistic mutation. Coalesced requests receive
/// handles to the same record and ticket.
#[derive(Debug, Clone)]
pub struct MutationHandle {
    mutation_id: u64,
    post_id: String,
    kind: MutationKind,
    ticket: Ticket<Option<PostSummary>>,
}

impl MutationHandle {
    pub fn mutation_id(&self) -> u64 {
        self.mutation_id
    }

    pub fn post_id(&self) -> &str {
        &self.post_id
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    /// Settles with the server's post (`None` for deletes) or the failure.
    pub fn ticket(&self) -> &Ticket<Option<PostSummary>> {
        &self.ticket
    }
}

/// End state a record is driving the server towards.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Intent {
    Reaction { liked: bool },
    Edit(PostEdit),
    Delete,
}

impl Intent {
    fn from_request(kind: MutationKind, payload: &MutationPayload) -> Self {
        match kind {
            MutationKind::Like => Intent::Reaction { liked: true },
            MutationKind::Unlike => Intent::Reaction { liked: false },
            MutationKind::Edit => match payload {
                MutationPayload::Edit(edit) => Intent::Edit(edit.clone()),
                MutationPayload::None => Intent::Edit(PostEdit::default()),
            },
            MutationKind::Delete => Intent::Delete,
        }
    }

    fn kind(&self) -> MutationKind {
        match self {
            Intent::Reaction { liked: true } => MutationKind::Like,
            Intent::Reaction { liked: false } => MutationKind::Unlike,
            Intent::Edit(_) => MutationKind::Edit,
            Intent::Delete => MutationKind::Delete,
        }
    }

    fn payload(&self) -> MutationPayload {
        match self {
            Intent::Edit(edit) => MutationPayload::Edit(edit.clone()),
            _ => MutationPayload::None,
        }
    }

    /// Later requests of the same class replace reactions and merge edits.
    fn fold(&mut self, later: Intent) {
        match (self, later) {
            (Intent::Edit(current), Intent::Edit(later)) => current.merge(later),
            (current, later) => *current = later,
        }
    }

    fn apply(&self, post: &mut PostSummary, viewer: &str) {
        match self {
            Intent::Reaction { liked: true } => {
                post.like_ids.insert(viewer.to_string());
            }
            Intent::Reaction { liked: false } => {
                post.like_ids.remove(viewer);
            }
            Intent::Edit(edit) => edit.apply_to(post),
            Intent::Delete => {}
        }
    }

    fn satisfied_by(&self, post: &PostSummary, viewer: &str) -> bool {
        match self {
            Intent::Reaction { liked } => post.is_liked_by(viewer) == *liked,
            Intent::Edit(edit) => edit.matches(post),
            Intent::Delete => false,
        }
    }
}

struct MutationRecord {
    mutation_id: u64,
    post_id: String,
    viewer_id: String,
    class: KindClass,
    kind: MutationKind,
    /// Last server-confirmed state of the post; `None` when it was not cached.
    snapshot: Option<PostSummary>,
    desired: Intent,
    sent: Option<(u32, Intent)>,
    attempts: u32,
    removed_at: Vec<PostLocation>,
    ticket: Ticket<Option<PostSummary>>,
}

impl MutationRecord {
    fn handle(&self) -> MutationHandle {
        MutationHandle {
            mutation_id: self.mutation_id,
            post_id: self.post_id.clone(),
            kind: self.kind,
            ticket: self.ticket.clone(),
        }
    }

    fn apply_local(&mut self, store: &mut CacheStore, only: Option<&FeedQueryKey>) {
        match &self.desired {
            Intent::Delete => {
                let removed = store.remove_post(&self.post_id, only);
                if let Some(key) = only {
                    if !removed.is_empty() {
                        self.removed_at.retain(|location| &location.key != key);
                    }
                }
                self.removed_at.extend(removed);
            }
            intent => {
                let viewer = self.viewer_id.as_str();
                match only {
                    Some(key) => store.update_post_in(key, &self.post_id, |post| intent.apply(post, viewer)),
                    None => store.update_post(&self.post_id, |post| intent.apply(post, viewer)),
                };
            }
        }
    }
}

pub(crate) struct MutationCompletion {
    pub mutation_id: u64,
    pub attempt: u32,
    pub result: Result<Option<PostSummary>, GatewayError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    Committed,
    RolledBack {
        post_id: String,
        kind: MutationKind,
        error: GatewayError,
    },
    Redispatched,
    Duplicate,
}

/// Applies optimistic edits to the cache and reconciles them with the server.
pub struct MutationCoordinator {
    gateway: Arc<dyn Gateway>,
    spawner: Spawner,
    completions: Sender<Completion>,
    records: HashMap<u64, MutationRecord>,
    pending: HashMap<(String, KindClass), u64>,
    ready: Vec<u64>,
    finished: VecDeque<(u64, MutationStatus)>,
    next_id: u64,
    dispatched: u64,
    coalesced: u64,
    duplicate_settlements: u64,
}

impl MutationCoordinator {
    pub(crate) fn new(gateway: Arc<dyn Gateway>, spawner: Spawner, completions: Sender<Completion>) -> Self {
        Self {
            gateway,
            spawner,
            completions,
            records: HashMap::new(),
            pending: HashMap::new(),
            ready: Vec::new(),
            finished: VecDeque::new(),
            next_id: 1,
            dispatched: 0,
            coalesced: 0,
            duplicate_settlements: 0,
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    pub fn duplicate_settlements(&self) -> u64 {
        self.duplicate_settlements
    }

    pub fn pending_count(&self) -> usize {
        self.records.len()
    }

    pub fn status(&self, mutation_id: u64) -> Option<MutationStatus> {
        if self.records.contains_key(&mutation_id) {
            return Some(MutationStatus::Pending);
        }
        self.finished
            .iter()
            .find(|(id, _)| *id == mutation_id)
            .map(|(_, status)| *status)
    }

    /// Cache entries a pending mutation still points at: those showing a
    /// pending post and those a pending delete will reinsert into on rollback.
    pub fn pinned_keys(&self, store: &CacheStore) -> HashSet<FeedQueryKey> {
        let mut keys = HashSet::new();
        for record in self.records.values() {
            keys.extend(record.removed_at.iter().map(|location| location.key.clone()));
            keys.extend(store.keys_containing(&record.post_id));
        }
        keys
    }

    /// Applies the local effect of `request` to every cached copy of the post
    /// right away. The network call goes out on the next [`flush`](Self::flush).
    pub fn apply_optimistic(&mut self, store: &mut CacheStore, request: MutationRequest) -> MutationHandle {
        let class = request.kind.class();
        let intent = Intent::from_request(request.kind, &request.payload);
        let slot = (request.post_id.clone(), class);

        if let Some(record) = self
            .pending
            .get(&slot)
            .and_then(|id| self.records.get_mut(id))
        {
            record.desired.fold(intent);
            record.kind = request.kind;
            record.apply_local(store, None);
            self.coalesced += 1;
            debug!(mutation_id = record.mutation_id, post = %record.post_id, kind = %request.kind, "coalesced mutation");
            return record.handle();
        }

        let mutation_id = self.next_id;
        self.next_id += 1;
        let mut record = MutationRecord {
            mutation_id,
            post_id: request.post_id,
            viewer_id: request.viewer_id,
            class,
            kind: request.kind,
            snapshot: self.confirmed_base(store, &slot.0),
            desired: intent,
            sent: None,
            attempts: 0,
            removed_at: Vec::new(),
            ticket: Ticket::pending(),
        };
        record.apply_local(store, None);
        debug!(mutation_id, post = %record.post_id, kind = %record.kind, "optimistic mutation applied");

        let handle = record.handle();
        self.records.insert(mutation_id, record);
        self.pending.insert(slot, mutation_id);
        self.ready.push(mutation_id);
        handle
    }

    /// Sends every record that has not hit the network yet. Records whose
    /// desired state already matches the server commit without a call.
    pub(crate) fn flush(&mut self, store: &mut CacheStore) -> Vec<Settlement> {
        let mut settlements = Vec::new();
        for mutation_id in std::mem::take(&mut self.ready) {
            let Some(record) = self.records.get(&mutation_id) else {
                continue;
            };
            if record.sent.is_some() {
                continue;
            }
            let satisfied = record
                .snapshot
                .as_ref()
                .map_or(false, |post| record.desired.satisfied_by(post, &record.viewer_id));
            if satisfied {
                debug!(mutation_id, "mutation cancelled out before dispatch");
                let snapshot = record.snapshot.clone();
                self.commit(store, mutation_id, snapshot);
                settlements.push(Settlement::Committed);
            } else if let Some(settlement) = self.dispatch(store, mutation_id) {
                settlements.push(settlement);
            }
        }
        settlements
    }

    /// Settles `handle` with an outcome obtained outside the worker pool.
    /// Settling a finished mutation again is a counted no-op.
    pub(crate) fn settle(
        &mut self,
        store: &mut CacheStore,
        handle: &MutationHandle,
        outcome: Result<Option<PostSummary>, GatewayError>,
    ) -> Settlement {
        let attempt = match self.records.get_mut(&handle.mutation_id) {
            Some(record) => match record.sent.as_ref().map(|(attempt, _)| *attempt) {
                Some(attempt) => attempt,
                None => {
                    record.attempts += 1;
                    record.sent = Some((record.attempts, record.desired.clone()));
                    record.attempts
                }
            },
            None => 0,
        };
        self.settle_attempt(store, handle.mutation_id, attempt, outcome)
    }

    pub(crate) fn apply_completion(&mut self, store: &mut CacheStore, completion: MutationCompletion) -> Settlement {
        self.settle_attempt(store, completion.mutation_id, completion.attempt, completion.result)
    }

    fn settle_attempt(
        &mut self,
        store: &mut CacheStore,
        mutation_id: u64,
        attempt: u32,
        outcome: Result<Option<PostSummary>, GatewayError>,
    ) -> Settlement {
        let sent = self.records.get_mut(&mutation_id).and_then(|record| {
            let current = record.sent.as_ref().map(|(current, _)| *current);
            if current == Some(attempt) {
                record.sent.take()
            } else {
                None
            }
        });
        let Some((_, sent)) = sent else {
            self.duplicate_settlements += 1;
            debug!(mutation_id, attempt, "ignoring duplicate settlement");
            return Settlement::Duplicate;
        };

        match outcome {
            Ok(server) => {
                let Some(record) = self.records.get_mut(&mutation_id) else {
                    return Settlement::Duplicate;
                };
                let settled = record.desired == sent
                    || server
                        .as_ref()
                        .map_or(false, |post| record.desired.satisfied_by(post, &record.viewer_id));
                if let Some(post) = &server {
                    self.confirm(post);
                }
                if settled {
                    self.commit(store, mutation_id, server);
                    return Settlement::Committed;
                }
                debug!(mutation_id, "desired state moved while in flight; sending follow-up");
                if let Some(post) = &server {
                    overwrite(store, post);
                    self.reapply_post(store, &post.id);
                }
                self.dispatch(store, mutation_id).unwrap_or(Settlement::Redispatched)
            }
            Err(error) => self.roll_back(store, mutation_id, error),
        }
    }

    /// Re-applies pending intents to pages of `key` that just arrived.
    pub(crate) fn reapply(&mut self, store: &mut CacheStore, key: &FeedQueryKey) {
        for record in self.records.values_mut() {
            record.apply_local(store, Some(key));
        }
    }

    /// Rolls back every pending record and settles its ticket with `EngineClosed`.
    pub(crate) fn teardown(&mut self) {
        for (_, record) in self.records.drain() {
            record.ticket.settle(Err(SyncError::EngineClosed));
        }
        self.pending.clear();
        self.ready.clear();
    }

    fn dispatch(&mut self, store: &mut CacheStore, mutation_id: u64) -> Option<Settlement> {
        let record = self.records.get_mut(&mutation_id)?;
        record.attempts += 1;
        let attempt = record.attempts;
        let intent = record.desired.clone();
        let kind = intent.kind();
        let payload = intent.payload();
        record.sent = Some((attempt, intent));

        let gateway = Arc::clone(&self.gateway);
        let tx = self.completions.clone();
        let post_id = record.post_id.clone();
        let viewer_id = record.viewer_id.clone();
        let queued = self.spawner.spawn(move || {
            let result = gateway.post_mutation(kind, &post_id, &payload, &viewer_id);
            let _ = tx.send(Completion::Mutation(MutationCompletion {
                mutation_id,
                attempt,
                result,
            }));
        });
        if !queued {
            warn!(mutation_id, "executor is gone; rolling back mutation");
            return Some(self.roll_back(store, mutation_id, GatewayError::Network("sync engine closed".into())));
        }
        self.dispatched += 1;
        debug!(mutation_id, attempt, %kind, "mutation dispatched");
        None
    }

    fn commit(&mut self, store: &mut CacheStore, mutation_id: u64, server: Option<PostSummary>) {
        let Some(record) = self.finish(mutation_id, MutationStatus::Committed) else {
            return;
        };
        if let Some(post) = &server {
            self.confirm(post);
            overwrite(store, post);
            self.reapply_post(store, &post.id);
        }
        debug!(mutation_id, post = %record.post_id, kind = %record.kind, "mutation committed");
        record.ticket.settle(Ok(server));
    }

    fn roll_back(&mut self, store: &mut CacheStore, mutation_id: u64, error: GatewayError) -> Settlement {
        let Some(record) = self.finish(mutation_id, MutationStatus::RolledBack) else {
            return Settlement::Duplicate;
        };
        match (&record.desired, &record.snapshot) {
            (Intent::Delete, Some(post)) => {
                store.restore_post(post, &record.removed_at);
            }
            (_, Some(post)) => {
                overwrite(store, post);
            }
            // Nothing cached to restore; the rollback has no visual effect.
            (_, None) => {}
        }
        self.reapply_post(store, &record.post_id);
        warn!(mutation_id, post = %record.post_id, kind = %record.kind, error = %error, "mutation rolled back");
        record
            .ticket
            .settle(Err(SyncError::MutationFailed(error.clone())));
        Settlement::RolledBack {
            post_id: record.post_id,
            kind: record.kind,
            error,
        }
    }

    fn finish(&mut self, mutation_id: u64, status: MutationStatus) -> Option<MutationRecord> {
        let record = self.records.remove(&mutation_id)?;
        self.pending.remove(&(record.post_id.clone(), record.class));
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back((mutation_id, status));
        Some(record)
    }

    /// Server-confirmed state of `post_id`. Pending records for the same post
    /// share one base, so a new record never captures another's optimistic edit.
    fn confirmed_base(&self, store: &CacheStore, post_id: &str) -> Option<PostSummary> {
        match self.records.values().find(|record| record.post_id == post_id) {
            Some(sibling) => sibling.snapshot.clone(),
            None => store.find_post(post_id).cloned(),
        }
    }

    fn confirm(&mut self, server: &PostSummary) {
        for record in self.records.values_mut().filter(|record| record.post_id == server.id) {
            record.snapshot = Some(server.clone());
        }
    }

    fn reapply_post(&mut self, store: &mut CacheStore, post_id: &str) {
        for record in self.records.values_mut().filter(|record| record.post_id == post_id) {
            record.apply_local(store, None);
        }
    }
}

fn overwrite(store: &mut CacheStore, server: &PostSummary) {
    store.update_post(&server.id, |post| {
        if *post != *server {
            *post = server.clone();
        }
    });
}
