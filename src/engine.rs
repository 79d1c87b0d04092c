use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{select, unbounded, Receiver};
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStore, PageOutcome, SubscriptionId};
use crate::config::SyncOptions;
use crate::dispatch::{Completion, Executor, Ticket};
use crate::error::{GatewayError, SyncError};
use crate::gateway::Gateway;
use crate::mention::MentionController;
use crate::model::{FeedPage, FeedQueryKey, MentionTag, MutationKind, PostEdit, PostSummary};
use crate::mutation::{
    MutationCoordinator, MutationHandle, MutationRequest, MutationStatus, Settlement,
};

/// Failures surfaced once to the host, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    FetchFailed {
        key: FeedQueryKey,
        error: SyncError,
    },
    MutationFailed {
        post_id: String,
        kind: MutationKind,
        error: SyncError,
    },
    /// The server reported the post changed underneath a mutation.
    RefreshRecommended { post_id: String },
}

/// Counters for races the engine resolved silently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub cached_entries: usize,
    pub fetches_started: u64,
    pub stale_pages_discarded: u64,
    pub pending_mutations: usize,
    pub mutations_dispatched: u64,
    pub mutations_coalesced: u64,
    pub duplicate_settlements_ignored: u64,
    pub searches_issued: u64,
    pub stale_searches_discarded: u64,
}

/// Feed cache, optimistic mutations and mention autocomplete behind one owner.
///
/// Every method runs on the caller's thread. Gateway calls run on a private
/// worker pool and come back through [`poll`](Self::poll).
pub struct SyncEngine {
    options: SyncOptions,
    completions: Receiver<Completion>,
    store: CacheStore,
    mutations: MutationCoordinator,
    mention: MentionController,
    events: VecDeque<SyncEvent>,
    executor: Executor,
}

impl SyncEngine {
    pub fn new(options: SyncOptions, gateway: Arc<dyn Gateway>) -> Result<Self> {
        options.validate()?;
        let executor = Executor::new(options.workers);
        let (tx, rx) = unbounded();
        let store = CacheStore::new(&options, Arc::clone(&gateway), executor.spawner(), tx.clone());
        let mutations = MutationCoordinator::new(Arc::clone(&gateway), executor.spawner(), tx);
        let mention = MentionController::new(&options, gateway, executor.spawner());
        info!(
            workers = executor.workers(),
            page_size = options.page_size,
            "sync engine started"
        );
        Ok(Self {
            options,
            completions: rx,
            store,
            mutations,
            mention,
            events: VecDeque::new(),
            executor,
        })
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Stops the workers and settles every outstanding ticket with
    /// [`SyncError::EngineClosed`].
    pub fn teardown(mut self) {
        self.store.teardown();
        self.mutations.teardown();
        self.mention.discard();
        info!(workers = self.executor.workers(), "sync engine stopped");
    }

    pub fn subscribe<F>(&mut self, key: &FeedQueryKey, listener: F) -> SubscriptionId
    where
        F: FnMut(&CacheEntry) + 'static,
    {
        self.store.subscribe(key, Box::new(listener))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    pub fn entry(&self, key: &FeedQueryKey) -> Option<&CacheEntry> {
        self.store.entry(key)
    }

    pub fn get_or_create(&mut self, key: &FeedQueryKey) -> &CacheEntry {
        self.store.get_or_create(key)
    }

    pub fn find_post(&self, post_id: &str) -> Option<&PostSummary> {
        self.store.find_post(post_id)
    }

    pub fn load_page(&mut self, key: &FeedQueryKey, page_index: usize) -> Result<Ticket<FeedPage>, SyncError> {
        self.store.load_page(key, page_index)
    }

    pub fn load_more(&mut self, key: &FeedQueryKey) -> Result<Option<Ticket<FeedPage>>, SyncError> {
        self.store.load_more(key)
    }

    pub fn refresh(&mut self, key: &FeedQueryKey) -> Ticket<FeedPage> {
        self.store.refresh(key)
    }

    /// Refetches the loaded pages of `key` without clearing them first.
    pub fn revalidate(&mut self, key: &FeedQueryKey) -> Result<bool, SyncError> {
        self.store.revalidate(key)
    }

    pub fn invalidate<P>(&mut self, predicate: P) -> usize
    where
        P: Fn(&FeedQueryKey) -> bool,
    {
        self.store.invalidate(predicate)
    }

    /// Evicts unused entries older than `evict_after`.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let pinned = self.mutations.pinned_keys(&self.store);
        let evicted = self.store.sweep(now, &pinned);
        if evicted > 0 {
            debug!(evicted, remaining = self.store.len(), "cache sweep");
        }
        evicted
    }

    pub fn like(&mut self, post_id: &str, viewer_id: &str) -> MutationHandle {
        self.mutate(MutationRequest::new(post_id, viewer_id, MutationKind::Like))
    }

    pub fn unlike(&mut self, post_id: &str, viewer_id: &str) -> MutationHandle {
        self.mutate(MutationRequest::new(post_id, viewer_id, MutationKind::Unlike))
    }

    pub fn edit_tags(&mut self, post_id: &str, viewer_id: &str, tags: Vec<MentionTag>) -> MutationHandle {
        self.mutate(MutationRequest::edit(post_id, viewer_id, PostEdit::tags(tags)))
    }

    pub fn edit_post(&mut self, post_id: &str, viewer_id: &str, edit: PostEdit) -> MutationHandle {
        self.mutate(MutationRequest::edit(post_id, viewer_id, edit))
    }

    pub fn delete_post(&mut self, post_id: &str, viewer_id: &str) -> MutationHandle {
        self.mutate(MutationRequest::new(post_id, viewer_id, MutationKind::Delete))
    }

    pub fn mutation_status(&self, handle: &MutationHandle) -> Option<MutationStatus> {
        self.mutations.status(handle.mutation_id())
    }

    /// Settles a mutation with an outcome observed by the host. Returns false
    /// when the mutation had already settled.
    pub fn settle(&mut self, handle: &MutationHandle, outcome: Result<Option<PostSummary>, GatewayError>) -> bool {
        let settlement = self.mutations.settle(&mut self.store, handle, outcome);
        let fresh = settlement != Settlement::Duplicate;
        self.on_settlement(settlement);
        self.store.flush_notifications();
        fresh
    }

    pub fn mention(&mut self) -> &mut MentionController {
        &mut self.mention
    }

    /// Runs one event-loop turn without blocking. Returns how many gateway
    /// completions were applied.
    pub fn poll(&mut self) -> usize {
        self.flush_mutations();
        let mut applied = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.apply(completion);
            applied += 1;
        }
        self.flush_mutations();
        self.mention.tick(Instant::now());
        self.mention.poll();
        self.store.flush_notifications();
        applied
    }

    /// Like [`poll`](Self::poll) but waits up to `timeout` for a completion,
    /// a search response or the mention debounce deadline.
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        let applied = self.poll();
        if applied > 0 {
            return applied;
        }
        let now = Instant::now();
        let wait = self
            .mention
            .next_deadline()
            .map_or(timeout, |deadline| deadline.saturating_duration_since(now).min(timeout));
        let woke = self.wait_once(wait);
        woke + self.poll()
    }

    /// Drives the loop until `ticket` settles or `timeout` passes.
    pub fn wait_for<T: Clone>(&mut self, ticket: &Ticket<T>, timeout: Duration) -> Option<Result<T, SyncError>> {
        let until = Instant::now() + timeout;
        loop {
            self.poll();
            if let Some(result) = ticket.try_result() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= until {
                return None;
            }
            let wait = self
                .mention
                .next_deadline()
                .map_or(until, |deadline| deadline.min(until));
            self.wait_once(wait.saturating_duration_since(now));
        }
    }

    /// Blocks for at most `wait` on gateway and search results; returns how
    /// many it applied.
    fn wait_once(&mut self, wait: Duration) -> usize {
        let completions = self.completions.clone();
        let searches = self.mention.completions().clone();
        select! {
            recv(completions) -> completion => match completion {
                Ok(completion) => {
                    self.apply(completion);
                    1
                }
                Err(_) => 0,
            },
            recv(searches) -> search => match search {
                Ok(search) => self.mention.apply(search) as usize,
                Err(_) => 0,
            },
            default(wait) => 0,
        }
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        self.events.drain(..).collect()
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            cached_entries: self.store.len(),
            fetches_started: self.store.fetches_started(),
            stale_pages_discarded: self.store.stale_pages_discarded(),
            pending_mutations: self.mutations.pending_count(),
            mutations_dispatched: self.mutations.dispatched(),
            mutations_coalesced: self.mutations.coalesced(),
            duplicate_settlements_ignored: self.mutations.duplicate_settlements(),
            searches_issued: self.mention.searches_issued(),
            stale_searches_discarded: self.mention.stale_discarded(),
        }
    }

    fn mutate(&mut self, request: MutationRequest) -> MutationHandle {
        let handle = self.mutations.apply_optimistic(&mut self.store, request);
        self.store.flush_notifications();
        handle
    }

    fn flush_mutations(&mut self) {
        for settlement in self.mutations.flush(&mut self.store) {
            self.on_settlement(settlement);
        }
    }

    fn apply(&mut self, completion: Completion) {
        match completion {
            Completion::Page(page) => match self.store.apply_page(page) {
                PageOutcome::Applied(key) => self.mutations.reapply(&mut self.store, &key),
                PageOutcome::Failed(key, error) => {
                    self.events.push_back(SyncEvent::FetchFailed { key, error });
                }
                PageOutcome::Discarded => {}
            },
            Completion::Mutation(done) => {
                let settlement = self.mutations.apply_completion(&mut self.store, done);
                self.on_settlement(settlement);
            }
        }
    }

    fn on_settlement(&mut self, settlement: Settlement) {
        let Settlement::RolledBack { post_id, kind, error } = settlement else {
            return;
        };
        if error.is_conflict() {
            let invalidated = self.store.invalidate_containing(&post_id);
            debug!(post = %post_id, invalidated, "conflict; recommending refresh");
            self.events.push_back(SyncEvent::RefreshRecommended {
                post_id: post_id.clone(),
            });
        }
        self.events.push_back(SyncEvent::MutationFailed {
            post_id,
            kind,
            error: SyncError::MutationFailed(error),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::mention::Phase;
    use crate::model::{sample_post, SortOption, UserSummary};

    const WAIT: Duration = Duration::from_secs(2);

    fn engine(posts: usize) -> (SyncEngine, Arc<MockGateway>) {
        let posts = (1..=posts)
            .map(|n| sample_post(&format!("p{n}"), n as i64))
            .collect();
        let gateway = Arc::new(MockGateway::new(posts, Vec::new()));
        let options = SyncOptions {
            page_size: 2,
            workers: 2,
            ..SyncOptions::default()
        };
        (SyncEngine::new(options, gateway.clone()).unwrap(), gateway)
    }

    fn key() -> FeedQueryKey {
        FeedQueryKey::new(SortOption::Recent, "", "u1")
    }

    #[test]
    fn rejects_invalid_options() {
        let gateway = Arc::new(MockGateway::default());
        let options = SyncOptions {
            page_size: 0,
            ..SyncOptions::default()
        };
        assert!(SyncEngine::new(options, gateway).is_err());
    }

    #[test]
    fn conflict_rolls_back_and_recommends_refresh() {
        let (mut engine, gateway) = engine(3);
        let page = engine.load_more(&key()).unwrap().unwrap();
        engine.wait_for(&page, WAIT).unwrap().unwrap();
        gateway.fail_next_mutation(GatewayError::Conflict("post was deleted".into()));

        let handle = engine.like("p1", "u1");
        assert!(engine.find_post("p1").unwrap().is_liked_by("u1"));
        let result = engine.wait_for(handle.ticket(), WAIT).unwrap();
        assert!(result.is_err());
        assert!(!engine.find_post("p1").unwrap().is_liked_by("u1"));

        let events = engine.drain_events();
        assert_eq!(
            events[0],
            SyncEvent::RefreshRecommended {
                post_id: "p1".into()
            }
        );
        assert!(matches!(events[1], SyncEvent::MutationFailed { kind: MutationKind::Like, .. }));
        assert!(engine.entry(&key()).unwrap().is_invalidated());
        assert_eq!(engine.mutation_status(&handle), Some(MutationStatus::RolledBack));
    }

    #[test]
    fn fetch_failure_is_reported_once() {
        let (mut engine, gateway) = engine(3);
        gateway.fail_next_fetch(GatewayError::Network("offline".into()));
        let page = engine.load_more(&key()).unwrap().unwrap();
        assert!(matches!(
            engine.wait_for(&page, WAIT),
            Some(Err(SyncError::FetchFailed(_)))
        ));
        assert_eq!(engine.drain_events().len(), 1);
        assert!(engine.drain_events().is_empty());
    }

    #[test]
    fn sweep_keeps_posts_with_pending_mutations() {
        let (mut engine, _gateway) = engine(3);
        let page = engine.load_more(&key()).unwrap().unwrap();
        engine.wait_for(&page, WAIT).unwrap().unwrap();
        let _handle = engine.like("p2", "u1");

        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(engine.sweep(later), 0);
        engine.poll_timeout(WAIT);
        engine.poll();
        assert_eq!(engine.telemetry().pending_mutations, 0);
        assert_eq!(engine.sweep(later), 1);
        assert!(engine.entry(&key()).is_none());
    }

    #[test]
    fn sweep_keeps_the_entry_a_pending_delete_restores_into() {
        let (mut engine, gateway) = engine(3);
        let page = engine.load_more(&key()).unwrap().unwrap();
        engine.wait_for(&page, WAIT).unwrap().unwrap();
        gateway.fail_next_mutation(GatewayError::Network("offline".into()));

        let handle = engine.delete_post("p2", "u1");
        assert!(engine.find_post("p2").is_none());
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(engine.sweep(later), 0);

        assert!(engine.wait_for(handle.ticket(), WAIT).unwrap().is_err());
        let ids: Vec<String> = engine
            .entry(&key())
            .unwrap()
            .posts()
            .map(|post| post.id.clone())
            .collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[test]
    fn search_response_wakes_the_loop() {
        let users = vec![UserSummary {
            id: "1".into(),
            name: "Alice".into(),
            email: "alice@example.com".into(),
        }];
        let gateway = Arc::new(
            MockGateway::new(Vec::new(), users).with_latency(Duration::from_millis(50)),
        );
        let options = SyncOptions {
            debounce: Duration::from_millis(10),
            ..SyncOptions::default()
        };
        let mut engine = SyncEngine::new(options, gateway).unwrap();
        engine.mention().on_text_change("@al", 3);

        let started = Instant::now();
        while engine.mention().phase() != Phase::Suggesting && started.elapsed() < WAIT {
            engine.poll_timeout(WAIT);
        }
        assert_eq!(engine.mention().phase(), Phase::Suggesting);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.mention().view().candidates[0].name, "Alice");
    }

    #[test]
    fn external_settlement_is_idempotent() {
        let (mut engine, _gateway) = engine(3);
        let page = engine.load_more(&key()).unwrap().unwrap();
        engine.wait_for(&page, WAIT).unwrap().unwrap();

        let handle = engine.unlike("p1", "u1");
        assert!(engine.settle(&handle, Err(GatewayError::Unauthorized)));
        assert!(!engine.settle(&handle, Err(GatewayError::Unauthorized)));
        assert_eq!(engine.telemetry().duplicate_settlements_ignored, 1);
        assert_eq!(engine.drain_events().len(), 1);
    }

    #[test]
    fn teardown_closes_pending_tickets() {
        let (mut engine, _gateway) = engine(3);
        let handle = engine.delete_post("p9", "u1");
        let ticket = handle.ticket().clone();
        engine.teardown();
        assert_eq!(ticket.try_result(), Some(Err(SyncError::EngineClosed)));
    }
}
