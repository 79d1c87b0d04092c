use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, error, warn};

use crate::config::SyncOptions;
use crate::dispatch::{Completion, Spawner, Ticket};
use crate::error::{GatewayError, SyncError};
use crate::gateway::Gateway;
use crate::model::{FeedPage, FeedQueryKey, PostSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Append the next page or replace a stale one.
    Load,
    /// Replace every page with a fresh page 0 on arrival.
    Refresh,
    /// Refetch loaded pages in order, up to `through` pages.
    Revalidate { through: usize },
}

struct InFlight {
    request_id: u64,
    page_index: usize,
    mode: FetchMode,
    ticket: Ticket<FeedPage>,
    /// Tickets of superseded fetches; they settle with the winner.
    followers: Vec<Ticket<FeedPage>>,
}

impl InFlight {
    fn settle(self, result: Result<FeedPage, SyncError>) {
        for ticket in self.followers {
            ticket.settle(result.clone());
        }
        self.ticket.settle(result);
    }
}

/// Cached pages for one [`FeedQueryKey`].
///
/// `pages[i].page_index == i` always holds. Pages stay visible while the entry
/// is being refetched or after a failed fetch.
pub struct CacheEntry {
    key: FeedQueryKey,
    pages: Vec<FeedPage>,
    created_at: Instant,
    fetched_at: Option<Instant>,
    status: FetchStatus,
    last_error: Option<SyncError>,
    invalidated: bool,
    stale_after: Duration,
    evict_after: Duration,
    in_flight: Option<InFlight>,
}

impl CacheEntry {
    fn new(key: FeedQueryKey, stale_after: Duration, evict_after: Duration) -> Self {
        Self {
            key,
            pages: Vec::new(),
            created_at: Instant::now(),
            fetched_at: None,
            status: FetchStatus::Idle,
            last_error: None,
            invalidated: false,
            stale_after,
            evict_after,
            in_flight: None,
        }
    }

    pub fn key(&self) -> &FeedQueryKey {
        &self.key
    }

    pub fn pages(&self) -> &[FeedPage] {
        &self.pages
    }

    pub fn posts(&self) -> impl Iterator<Item = &PostSummary> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    pub fn status(&self) -> FetchStatus {
        self.status
    }

    pub fn fetched_at(&self) -> Option<Instant> {
        self.fetched_at
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn evict_after(&self) -> Duration {
        self.evict_after
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// True until the last loaded page reports `has_more == false`.
    pub fn has_more(&self) -> bool {
        self.pages.last().map_or(true, |page| page.has_more)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        match self.fetched_at {
            Some(at) => now.saturating_duration_since(at) >= self.stale_after,
            None => true,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        let since = self.fetched_at.unwrap_or(self.created_at);
        now.saturating_duration_since(since) >= self.evict_after
    }
}

pub(crate) struct PageCompletion {
    pub key: FeedQueryKey,
    pub request_id: u64,
    pub page_index: usize,
    pub result: Result<FeedPage, GatewayError>,
}

#[derive(Debug)]
pub(crate) enum PageOutcome {
    Applied(FeedQueryKey),
    Failed(FeedQueryKey, SyncError),
    Discarded,
}

/// Where an optimistically removed post used to sit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostLocation {
    pub key: FeedQueryKey,
    pub page_index: usize,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type Listener = Box<dyn FnMut(&CacheEntry)>;

struct Subscription {
    key: FeedQueryKey,
    listener: Listener,
}

/// Single source of truth for feed data, keyed by [`FeedQueryKey`].
pub struct CacheStore {
    gateway: Arc<dyn Gateway>,
    spawner: Spawner,
    completions: Sender<Completion>,
    page_size: usize,
    stale_after: Duration,
    evict_after: Duration,
    entries: HashMap<FeedQueryKey, CacheEntry>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    dirty: HashSet<FeedQueryKey>,
    next_subscription: u64,
    next_request: u64,
    fetches_started: u64,
    stale_pages_discarded: u64,
}

impl CacheStore {
    pub(crate) fn new(
        options: &SyncOptions,
        gateway: Arc<dyn Gateway>,
        spawner: Spawner,
        completions: Sender<Completion>,
    ) -> Self {
        Self {
            gateway,
            spawner,
            completions,
            page_size: options.page_size.max(1),
            stale_after: options.stale_after,
            evict_after: options.evict_after.max(options.stale_after),
            entries: HashMap::new(),
            subscriptions: BTreeMap::new(),
            dirty: HashSet::new(),
            next_subscription: 1,
            next_request: 1,
            fetches_started: 0,
            stale_pages_discarded: 0,
        }
    }

    pub fn entry(&self, key: &FeedQueryKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fetches_started(&self) -> u64 {
        self.fetches_started
    }

    pub fn stale_pages_discarded(&self) -> u64 {
        self.stale_pages_discarded
    }

    /// Returns the entry for `key`, creating an empty idle one if needed.
    pub fn get_or_create(&mut self, key: &FeedQueryKey) -> &CacheEntry {
        let (stale_after, evict_after) = (self.stale_after, self.evict_after);
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), stale_after, evict_after))
    }

    /// Requests page `page_index` of `key`.
    ///
    /// Fresh cached pages resolve immediately. A request matching the fetch
    /// already in flight shares its ticket. Pages must be requested in order:
    /// page `n + 1` only after page `n` arrived with `has_more`.
    pub fn load_page(
        &mut self,
        key: &FeedQueryKey,
        page_index: usize,
    ) -> Result<Ticket<FeedPage>, SyncError> {
        let now = Instant::now();
        let entry = self.get_or_create(key);
        let loaded = entry.pages.len();

        if let Some(in_flight) = &entry.in_flight {
            if in_flight.page_index == page_index {
                debug!(%key, page = page_index, "joining in-flight fetch");
                return Ok(in_flight.ticket.clone());
            }
            if page_index < loaded {
                return Ok(Ticket::ready(Ok(entry.pages[page_index].clone())));
            }
            return Err(invalid_request(key, page_index, loaded, "another page fetch is in flight"));
        }

        if page_index < loaded {
            if !entry.is_stale(now) {
                return Ok(Ticket::ready(Ok(entry.pages[page_index].clone())));
            }
            return Ok(self.start_fetch(key, page_index, FetchMode::Load, Vec::new()));
        }
        if page_index > loaded {
            return Err(invalid_request(key, page_index, loaded, "pages must be requested in order"));
        }
        if !entry.has_more() {
            return Err(invalid_request(key, page_index, loaded, "feed is exhausted"));
        }
        Ok(self.start_fetch(key, page_index, FetchMode::Load, Vec::new()))
    }

    /// Loads the page after the last one. `Ok(None)` when the feed is
    /// exhausted or a different page is already being fetched.
    pub fn load_more(&mut self, key: &FeedQueryKey) -> Result<Option<Ticket<FeedPage>>, SyncError> {
        let entry = self.get_or_create(key);
        let next = entry.pages.len();
        if let Some(in_flight) = &entry.in_flight {
            return Ok((in_flight.page_index == next && in_flight.mode == FetchMode::Load)
                .then(|| in_flight.ticket.clone()));
        }
        if !entry.has_more() {
            return Ok(None);
        }
        self.load_page(key, next).map(Some)
    }

    /// Refetches page 0 and replaces every page with it on arrival.
    ///
    /// A fetch already in flight for `key` is superseded: its response is
    /// discarded and its callers receive this refresh's result instead.
    pub fn refresh(&mut self, key: &FeedQueryKey) -> Ticket<FeedPage> {
        self.get_or_create(key);
        let followers = self
            .entries
            .get_mut(key)
            .and_then(|entry| entry.in_flight.take())
            .map(|superseded| {
                debug!(%key, request = superseded.request_id, "superseding in-flight fetch");
                let mut followers = superseded.followers;
                followers.push(superseded.ticket);
                followers
            })
            .unwrap_or_default();
        self.start_fetch(key, 0, FetchMode::Refresh, followers)
    }

    /// Marks matching entries stale without dropping their pages. Subscribed
    /// entries revalidate in the background right away.
    pub fn invalidate<P>(&mut self, predicate: P) -> usize
    where
        P: Fn(&FeedQueryKey) -> bool,
    {
        let active = self.active_keys();
        let mut revalidate = Vec::new();
        let mut count = 0;
        for (key, entry) in self.entries.iter_mut() {
            if !predicate(key) {
                continue;
            }
            entry.invalidated = true;
            count += 1;
            self.dirty.insert(key.clone());
            if active.contains(key) {
                revalidate.push(key.clone());
            }
        }
        for key in revalidate {
            let _ = self.revalidate(&key);
        }
        debug!(count, "invalidated cache entries");
        count
    }

    /// Invalidates every entry that currently shows `post_id`.
    pub fn invalidate_containing(&mut self, post_id: &str) -> usize {
        let keys: HashSet<FeedQueryKey> = self.keys_containing(post_id).into_iter().collect();
        self.invalidate(|key| keys.contains(key))
    }

    pub fn subscribe(&mut self, key: &FeedQueryKey, mut listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        let entry = self.get_or_create(key);
        listener(entry);
        let stale = entry.is_stale(Instant::now()) && !entry.pages.is_empty();
        self.subscriptions.insert(
            id,
            Subscription {
                key: key.clone(),
                listener,
            },
        );
        if stale {
            let _ = self.revalidate(key);
        }
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    pub fn subscriber_count(&self, key: &FeedQueryKey) -> usize {
        self.subscriptions
            .values()
            .filter(|sub| &sub.key == key)
            .count()
    }

    /// Invokes listeners of every entry changed since the last flush.
    pub(crate) fn flush_notifications(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let dirty: Vec<FeedQueryKey> = self.dirty.drain().collect();
        for key in dirty {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            for sub in self.subscriptions.values_mut().filter(|sub| sub.key == key) {
                (sub.listener)(entry);
            }
        }
    }

    /// Drops entries past `evict_after` that nobody watches, nothing is
    /// fetching, and no pending mutation targets.
    pub fn sweep(&mut self, now: Instant, pinned: &HashSet<FeedQueryKey>) -> usize {
        let active = self.active_keys();
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let evict = entry.is_expired(now)
                && !active.contains(key)
                && entry.in_flight.is_none()
                && !pinned.contains(key);
            if evict {
                debug!(%key, "evicting cache entry");
            }
            !evict
        });
        before - self.entries.len()
    }

    pub(crate) fn apply_page(&mut self, completion: PageCompletion) -> PageOutcome {
        let PageCompletion {
            key,
            request_id,
            page_index,
            result,
        } = completion;

        let Some(entry) = self.entries.get_mut(&key) else {
            self.stale_pages_discarded += 1;
            debug!(%key, request = request_id, "discarding page for evicted entry");
            return PageOutcome::Discarded;
        };
        let current = entry
            .in_flight
            .as_ref()
            .map_or(false, |in_flight| in_flight.request_id == request_id);
        if !current {
            self.stale_pages_discarded += 1;
            debug!(%key, request = request_id, page = page_index, "discarding stale page response");
            return PageOutcome::Discarded;
        }
        let Some(in_flight) = entry.in_flight.take() else {
            return PageOutcome::Discarded;
        };
        self.dirty.insert(key.clone());

        match result {
            Ok(mut page) => {
                page.page_index = page_index;
                match in_flight.mode {
                    FetchMode::Refresh => {
                        entry.pages.clear();
                        entry.pages.push(page.clone());
                    }
                    FetchMode::Load | FetchMode::Revalidate { .. } => {
                        if page_index < entry.pages.len() {
                            entry.pages[page_index] = page.clone();
                        } else if page_index == entry.pages.len() {
                            entry.pages.push(page.clone());
                        } else {
                            error!(%key, page = page_index, loaded = entry.pages.len(), "page arrived out of order");
                            entry.status = FetchStatus::Idle;
                            in_flight.settle(Err(invalid_request(
                                &key,
                                page_index,
                                entry.pages.len(),
                                "page arrived out of order",
                            )));
                            return PageOutcome::Discarded;
                        }
                        if !page.has_more {
                            entry.pages.truncate(page_index + 1);
                        }
                    }
                }
                entry.status = FetchStatus::Idle;
                entry.last_error = None;
                entry.invalidated = false;
                entry.fetched_at = Some(Instant::now());
                debug!(%key, page = page_index, items = page.items.len(), has_more = page.has_more, "page loaded");

                let next = match in_flight.mode {
                    FetchMode::Revalidate { through }
                        if page.has_more && page_index + 1 < through =>
                    {
                        Some((page_index + 1, through))
                    }
                    _ => None,
                };
                in_flight.settle(Ok(page));
                if let Some((next_index, through)) = next {
                    self.start_fetch(&key, next_index, FetchMode::Revalidate { through }, Vec::new());
                }
                PageOutcome::Applied(key)
            }
            Err(err) => {
                warn!(%key, page = page_index, error = %err, "feed fetch failed");
                let failure = SyncError::FetchFailed(err);
                entry.status = FetchStatus::Error;
                entry.last_error = Some(failure.clone());
                in_flight.settle(Err(failure.clone()));
                PageOutcome::Failed(key, failure)
            }
        }
    }

    pub fn find_post(&self, post_id: &str) -> Option<&PostSummary> {
        self.entries
            .values()
            .flat_map(|entry| entry.posts())
            .find(|post| post.id == post_id)
    }

    pub fn keys_containing(&self, post_id: &str) -> Vec<FeedQueryKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.posts().any(|post| post.id == post_id))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Applies `f` to every cached copy of `post_id`; returns how many were touched.
    pub(crate) fn update_post<F>(&mut self, post_id: &str, mut f: F) -> usize
    where
        F: FnMut(&mut PostSummary),
    {
        let mut touched = 0;
        for (key, entry) in self.entries.iter_mut() {
            let mut hit = false;
            for post in entry
                .pages
                .iter_mut()
                .flat_map(|page| page.items.iter_mut())
                .filter(|post| post.id == post_id)
            {
                f(post);
                hit = true;
                touched += 1;
            }
            if hit {
                self.dirty.insert(key.clone());
            }
        }
        touched
    }

    /// Like [`update_post`](Self::update_post) but limited to one entry.
    pub(crate) fn update_post_in<F>(&mut self, key: &FeedQueryKey, post_id: &str, mut f: F) -> usize
    where
        F: FnMut(&mut PostSummary),
    {
        let Some(entry) = self.entries.get_mut(key) else {
            return 0;
        };
        let mut touched = 0;
        for post in entry
            .pages
            .iter_mut()
            .flat_map(|page| page.items.iter_mut())
            .filter(|post| post.id == post_id)
        {
            f(post);
            touched += 1;
        }
        if touched > 0 {
            self.dirty.insert(key.clone());
        }
        touched
    }

    /// Removes `post_id` from every page, or only from `only` when given.
    pub(crate) fn remove_post(
        &mut self,
        post_id: &str,
        only: Option<&FeedQueryKey>,
    ) -> Vec<PostLocation> {
        let mut removed = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if only.map_or(false, |only| only != key) {
                continue;
            }
            for page in entry.pages.iter_mut() {
                while let Some(position) = page.items.iter().position(|post| post.id == post_id) {
                    page.items.remove(position);
                    removed.push(PostLocation {
                        key: key.clone(),
                        page_index: page.page_index,
                        position,
                    });
                }
            }
        }
        for location in &removed {
            self.dirty.insert(location.key.clone());
        }
        removed
    }

    /// Puts `post` back where [`remove_post`](Self::remove_post) found it.
    /// Pages that disappeared meanwhile are skipped.
    pub(crate) fn restore_post(&mut self, post: &PostSummary, locations: &[PostLocation]) -> usize {
        let mut restored = 0;
        for location in locations {
            let Some(entry) = self.entries.get_mut(&location.key) else {
                continue;
            };
            let Some(page) = entry.pages.get_mut(location.page_index) else {
                continue;
            };
            if page.contains(&post.id) {
                continue;
            }
            let position = location.position.min(page.items.len());
            page.items.insert(position, post.clone());
            self.dirty.insert(location.key.clone());
            restored += 1;
        }
        restored
    }

    /// Settles every outstanding ticket with `EngineClosed` and drops all state.
    pub(crate) fn teardown(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(in_flight) = entry.in_flight.take() {
                in_flight.settle(Err(SyncError::EngineClosed));
            }
        }
        self.entries.clear();
        self.subscriptions.clear();
        self.dirty.clear();
    }

    /// Refetches the loaded pages of `key` in order, replacing each in place.
    /// `Ok(false)` when nothing is loaded yet or a fetch is already running.
    pub fn revalidate(&mut self, key: &FeedQueryKey) -> Result<bool, SyncError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| SyncError::UnknownEntry(key.clone()))?;
        if entry.in_flight.is_some() || entry.pages.is_empty() {
            return Ok(false);
        }
        let through = entry.pages.len();
        debug!(%key, pages = through, "revalidating entry");
        self.start_fetch(key, 0, FetchMode::Revalidate { through }, Vec::new());
        Ok(true)
    }

    fn active_keys(&self) -> HashSet<FeedQueryKey> {
        self.subscriptions
            .values()
            .map(|sub| sub.key.clone())
            .collect()
    }

    fn start_fetch(
        &mut self,
        key: &FeedQueryKey,
        page_index: usize,
        mode: FetchMode,
        followers: Vec<Ticket<FeedPage>>,
    ) -> Ticket<FeedPage> {
        let request_id = self.next_request;
        self.next_request += 1;
        let ticket = Ticket::pending();

        let gateway = Arc::clone(&self.gateway);
        let tx = self.completions.clone();
        let job_key = key.clone();
        let page_size = self.page_size;
        let queued = self.spawner.spawn(move || {
            let result = gateway.fetch_feed_page(&job_key, page_index, page_size);
            let _ = tx.send(Completion::Page(PageCompletion {
                key: job_key,
                request_id,
                page_index,
                result,
            }));
        });

        let in_flight = InFlight {
            request_id,
            page_index,
            mode,
            ticket: ticket.clone(),
            followers,
        };
        if !queued {
            warn!(%key, "executor is gone; fetch not started");
            in_flight.settle(Err(SyncError::EngineClosed));
            return ticket;
        }

        self.fetches_started += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.status = FetchStatus::Fetching;
            entry.in_flight = Some(in_flight);
        }
        self.dirty.insert(key.clone());
        debug!(%key, page = page_index, request = request_id, ?mode, "fetch started");
        ticket
    }
}

fn invalid_request(
    key: &FeedQueryKey,
    requested: usize,
    loaded: usize,
    reason: &'static str,
) -> SyncError {
    error!(%key, requested, loaded, reason, "invalid page request");
    SyncError::InvalidPageRequest {
        key: key.clone(),
        requested,
        loaded,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Executor;
    use crate::gateway::MockGateway;
    use crate::model::{sample_post, SortOption};
    use crossbeam_channel::{unbounded, Receiver};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Harness {
        store: CacheStore,
        gateway: Arc<MockGateway>,
        rx: Receiver<Completion>,
        _executor: Executor,
    }

    impl Harness {
        fn new(options: SyncOptions) -> Self {
            let posts = (1..=5)
                .map(|n| sample_post(&format!("p{n}"), n as i64))
                .collect();
            let gateway = Arc::new(MockGateway::new(posts, Vec::new()));
            let executor = Executor::new(2);
            let (tx, rx) = unbounded();
            let store = CacheStore::new(&options, gateway.clone(), executor.spawner(), tx);
            Self {
                store,
                gateway,
                rx,
                _executor: executor,
            }
        }

        fn pump(&mut self) -> Option<PageOutcome> {
            match self.rx.recv_timeout(Duration::from_secs(2)).ok()? {
                Completion::Page(page) => Some(self.store.apply_page(page)),
                Completion::Mutation(_) => None,
            }
        }
    }

    fn options(page_size: usize) -> SyncOptions {
        SyncOptions {
            page_size,
            ..SyncOptions::default()
        }
    }

    fn key() -> FeedQueryKey {
        FeedQueryKey::new(SortOption::Recent, "", "u1")
    }

    #[test]
    fn get_or_create_starts_idle_and_empty() {
        let mut h = Harness::new(options(2));
        let entry = h.store.get_or_create(&key());
        assert!(entry.pages().is_empty());
        assert_eq!(entry.status(), FetchStatus::Idle);
        assert!(entry.has_more());
    }

    #[test]
    fn pages_append_in_order() {
        let mut h = Harness::new(options(2));
        let k = key();
        for expected in 0..3 {
            let ticket = h.store.load_more(&k).unwrap().unwrap();
            assert!(matches!(h.pump(), Some(PageOutcome::Applied(_))));
            assert_eq!(ticket.try_result().unwrap().unwrap().page_index, expected);
        }
        let entry = h.store.entry(&k).unwrap();
        assert_eq!(entry.pages().len(), 3);
        for (i, page) in entry.pages().iter().enumerate() {
            assert_eq!(page.page_index, i);
        }
        assert!(!entry.has_more());
        assert!(h.store.load_more(&k).unwrap().is_none());
        assert!(matches!(
            h.store.load_page(&k, 3),
            Err(SyncError::InvalidPageRequest { .. })
        ));
    }

    #[test]
    fn rejects_out_of_order_requests() {
        let mut h = Harness::new(options(2));
        let k = key();
        let err = h.store.load_page(&k, 1).unwrap_err();
        assert!(matches!(err, SyncError::InvalidPageRequest { requested: 1, loaded: 0, .. }));

        let _first = h.store.load_page(&k, 0).unwrap();
        let err = h.store.load_page(&k, 1).unwrap_err();
        assert!(matches!(err, SyncError::InvalidPageRequest { requested: 1, .. }));
    }

    #[test]
    fn concurrent_loads_share_one_fetch() {
        let mut h = Harness::new(options(2));
        let k = key();
        let a = h.store.load_page(&k, 0).unwrap();
        let b = h.store.load_page(&k, 0).unwrap();
        assert!(a.same(&b));
        h.pump();
        assert_eq!(h.gateway.fetch_calls(), 1);
        assert_eq!(a.try_result(), b.try_result());
    }

    #[test]
    fn fresh_pages_are_served_from_cache() {
        let mut h = Harness::new(options(2));
        let k = key();
        h.store.load_page(&k, 0).unwrap();
        h.pump();
        let cached = h.store.load_page(&k, 0).unwrap();
        assert!(cached.is_settled());
        assert_eq!(h.gateway.fetch_calls(), 1);

        h.store.invalidate(|candidate| candidate == &k);
        assert!(!h.store.entry(&k).unwrap().pages().is_empty());
        let refetch = h.store.load_page(&k, 0).unwrap();
        assert!(!refetch.is_settled());
        h.pump();
        assert_eq!(h.gateway.fetch_calls(), 2);
        assert!(!h.store.entry(&k).unwrap().is_invalidated());
    }

    #[test]
    fn failed_fetch_keeps_prior_pages() {
        let mut h = Harness::new(options(2));
        let k = key();
        h.store.load_more(&k).unwrap();
        h.pump();
        h.gateway.fail_next_fetch(GatewayError::Server {
            status: 500,
            message: "boom".into(),
        });
        let ticket = h.store.load_more(&k).unwrap().unwrap();
        assert!(matches!(h.pump(), Some(PageOutcome::Failed(_, _))));
        assert!(matches!(ticket.try_result(), Some(Err(SyncError::FetchFailed(_)))));
        let entry = h.store.entry(&k).unwrap();
        assert_eq!(entry.status(), FetchStatus::Error);
        assert_eq!(entry.pages().len(), 1);
        assert!(entry.last_error().is_some());
    }

    #[test]
    fn refresh_supersedes_in_flight_fetch() {
        let mut h = Harness::new(options(2));
        let k = key();
        let first = h.store.refresh(&k);
        let second = h.store.refresh(&k);
        assert!(!first.same(&second));

        let outcomes = [h.pump(), h.pump()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Some(PageOutcome::Discarded)))
                .count(),
            1
        );
        assert_eq!(h.store.stale_pages_discarded(), 1);
        assert_eq!(first.try_result(), second.try_result());
        assert_eq!(h.store.entry(&k).unwrap().pages().len(), 1);
    }

    #[test]
    fn refresh_supersedes_an_in_flight_load() {
        let mut h = Harness::new(options(2));
        let k = key();
        h.store.load_more(&k).unwrap();
        h.pump();
        let load = h.store.load_more(&k).unwrap().unwrap();
        let refresh = h.store.refresh(&k);

        let outcomes = [h.pump(), h.pump()];
        assert!(outcomes.iter().any(|o| matches!(o, Some(PageOutcome::Discarded))));
        assert_eq!(h.store.stale_pages_discarded(), 1);
        let entry = h.store.entry(&k).unwrap();
        assert_eq!(entry.pages().len(), 1);
        assert_eq!(entry.status(), FetchStatus::Idle);
        assert_eq!(load.try_result(), refresh.try_result());
        assert_eq!(refresh.try_result().unwrap().unwrap().page_index, 0);
    }

    #[test]
    fn refresh_replaces_all_pages_on_arrival() {
        let mut h = Harness::new(options(2));
        let k = key();
        h.store.load_more(&k).unwrap();
        h.pump();
        h.store.load_more(&k).unwrap();
        h.pump();
        h.store.refresh(&k);
        // Previously loaded pages stay visible until the refresh lands.
        assert_eq!(h.store.entry(&k).unwrap().pages().len(), 2);
        h.pump();
        let entry = h.store.entry(&k).unwrap();
        assert_eq!(entry.pages().len(), 1);
        let ids: Vec<&str> = entry.posts().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[test]
    fn subscribers_see_changes() {
        let mut h = Harness::new(options(2));
        let k = key();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let id = h.store.subscribe(
            &k,
            Box::new(move |entry| sink.borrow_mut().push(entry.posts().count())),
        );
        assert_eq!(*seen.borrow(), vec![0]);
        h.store.load_more(&k).unwrap();
        h.store.flush_notifications();
        h.pump();
        h.store.flush_notifications();
        assert_eq!(seen.borrow().last(), Some(&2));
        assert_eq!(h.store.subscriber_count(&k), 1);
        assert!(h.store.unsubscribe(id));
        assert_eq!(h.store.subscriber_count(&k), 0);
    }

    #[test]
    fn invalidating_a_watched_entry_revalidates_in_place() {
        let mut h = Harness::new(options(2));
        let k = key();
        h.store.load_more(&k).unwrap();
        h.pump();
        h.store.load_more(&k).unwrap();
        h.pump();
        h.store.subscribe(&k, Box::new(|_| {}));
        h.gateway.insert_post(sample_post("p0", 0));

        h.store.invalidate(|_| true);
        assert_eq!(h.store.entry(&k).unwrap().status(), FetchStatus::Fetching);
        h.pump();
        h.pump();
        let entry = h.store.entry(&k).unwrap();
        let ids: Vec<&str> = entry.posts().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p0", "p1", "p2", "p3"]);
        assert_eq!(entry.status(), FetchStatus::Idle);
        assert_eq!(h.gateway.fetch_calls(), 4);
    }

    #[test]
    fn revalidate_requires_a_loaded_entry() {
        let mut h = Harness::new(options(2));
        let k = key();
        assert_eq!(h.store.revalidate(&k), Err(SyncError::UnknownEntry(k.clone())));
        h.store.get_or_create(&k);
        assert_eq!(h.store.revalidate(&k), Ok(false));
        h.store.load_more(&k).unwrap();
        h.pump();
        assert_eq!(h.store.revalidate(&k), Ok(true));
        assert_eq!(h.store.revalidate(&k), Ok(false));
        h.pump();
        assert_eq!(h.gateway.fetch_calls(), 2);
    }

    #[test]
    fn sweep_respects_subscribers_and_pins() {
        let mut h = Harness::new(SyncOptions {
            page_size: 2,
            stale_after: Duration::from_secs(1),
            evict_after: Duration::from_secs(5),
            ..SyncOptions::default()
        });
        let watched = key();
        let pinned = FeedQueryKey::new(SortOption::Oldest, "", "u1");
        let idle = FeedQueryKey::new(SortOption::Likes, "", "u1");
        for k in [&watched, &pinned, &idle] {
            h.store.load_more(k).unwrap();
            h.pump();
        }
        h.store.subscribe(&watched, Box::new(|_| {}));
        let pins: HashSet<FeedQueryKey> = [pinned.clone()].into_iter().collect();

        assert_eq!(h.store.sweep(Instant::now(), &pins), 0);
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(h.store.sweep(later, &pins), 1);
        assert!(h.store.entry(&idle).is_none());
        assert!(h.store.entry(&watched).is_some());
        assert!(h.store.entry(&pinned).is_some());
    }

    #[test]
    fn remove_and_restore_post_positions() {
        let mut h = Harness::new(options(3));
        let k = key();
        h.store.load_more(&k).unwrap();
        h.pump();
        let post = h.store.find_post("p2").unwrap().clone();
        let locations = h.store.remove_post("p2", None);
        assert_eq!(locations.len(), 1);
        assert!(h.store.find_post("p2").is_none());
        assert_eq!(h.store.restore_post(&post, &locations), 1);
        let ids: Vec<&str> = h.store.entry(&k).unwrap().posts().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }
}
