use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::GatewayError;
use crate::model::{
    FeedPage, FeedQueryKey, MutationKind, MutationPayload, PostSummary, SortOption, UserSummary,
};

/// Remote source of feed pages, mutations and user search.
///
/// Implementations block; the engine only ever calls them from worker threads.
pub trait Gateway: Send + Sync {
    fn fetch_feed_page(
        &self,
        key: &FeedQueryKey,
        page_index: usize,
        page_size: usize,
    ) -> Result<FeedPage, GatewayError>;

    fn post_mutation(
        &self,
        kind: MutationKind,
        target_post_id: &str,
        payload: &MutationPayload,
        viewer_id: &str,
    ) -> Result<Option<PostSummary>, GatewayError>;

    fn search_users(&self, query: &str, limit: usize) -> Result<Vec<UserSummary>, GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationCall {
    pub kind: MutationKind,
    pub post_id: String,
    pub viewer_id: String,
    pub payload: MutationPayload,
}

#[derive(Default)]
struct MockState {
    posts: Vec<PostSummary>,
    users: Vec<UserSummary>,
    fetch_failures: VecDeque<GatewayError>,
    mutation_failures: VecDeque<GatewayError>,
    search_failures: VecDeque<GatewayError>,
    mutations: Vec<MutationCall>,
}

/// In-memory gateway that pages, sorts and mutates like the REST backend.
///
/// Posts are filtered by topic, sorted per [`SortOption`] and sliced into
/// pages. Failures can be queued per operation; each queued error fails the
/// next call of that kind.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
    latency: Option<Duration>,
    fetch_calls: AtomicUsize,
    mutation_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new(posts: Vec<PostSummary>, users: Vec<UserSummary>) -> Self {
        Self {
            state: Mutex::new(MockState {
                posts,
                users,
                ..MockState::default()
            }),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_next_fetch(&self, error: GatewayError) {
        self.state.lock().fetch_failures.push_back(error);
    }

    pub fn fail_next_mutation(&self, error: GatewayError) {
        self.state.lock().mutation_failures.push_back(error);
    }

    pub fn fail_next_search(&self, error: GatewayError) {
        self.state.lock().search_failures.push_back(error);
    }

    pub fn insert_post(&self, post: PostSummary) {
        self.state.lock().posts.insert(0, post);
    }

    pub fn post(&self, id: &str) -> Option<PostSummary> {
        self.state.lock().posts.iter().find(|p| p.id == id).cloned()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn mutations(&self) -> Vec<MutationCall> {
        self.state.lock().mutations.clone()
    }

    fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
    }
}

impl Gateway for MockGateway {
    fn fetch_feed_page(
        &self,
        key: &FeedQueryKey,
        page_index: usize,
        page_size: usize,
    ) -> Result<FeedPage, GatewayError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency();
        let mut state = self.state.lock();
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }

        let mut posts: Vec<PostSummary> = state
            .posts
            .iter()
            .filter(|post| !key.has_tag_filter() || post.has_topic(&key.tag))
            .cloned()
            .collect();
        match key.sort {
            SortOption::Recent => posts.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            SortOption::Oldest => posts.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            SortOption::Likes => posts.sort_by(|a, b| b.like_count().cmp(&a.like_count())),
        }

        let page_size = page_size.max(1);
        let start = (page_index * page_size).min(posts.len());
        let end = (start + page_size).min(posts.len());
        Ok(FeedPage {
            page_index,
            items: posts[start..end].to_vec(),
            has_more: end < posts.len(),
        })
    }

    fn post_mutation(
        &self,
        kind: MutationKind,
        target_post_id: &str,
        payload: &MutationPayload,
        viewer_id: &str,
    ) -> Result<Option<PostSummary>, GatewayError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency();
        let mut state = self.state.lock();
        state.mutations.push(MutationCall {
            kind,
            post_id: target_post_id.to_string(),
            viewer_id: viewer_id.to_string(),
            payload: payload.clone(),
        });
        if let Some(err) = state.mutation_failures.pop_front() {
            return Err(err);
        }

        let Some(index) = state.posts.iter().position(|p| p.id == target_post_id) else {
            return Err(GatewayError::Conflict(format!(
                "post {target_post_id} no longer exists"
            )));
        };

        match kind {
            MutationKind::Delete => {
                state.posts.remove(index);
                Ok(None)
            }
            MutationKind::Like => {
                let post = &mut state.posts[index];
                post.like_ids.insert(viewer_id.to_string());
                Ok(Some(post.clone()))
            }
            MutationKind::Unlike => {
                let post = &mut state.posts[index];
                post.like_ids.remove(viewer_id);
                Ok(Some(post.clone()))
            }
            MutationKind::Edit => {
                let post = &mut state.posts[index];
                if let MutationPayload::Edit(edit) = payload {
                    edit.apply_to(post);
                }
                Ok(Some(post.clone()))
            }
        }
    }

    fn search_users(&self, query: &str, limit: usize) -> Result<Vec<UserSummary>, GatewayError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency();
        let needle = query.to_lowercase();
        let mut state = self.state.lock();
        if let Some(err) = state.search_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .users
            .iter()
            .filter(|user| {
                user.name.to_lowercase().contains(&needle)
                    || user.email.to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}
