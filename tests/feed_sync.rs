use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use feedsync::config::SyncOptions;
use feedsync::gateway::{Gateway, MockGateway};
use feedsync::mention::Phase;
use feedsync::model::{
    FeedPage, FeedQueryKey, MutationKind, MutationPayload, PostSummary, SortOption, UserSummary,
};
use feedsync::{GatewayError, SyncEngine, SyncError, SyncEvent};

const WAIT: Duration = Duration::from_secs(5);

fn post(id: &str, minutes_ago: i64) -> PostSummary {
    PostSummary {
        id: id.to_string(),
        author_id: "author".to_string(),
        title: None,
        content: format!("content of {id}"),
        like_ids: BTreeSet::new(),
        comment_count: 0,
        created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        topics: Vec::new(),
        tags: Vec::new(),
    }
}

fn user(id: &str, name: &str) -> UserSummary {
    UserSummary {
        id: id.to_string(),
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
    }
}

fn five_posts() -> Vec<PostSummary> {
    (1..=5).map(|n| post(&format!("p{n}"), n)).collect()
}

fn options() -> SyncOptions {
    SyncOptions {
        page_size: 2,
        workers: 2,
        debounce: Duration::from_millis(20),
        ..SyncOptions::default()
    }
}

fn recent() -> FeedQueryKey {
    FeedQueryKey::new(SortOption::Recent, "", "u1")
}

fn ids(engine: &SyncEngine, key: &FeedQueryKey) -> Vec<String> {
    engine
        .entry(key)
        .map(|entry| entry.posts().map(|p| p.id.clone()).collect())
        .unwrap_or_default()
}

fn load_next(engine: &mut SyncEngine, key: &FeedQueryKey) -> FeedPage {
    let ticket = engine.load_more(key).unwrap().expect("feed has more pages");
    engine.wait_for(&ticket, WAIT).expect("page arrived").unwrap()
}

/// Gateway whose calls block until the test opens a gate for them.
struct GatedGateway {
    inner: MockGateway,
    fetch_gates: Mutex<VecDeque<Receiver<()>>>,
    mutation_gates: Mutex<VecDeque<Receiver<()>>>,
    search_gates: Mutex<HashMap<String, Receiver<()>>>,
}

impl GatedGateway {
    fn new(posts: Vec<PostSummary>, users: Vec<UserSummary>) -> Self {
        Self {
            inner: MockGateway::new(posts, users),
            fetch_gates: Mutex::new(VecDeque::new()),
            mutation_gates: Mutex::new(VecDeque::new()),
            search_gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate_next_fetch(&self) -> Sender<()> {
        let (tx, rx) = bounded(1);
        self.fetch_gates.lock().push_back(rx);
        tx
    }

    fn gate_next_mutation(&self) -> Sender<()> {
        let (tx, rx) = bounded(1);
        self.mutation_gates.lock().push_back(rx);
        tx
    }

    fn gate_search(&self, query: &str) -> Sender<()> {
        let (tx, rx) = bounded(1);
        self.search_gates.lock().insert(query.to_string(), rx);
        tx
    }
}

fn pass(gate: Option<Receiver<()>>) {
    if let Some(gate) = gate {
        let _ = gate.recv_timeout(WAIT);
    }
}

impl Gateway for GatedGateway {
    fn fetch_feed_page(
        &self,
        key: &FeedQueryKey,
        page_index: usize,
        page_size: usize,
    ) -> Result<FeedPage, GatewayError> {
        let gate = self.fetch_gates.lock().pop_front();
        pass(gate);
        self.inner.fetch_feed_page(key, page_index, page_size)
    }

    fn post_mutation(
        &self,
        kind: MutationKind,
        target_post_id: &str,
        payload: &MutationPayload,
        viewer_id: &str,
    ) -> Result<Option<PostSummary>, GatewayError> {
        let gate = self.mutation_gates.lock().pop_front();
        pass(gate);
        self.inner
            .post_mutation(kind, target_post_id, payload, viewer_id)
    }

    fn search_users(&self, query: &str, limit: usize) -> Result<Vec<UserSummary>, GatewayError> {
        let gate = self.search_gates.lock().remove(query);
        pass(gate);
        self.inner.search_users(query, limit)
    }
}

#[test]
fn scenario_load_more_twice_then_refresh() {
    let gateway = Arc::new(MockGateway::new(five_posts(), Vec::new()));
    let mut engine = SyncEngine::new(options(), gateway.clone()).unwrap();
    let key = recent();

    let first = load_next(&mut engine, &key);
    assert!(first.has_more);
    assert_eq!(ids(&engine, &key), vec!["p1", "p2"]);

    let second = load_next(&mut engine, &key);
    assert!(second.has_more);
    assert_eq!(ids(&engine, &key), vec!["p1", "p2", "p3", "p4"]);

    let refreshed = engine.refresh(&key);
    engine.wait_for(&refreshed, WAIT).unwrap().unwrap();
    let entry = engine.entry(&key).unwrap();
    assert_eq!(entry.pages().len(), 1);
    assert_eq!(ids(&engine, &key), vec!["p1", "p2"]);
    assert_eq!(gateway.fetch_calls(), 3);
    engine.teardown();
}

#[test]
fn pagination_is_monotonic_until_exhausted() {
    let gateway = Arc::new(MockGateway::new(five_posts(), Vec::new()));
    let mut engine = SyncEngine::new(options(), gateway).unwrap();
    let key = recent();

    for n in 1..=3 {
        load_next(&mut engine, &key);
        let entry = engine.entry(&key).unwrap();
        assert_eq!(entry.pages().len(), n);
        for (i, page) in entry.pages().iter().enumerate() {
            assert_eq!(page.page_index, i);
        }
    }
    assert!(!engine.entry(&key).unwrap().has_more());
    assert!(engine.load_more(&key).unwrap().is_none());
    assert!(matches!(
        engine.load_page(&key, 5),
        Err(SyncError::InvalidPageRequest { .. })
    ));
}

#[test]
fn concurrent_first_page_loads_hit_the_network_once() {
    let gateway = Arc::new(MockGateway::new(five_posts(), Vec::new()));
    let mut engine = SyncEngine::new(options(), gateway.clone()).unwrap();
    let key = recent();

    let a = engine.load_page(&key, 0).unwrap();
    let b = engine.load_page(&key, 0).unwrap();
    assert!(a.same(&b));
    let page = engine.wait_for(&b, WAIT).unwrap().unwrap();
    assert_eq!(a.try_result(), Some(Ok(page)));
    assert_eq!(gateway.fetch_calls(), 1);
}

#[test]
fn failed_like_rolls_back_and_notifies() {
    let gateway = Arc::new(MockGateway::new(five_posts(), Vec::new()));
    let mut engine = SyncEngine::new(options(), gateway.clone()).unwrap();
    let key = recent();
    load_next(&mut engine, &key);

    let observed = Rc::new(RefCell::new(Vec::new()));
    let sink = observed.clone();
    engine.subscribe(&key, move |entry| {
        let liked = entry
            .posts()
            .find(|p| p.id == "p1")
            .map_or(false, |p| p.is_liked_by("u1"));
        sink.borrow_mut().push(liked);
    });

    gateway.fail_next_mutation(GatewayError::Network("reset".into()));
    let handle = engine.like("p1", "u1");
    assert!(engine.find_post("p1").unwrap().like_ids.contains("u1"));

    let result = engine.wait_for(handle.ticket(), WAIT).unwrap();
    assert!(matches!(result, Err(SyncError::MutationFailed(GatewayError::Network(_)))));
    assert!(engine.find_post("p1").unwrap().like_ids.is_empty());
    assert_eq!(*observed.borrow(), vec![false, true, false]);

    let events = engine.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        SyncEvent::MutationFailed { post_id, kind: MutationKind::Like, .. } if post_id == "p1"
    ));
}

#[test]
fn back_to_back_toggle_makes_at_most_one_call() {
    let gateway = Arc::new(MockGateway::new(five_posts(), Vec::new()));
    let mut engine = SyncEngine::new(options(), gateway.clone()).unwrap();
    load_next(&mut engine, &recent());

    let like = engine.like("p2", "u1");
    let unlike = engine.unlike("p2", "u1");
    assert_eq!(like.mutation_id(), unlike.mutation_id());
    engine.wait_for(unlike.ticket(), WAIT).unwrap().unwrap();

    assert!(gateway.mutation_calls() <= 1);
    assert!(!engine.find_post("p2").unwrap().is_liked_by("u1"));
    assert!(!gateway.post("p2").unwrap().is_liked_by("u1"));
}

#[test]
fn toggle_during_flight_converges_on_last_intent() {
    let gateway = Arc::new(GatedGateway::new(five_posts(), Vec::new()));
    let mut engine = SyncEngine::new(options(), gateway.clone()).unwrap();
    load_next(&mut engine, &recent());

    let release = gateway.gate_next_mutation();
    let handle = engine.like("p3", "u1");
    engine.poll();
    engine.unlike("p3", "u1");
    assert!(!engine.find_post("p3").unwrap().is_liked_by("u1"));

    release.send(()).unwrap();
    engine.wait_for(handle.ticket(), WAIT).unwrap().unwrap();

    let calls = gateway.inner.mutations();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].kind, MutationKind::Like);
    assert_eq!(calls[1].kind, MutationKind::Unlike);
    assert!(!engine.find_post("p3").unwrap().is_liked_by("u1"));
    assert!(!gateway.inner.post("p3").unwrap().is_liked_by("u1"));
}

#[test]
fn superseded_refresh_result_is_ignored() {
    let gateway = Arc::new(GatedGateway::new(five_posts(), Vec::new()));
    let mut engine = SyncEngine::new(options(), gateway.clone()).unwrap();
    let key = recent();

    let older_gate = gateway.gate_next_fetch();
    let older = engine.refresh(&key);
    // Let the first fetch reach its gate before queueing the second.
    let started = Instant::now();
    while gateway.fetch_gates.lock().len() == 1 && started.elapsed() < WAIT {
        std::thread::sleep(Duration::from_millis(5));
    }
    let newer = engine.refresh(&key);

    engine.wait_for(&newer, WAIT).unwrap().unwrap();
    assert_eq!(ids(&engine, &key), vec!["p1", "p2"]);

    gateway.inner.insert_post(post("p0", 0));
    older_gate.send(()).unwrap();
    let deadline = Instant::now() + WAIT;
    while engine.telemetry().stale_pages_discarded == 0 && Instant::now() < deadline {
        engine.poll_timeout(Duration::from_millis(50));
    }

    assert_eq!(engine.telemetry().stale_pages_discarded, 1);
    assert_eq!(ids(&engine, &key), vec!["p1", "p2"]);
    assert_eq!(older.try_result(), newer.try_result());
}

#[test]
fn slow_earlier_search_never_overwrites_later_results() {
    let users = vec![user("1", "Alfred"), user("2", "Alice"), user("3", "Alicia")];
    let gateway = Arc::new(GatedGateway::new(Vec::new(), users));
    let mut engine = SyncEngine::new(options(), gateway.clone()).unwrap();
    let release_al = gateway.gate_search("al");
    let release_ali = gateway.gate_search("ali");
    let later = || Instant::now() + Duration::from_secs(1);

    let mention = engine.mention();
    mention.on_text_change("@al", 3);
    assert!(mention.tick(later()));
    mention.on_text_change("@ali", 4);
    assert!(mention.tick(later()));
    assert_eq!(mention.searches_issued(), 2);

    release_ali.send(()).unwrap();
    let deadline = Instant::now() + WAIT;
    while mention.phase() != Phase::Suggesting && Instant::now() < deadline {
        mention.poll_timeout(Duration::from_millis(50));
    }
    release_al.send(()).unwrap();
    while mention.stale_discarded() == 0 && Instant::now() < deadline {
        mention.poll_timeout(Duration::from_millis(50));
    }

    let view = mention.view();
    assert_eq!(view.query, "ali");
    let names: Vec<&str> = view.candidates.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Alicia"]);
    assert_eq!(engine.telemetry().stale_searches_discarded, 1);
}
