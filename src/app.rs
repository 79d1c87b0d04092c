use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;

use crate::api::{ClientConfig, HttpGateway};
use crate::config::{self, SyncOptions};
use crate::engine::{SyncEngine, SyncEvent};
use crate::error::GatewayError;
use crate::gateway::MockGateway;
use crate::mention::Key;
use crate::model::{sort_option_from_key, FeedPage, FeedQueryKey, PostSummary, SortOption, UserSummary};

const DEMO_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FeedArgs {
    pub sort: SortOption,
    pub tag: String,
    pub viewer: String,
    pub pages: usize,
    pub config_file: Option<PathBuf>,
}

impl Default for FeedArgs {
    fn default() -> Self {
        Self {
            sort: SortOption::Recent,
            tag: String::new(),
            viewer: String::new(),
            pages: 1,
            config_file: None,
        }
    }
}

impl FeedArgs {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut parsed = FeedArgs::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = |flag: &str| {
                iter.next()
                    .cloned()
                    .with_context(|| format!("{flag} needs a value"))
            };
            match arg.as_str() {
                "--sort" => parsed.sort = sort_option_from_key(&value("--sort")?),
                "--tag" => parsed.tag = value("--tag")?,
                "--viewer" => parsed.viewer = value("--viewer")?,
                "--pages" => {
                    let raw = value("--pages")?;
                    parsed.pages = raw
                        .parse()
                        .with_context(|| format!("--pages expects a number, got {raw}"))?;
                }
                "--config" => parsed.config_file = Some(PathBuf::from(value("--config")?)),
                other => return Err(anyhow!("unknown feed option: {other}")),
            }
        }
        Ok(parsed)
    }
}

/// Loads pages of one feed from the configured backend and prints them.
pub fn run_feed(args: FeedArgs) -> Result<()> {
    let config_file = args.config_file.clone();
    let display_path = friendly_path(config_file.clone().or_else(config::default_path).as_ref());
    let cfg = config::load(config::LoadOptions {
        config_file,
        env_prefix: None,
    })
    .with_context(|| format!("load config from {display_path}"))?;

    let gateway = HttpGateway::new(ClientConfig {
        base_url: Some(cfg.gateway.base_url.clone()),
        user_agent: cfg.gateway.user_agent.clone(),
        timeout: Some(cfg.gateway.timeout),
        auth_token: Some(cfg.gateway.auth_token.clone()),
        http_client: None,
    })
    .context("build api client")?;
    println!("Feed from {} (config: {display_path})", gateway.base_url());

    let mut engine = SyncEngine::new(cfg.sync_options(), Arc::new(gateway))?;
    let key = FeedQueryKey::new(args.sort, &args.tag, &args.viewer);
    let wait = cfg.gateway.timeout + Duration::from_secs(1);
    for _ in 0..args.pages.max(1) {
        let Some(ticket) = engine.load_more(&key)? else {
            println!("(end of feed)");
            break;
        };
        let page = engine
            .wait_for(&ticket, wait)
            .ok_or_else(|| anyhow!("timed out waiting for {key}"))??;
        print_page(&page, &args.viewer);
    }
    engine.teardown();
    Ok(())
}

/// Walks the paging, optimistic rollback and mention flows against an
/// in-memory backend.
pub fn run_demo() -> Result<()> {
    let gateway = Arc::new(MockGateway::new(demo_posts(), demo_users()));
    let options = SyncOptions {
        page_size: 2,
        debounce: Duration::from_millis(50),
        ..SyncOptions::default()
    };
    let mut engine = SyncEngine::new(options, gateway.clone())?;
    let key = FeedQueryKey::new(SortOption::Recent, "", "u1");

    println!("== paging {key}");
    engine.subscribe(&key, |entry| {
        tracing::debug!(key = %entry.key(), pages = entry.pages().len(), "entry changed");
    });
    for _ in 0..2 {
        if let Some(ticket) = engine.load_more(&key)? {
            let page = engine
                .wait_for(&ticket, DEMO_WAIT)
                .ok_or_else(|| anyhow!("page load timed out"))??;
            print_page(&page, "u1");
        }
    }
    let refreshed = engine.refresh(&key);
    let page = engine
        .wait_for(&refreshed, DEMO_WAIT)
        .ok_or_else(|| anyhow!("refresh timed out"))??;
    println!("after refresh: {} page(s)", engine.entry(&key).map_or(0, |e| e.pages().len()));
    print_page(&page, "u1");

    println!("== optimistic like with a failing server");
    gateway.fail_next_mutation(GatewayError::Network("connection reset".into()));
    let handle = engine.like("p1", "u1");
    println!("optimistic: p1 liked = {}", liked(&engine, "p1", "u1"));
    let outcome = engine.wait_for(handle.ticket(), DEMO_WAIT);
    println!(
        "settled: {} ; p1 liked = {}",
        match outcome {
            Some(Ok(_)) => "committed".to_string(),
            Some(Err(err)) => format!("rolled back ({err})"),
            None => "still pending".to_string(),
        },
        liked(&engine, "p1", "u1")
    );
    for event in engine.drain_events() {
        if let SyncEvent::MutationFailed { post_id, kind, error } = event {
            println!("notify: {kind} on {post_id} failed: {error}");
        }
    }

    println!("== mention autocomplete");
    let mention = engine.mention();
    mention.on_text_change("thanks @al", 10);
    mention.poll_timeout(DEMO_WAIT);
    let view = mention.view();
    for (i, user) in view.candidates.iter().enumerate() {
        let marker = if i == view.selected_index { ">" } else { " " };
        println!("{marker} {} <{}>", user.name, user.email);
    }
    let outcome = mention.on_key_down(Key::Enter);
    println!("draft: {:?}", outcome.view.text);
    let tags = mention.take_tags();
    let handle = engine.edit_tags("p2", "u1", tags);
    match engine.wait_for(handle.ticket(), DEMO_WAIT) {
        Some(Ok(Some(post))) => println!("p2 tags: {}", describe_tags(&post)),
        Some(Ok(None)) | None => println!("p2 tags: unchanged"),
        Some(Err(err)) => println!("tag edit failed: {err}"),
    }

    let telemetry = engine.telemetry();
    println!(
        "fetches={} mutations={} searches={}",
        telemetry.fetches_started, telemetry.mutations_dispatched, telemetry.searches_issued
    );
    engine.teardown();
    Ok(())
}

fn liked(engine: &SyncEngine, post_id: &str, viewer: &str) -> bool {
    engine
        .find_post(post_id)
        .map_or(false, |post| post.is_liked_by(viewer))
}

fn print_page(page: &FeedPage, viewer: &str) {
    println!("page {} (has_more={})", page.page_index, page.has_more);
    for post in &page.items {
        let heart = if post.is_liked_by(viewer) { "*" } else { " " };
        let headline = post
            .title
            .as_deref()
            .unwrap_or_else(|| post.content.lines().next().unwrap_or_default());
        println!(
            "  {heart} {:<6} likes={:<3} comments={:<3} {}",
            post.id,
            post.like_count(),
            post.comment_count,
            headline
        );
    }
}

fn describe_tags(post: &PostSummary) -> String {
    post.tags
        .iter()
        .map(|tag| format!("@{}({})", tag.username, tag.user_id))
        .collect::<Vec<_>>()
        .join(", ")
}

fn demo_posts() -> Vec<PostSummary> {
    (1..=5)
        .map(|n| PostSummary {
            id: format!("p{n}"),
            author_id: "u2".to_string(),
            title: None,
            content: format!("Post number {n}"),
            like_ids: Default::default(),
            comment_count: n as u64,
            created_at: Utc::now() - chrono::Duration::minutes(n),
            topics: Vec::new(),
            tags: Vec::new(),
        })
        .collect()
}

fn demo_users() -> Vec<UserSummary> {
    [("1", "Alice"), ("2", "Alina"), ("3", "Bob")]
        .into_iter()
        .map(|(id, name)| UserSummary {
            id: id.to_string(),
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
        })
        .collect()
}

fn friendly_path(path: Option<&PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/feedsync/config.yaml".to_string()
    }
}
