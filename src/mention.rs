use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use tracing::{debug, warn};

use crate::config::SyncOptions;
use crate::dispatch::Spawner;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::model::{MentionTag, UserSummary};

/// Raw results requested per candidate slot; ranking happens locally.
const SEARCH_OVERFETCH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Triggered,
    Searching,
    Suggesting,
    Committed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    ArrowDown,
    ArrowUp,
    Enter,
    Escape,
    Other,
}

/// Text buffer being composed plus the mentions committed into it.
///
/// `cursor` and tag anchors are character offsets. Tags are not shifted when
/// the text around them changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub cursor: usize,
    pub tags: Vec<MentionTag>,
}

impl Draft {
    /// Tags whose `@username` no longer sits at their anchor.
    pub fn dangling_tags(&self) -> Vec<&MentionTag> {
        let chars: Vec<char> = self.text.chars().collect();
        self.tags
            .iter()
            .filter(|tag| {
                let expected: Vec<char> = format!("@{}", tag.username).chars().collect();
                let end = tag.anchor_offset + expected.len();
                end > chars.len() || chars[tag.anchor_offset..end] != expected[..]
            })
            .collect()
    }
}

/// Render state handed back after every input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionView {
    pub phase: Phase,
    pub query: String,
    pub candidates: Vec<UserSummary>,
    pub selected_index: usize,
    pub loading: bool,
    pub error: Option<GatewayError>,
    pub text: String,
    pub cursor: usize,
    pub tags: Vec<MentionTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOutcome {
    /// False when the key should fall through to the text input.
    pub handled: bool,
    pub view: MentionView,
}

pub(crate) struct SearchCompletion {
    seq: u64,
    query: String,
    result: Result<Vec<UserSummary>, GatewayError>,
}

/// Drives `@user` autocomplete for one draft.
///
/// Searches are debounced by deadline and tagged with a sequence number; only
/// the response to the most recently issued search is ever shown.
pub struct MentionController {
    gateway: Arc<dyn Gateway>,
    spawner: Spawner,
    tx: Sender<SearchCompletion>,
    rx: Receiver<SearchCompletion>,
    debounce: Duration,
    max_candidates: usize,
    matcher: SkimMatcherV2,
    draft: Draft,
    phase: Phase,
    trigger: Option<usize>,
    query: String,
    deadline: Option<Instant>,
    issued: u64,
    awaiting: Option<u64>,
    candidates: Vec<UserSummary>,
    selected: usize,
    error: Option<GatewayError>,
    stale_discarded: u64,
}

impl MentionController {
    pub fn new(options: &SyncOptions, gateway: Arc<dyn Gateway>, spawner: Spawner) -> Self {
        let (tx, rx) = unbounded();
        Self {
            gateway,
            spawner,
            tx,
            rx,
            debounce: options.debounce,
            max_candidates: options.max_candidates.max(1),
            matcher: SkimMatcherV2::default().ignore_case(),
            draft: Draft::default(),
            phase: Phase::Idle,
            trigger: None,
            query: String::new(),
            deadline: None,
            issued: 0,
            awaiting: None,
            candidates: Vec::new(),
            selected: 0,
            error: None,
            stale_discarded: 0,
        }
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn searches_issued(&self) -> u64 {
        self.issued
    }

    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded
    }

    /// When the pending debounce timer fires, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn view(&self) -> MentionView {
        MentionView {
            phase: self.phase,
            query: self.query.clone(),
            candidates: self.candidates.clone(),
            selected_index: self.selected,
            loading: self.deadline.is_some() || self.awaiting.is_some(),
            error: self.error.clone(),
            text: self.draft.text.clone(),
            cursor: self.draft.cursor,
            tags: self.draft.tags.clone(),
        }
    }

    pub fn on_text_change(&mut self, text: &str, cursor: usize) -> MentionView {
        self.draft.text = text.to_string();
        self.draft.cursor = cursor.min(text.chars().count());
        self.rescan();
        self.view()
    }

    /// Cursor moved without editing; leaving the trigger span cancels.
    pub fn on_cursor_move(&mut self, cursor: usize) -> MentionView {
        self.draft.cursor = cursor.min(self.draft.text.chars().count());
        self.rescan();
        self.view()
    }

    pub fn on_key_down(&mut self, key: Key) -> KeyOutcome {
        let active = self.trigger.is_some();
        let count = self.candidates.len();
        let handled = match key {
            Key::ArrowDown if active && count > 0 => {
                self.selected = (self.selected + 1) % count;
                true
            }
            Key::ArrowUp if active && count > 0 => {
                self.selected = (self.selected + count - 1) % count;
                true
            }
            Key::Enter if active && count > 0 => {
                self.commit_selection(self.selected);
                true
            }
            Key::Escape if active => {
                self.cancel();
                true
            }
            _ => false,
        };
        KeyOutcome {
            handled,
            view: self.view(),
        }
    }

    /// Replaces the `@query` span with `@<name> ` and records the tag.
    /// Out-of-range indices leave the draft untouched.
    pub fn commit_selection(&mut self, index: usize) -> MentionView {
        let (Some(trigger), Some(user)) = (self.trigger, self.candidates.get(index).cloned()) else {
            return self.view();
        };
        let chars: Vec<char> = self.draft.text.chars().collect();
        if trigger >= chars.len() {
            return self.view();
        }
        let cursor = self.draft.cursor.clamp(trigger, chars.len());
        let inserted = format!("@{} ", user.name);

        let mut text: String = chars[..trigger].iter().collect();
        text.push_str(&inserted);
        text.extend(&chars[cursor..]);
        self.draft.text = text;
        self.draft.cursor = trigger + inserted.chars().count();
        self.draft.tags.push(MentionTag {
            user_id: user.id.clone(),
            username: user.name.clone(),
            anchor_offset: trigger,
        });
        debug!(user = %user.id, anchor = trigger, "mention committed");

        self.reset_search();
        self.phase = Phase::Committed;
        self.view()
    }

    /// Removes a committed tag; the `@name` text stays in the draft.
    pub fn remove_tag(&mut self, index: usize) -> Option<MentionTag> {
        (index < self.draft.tags.len()).then(|| self.draft.tags.remove(index))
    }

    /// Hands the tags over at submit time and starts a fresh draft.
    pub fn take_tags(&mut self) -> Vec<MentionTag> {
        let tags = std::mem::take(&mut self.draft.tags);
        self.discard();
        tags
    }

    /// Drops the draft. A search still in flight becomes ignorable.
    pub fn discard(&mut self) {
        self.draft = Draft::default();
        self.reset_search();
        self.phase = Phase::Idle;
    }

    /// Fires the debounce timer if it is due.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.issue_search();
                true
            }
            _ => false,
        }
    }

    /// Applies search responses that already arrived.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.rx.try_recv() {
            applied += self.apply(completion) as usize;
        }
        applied
    }

    /// Waits up to `timeout` for the debounce timer and one response.
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        let until = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            self.tick(now);
            let applied = self.poll();
            if applied > 0 || now >= until {
                return applied;
            }
            let wake = self.deadline.map_or(until, |deadline| deadline.min(until));
            match self.rx.recv_timeout(wake.saturating_duration_since(now)) {
                Ok(completion) => {
                    if self.apply(completion) {
                        return 1 + self.poll();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return 0,
            }
        }
    }

    fn rescan(&mut self) {
        match find_trigger(&self.draft.text, self.draft.cursor) {
            Some((trigger, query)) => {
                let moved = self.trigger != Some(trigger);
                self.trigger = Some(trigger);
                if moved || query != self.query {
                    self.query = query;
                    self.restart_debounce();
                }
                if matches!(self.phase, Phase::Idle | Phase::Committed | Phase::Cancelled) {
                    self.phase = Phase::Triggered;
                }
            }
            None if self.trigger.is_some() => self.cancel(),
            None => {}
        }
    }

    fn restart_debounce(&mut self) {
        self.candidates.clear();
        self.selected = 0;
        self.error = None;
        self.awaiting = None;
        self.phase = Phase::Triggered;
        self.deadline = if self.query.is_empty() {
            None
        } else {
            Some(Instant::now() + self.debounce)
        };
    }

    fn cancel(&mut self) {
        self.reset_search();
        self.phase = Phase::Cancelled;
    }

    fn reset_search(&mut self) {
        self.trigger = None;
        self.query.clear();
        self.deadline = None;
        self.awaiting = None;
        self.candidates.clear();
        self.selected = 0;
        self.error = None;
    }

    fn issue_search(&mut self) {
        if self.trigger.is_none() || self.query.is_empty() {
            return;
        }
        self.issued += 1;
        let seq = self.issued;
        self.awaiting = Some(seq);
        self.phase = Phase::Searching;

        let gateway = Arc::clone(&self.gateway);
        let tx = self.tx.clone();
        let query = self.query.clone();
        let limit = self.max_candidates * SEARCH_OVERFETCH;
        debug!(seq, query = %query, "user search issued");
        let queued = self.spawner.spawn(move || {
            let result = gateway.search_users(&query, limit);
            let _ = tx.send(SearchCompletion { seq, query, result });
        });
        if !queued {
            self.awaiting = None;
            self.error = Some(GatewayError::Network("sync engine closed".into()));
            self.phase = Phase::Suggesting;
        }
    }

    /// Channel search responses arrive on, for hosts that wait on several sources.
    pub(crate) fn completions(&self) -> &Receiver<SearchCompletion> {
        &self.rx
    }

    /// Applies one search response; false when it was stale.
    pub(crate) fn apply(&mut self, completion: SearchCompletion) -> bool {
        if self.awaiting != Some(completion.seq) {
            self.stale_discarded += 1;
            debug!(seq = completion.seq, query = %completion.query, "discarding stale search response");
            return false;
        }
        self.awaiting = None;
        self.selected = 0;
        match completion.result {
            Ok(users) => {
                self.candidates = self.rank(&completion.query, users);
                self.error = None;
            }
            Err(err) => {
                warn!(query = %completion.query, error = %err, "user search failed");
                self.candidates.clear();
                self.error = Some(err);
            }
        }
        self.phase = Phase::Suggesting;
        true
    }

    /// Keeps users whose name or email fuzzily matches; best score first,
    /// server order between equal scores.
    fn rank(&self, query: &str, users: Vec<UserSummary>) -> Vec<UserSummary> {
        let mut scored: Vec<(i64, UserSummary)> = users
            .into_iter()
            .filter_map(|user| {
                let by_name = self.matcher.fuzzy_match(&user.name, query);
                let by_email = self.matcher.fuzzy_match(&user.email, query);
                by_name.max(by_email).map(|score| (score, user))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(self.max_candidates)
            .map(|(_, user)| user)
            .collect()
    }
}

/// Scans back from `cursor` for an unescaped `@` with no whitespace between.
/// Returns the trigger offset and the query typed after it.
fn find_trigger(text: &str, cursor: usize) -> Option<(usize, String)> {
    let chars: Vec<char> = text.chars().collect();
    let cursor = cursor.min(chars.len());
    for index in (0..cursor).rev() {
        match chars[index] {
            c if c.is_whitespace() => return None,
            '@' => {
                if index > 0 && chars[index - 1] == '\\' {
                    return None;
                }
                return Some((index, chars[index + 1..cursor].iter().collect()));
            }
            _ => {}
        }
    }
    None
}
