use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOption {
    #[default]
    Recent,
    Oldest,
    Likes,
}

impl SortOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOption::Recent => "recent",
            SortOption::Oldest => "oldest",
            SortOption::Likes => "likes",
        }
    }
}

impl fmt::Display for SortOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn sort_option_from_key(key: &str) -> SortOption {
    match key.trim().to_ascii_lowercase().as_str() {
        "oldest" => SortOption::Oldest,
        "likes" => SortOption::Likes,
        _ => SortOption::Recent,
    }
}

/// Identity of one cached feed: sort option, tag filter and viewer.
///
/// Keys compare by value. The tag filter is normalized on construction so
/// `"Rust "` and `"rust"` address the same entry; an empty filter means the
/// unfiltered feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedQueryKey {
    pub sort: SortOption,
    pub tag: String,
    pub viewer: String,
}

impl FeedQueryKey {
    pub fn new(sort: SortOption, tag: &str, viewer: &str) -> Self {
        Self {
            sort,
            tag: tag.trim().to_ascii_lowercase(),
            viewer: viewer.trim().to_string(),
        }
    }

    pub fn has_tag_filter(&self) -> bool {
        !self.tag.is_empty()
    }
}

impl fmt::Display for FeedQueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.tag.is_empty() { "*" } else { &self.tag };
        write!(f, "{}/{}@{}", self.sort, tag, self.viewer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionTag {
    pub user_id: String,
    pub username: String,
    /// Character offset of the `@` in the draft at commit time.
    pub anchor_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSummary {
    pub id: String,
    pub author_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub like_ids: BTreeSet<String>,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub tags: Vec<MentionTag>,
}

impl PostSummary {
    pub fn is_liked_by(&self, viewer: &str) -> bool {
        self.like_ids.contains(viewer)
    }

    pub fn like_count(&self) -> usize {
        self.like_ids.len()
    }

    pub fn has_topic(&self, tag: &str) -> bool {
        self.topics.iter().any(|topic| topic.eq_ignore_ascii_case(tag))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub page_index: usize,
    pub items: Vec<PostSummary>,
    pub has_more: bool,
}

impl FeedPage {
    pub fn contains(&self, post_id: &str) -> bool {
        self.items.iter().any(|post| post.id == post_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Partial update carried by an `edit` mutation. `None` fields are left alone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEdit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<MentionTag>>,
}

impl PostEdit {
    pub fn tags(tags: Vec<MentionTag>) -> Self {
        Self {
            content: None,
            tags: Some(tags),
        }
    }

    pub fn apply_to(&self, post: &mut PostSummary) {
        if let Some(content) = &self.content {
            post.content = content.clone();
        }
        if let Some(tags) = &self.tags {
            post.tags = tags.clone();
        }
    }

    pub fn matches(&self, post: &PostSummary) -> bool {
        self.content
            .as_ref()
            .map_or(true, |content| *content == post.content)
            && self.tags.as_ref().map_or(true, |tags| *tags == post.tags)
    }

    /// Folds a later edit over this one; fields set in `later` win.
    pub fn merge(&mut self, later: PostEdit) {
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.tags.is_some() {
            self.tags = later.tags;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Like,
    Unlike,
    Edit,
    Delete,
}

impl MutationKind {
    pub fn class(&self) -> KindClass {
        match self {
            MutationKind::Like | MutationKind::Unlike => KindClass::Reaction,
            MutationKind::Edit => KindClass::Edit,
            MutationKind::Delete => KindClass::Delete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Like => "like",
            MutationKind::Unlike => "unlike",
            MutationKind::Edit => "edit",
            MutationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutations of the same class on the same post coalesce into one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
    Reaction,
    Edit,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MutationPayload {
    #[default]
    None,
    Edit(PostEdit),
}

#[cfg(test)]
pub(crate) fn sample_post(id: &str, minutes_ago: i64) -> PostSummary {
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
