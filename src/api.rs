use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::model::{
    FeedPage, FeedQueryKey, MentionTag, MutationKind, MutationPayload, PostSummary, UserSummary,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/";

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub auth_token: Option<String>,
    pub http_client: Option<HttpClient>,
}

/// [`Gateway`] backed by the social feed REST API.
pub struct HttpGateway {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpGateway {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("api client user agent required");
        }
        let mut base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("api: parse base url {base}"))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(10)))
                .build()
                .context("api: build http client")?,
        };

        Ok(HttpGateway {
            http,
            user_agent: config.user_agent,
            base_url,
            auth_token: config.auth_token.filter(|token| !token.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, GatewayError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| GatewayError::Network(format!("invalid url {path}: {err}")))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        req
    }

    fn send(&self, req: RequestBuilder) -> Result<Response, GatewayError> {
        let resp = req
            .send()
            .map_err(|err| GatewayError::Network(err.to_string()))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            Err(GatewayError::from_status(status, body))
        }
    }

    fn json<T: DeserializeOwned>(resp: Response) -> Result<T, GatewayError> {
        resp.json().map_err(|err| GatewayError::Server {
            status: 200,
            message: format!("decode response: {err}"),
        })
    }
}

impl Gateway for HttpGateway {
    fn fetch_feed_page(
        &self,
        key: &FeedQueryKey,
        page_index: usize,
        page_size: usize,
    ) -> Result<FeedPage, GatewayError> {
        let page = page_index.to_string();
        let limit = page_size.to_string();
        let mut params = vec![
            ("page", page.as_str()),
            ("limit", limit.as_str()),
            ("sort", key.sort.as_str()),
            ("currentUserId", key.viewer.as_str()),
        ];
        if key.has_tag_filter() {
            params.push(("tag", key.tag.as_str()));
        }
        let url = self.url("posts/feed", &params)?;
        debug!(%url, "fetching feed page");
        let resp = self.send(self.request(Method::GET, url))?;
        let wire: WireFeedPage = Self::json(resp)?;
        Ok(FeedPage {
            page_index,
            has_more: wire.has_more,
            items: wire
                .posts
                .into_iter()
                .map(WirePostEnvelope::into_post)
                .collect(),
        })
    }

    fn post_mutation(
        &self,
        kind: MutationKind,
        target_post_id: &str,
        payload: &MutationPayload,
        viewer_id: &str,
    ) -> Result<Option<PostSummary>, GatewayError> {
        let post_path = format!("posts/{target_post_id}");
        match kind {
            // The backend exposes a single toggle endpoint for reactions.
            MutationKind::Like | MutationKind::Unlike => {
                let url = self.url(&format!("{post_path}/like"), &[("userId", viewer_id)])?;
                let resp = self.send(self.request(Method::POST, url))?;
                let post: WirePostEnvelope = Self::json(resp)?;
                Ok(Some(post.into_post()))
            }
            MutationKind::Edit => {
                let edit = match payload {
                    MutationPayload::Edit(edit) => edit.clone(),
                    MutationPayload::None => Default::default(),
                };
                let url = self.url(&post_path, &[("userId", viewer_id)])?;
                let body = WireEdit {
                    body: edit.content,
                    mentions: edit.tags.clone(),
                    tagged_user_ids: edit
                        .tags
                        .map(|tags| tags.into_iter().map(|tag| tag.user_id).collect()),
                };
                let resp = self.send(self.request(Method::PUT, url).json(&body))?;
                let post: WirePostEnvelope = Self::json(resp)?;
                Ok(Some(post.into_post()))
            }
            MutationKind::Delete => {
                let url = self.url(&post_path, &[("userId", viewer_id)])?;
                self.send(self.request(Method::DELETE, url))?;
                Ok(None)
            }
        }
    }

    fn search_users(&self, query: &str, limit: usize) -> Result<Vec<UserSummary>, GatewayError> {
        // The users endpoint has no server-side filter; callers rank the result.
        let url = self.url("auth/users", &[])?;
        debug!(%url, query, limit, "searching users");
        let resp = self.send(self.request(Method::GET, url))?;
        let users: Vec<WireUser> = Self::json(resp)?;
        Ok(users
            .into_iter()
            .filter_map(|user| {
                let id = user.id.or(user.legacy_id)?;
                Some(UserSummary {
                    id,
                    name: user.name.unwrap_or_default(),
                    email: user.email.unwrap_or_default(),
                })
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFeedPage {
    #[serde(default)]
    posts: Vec<WirePostEnvelope>,
    #[serde(default)]
    has_more: bool,
}

/// The feed wraps posts as `{ post: {...}, canApply, ... }`; mutation
/// endpoints return the bare post. Both shapes decode here.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePostEnvelope {
    Wrapped { post: WirePost },
    Bare(WirePost),
}

impl WirePostEnvelope {
    fn into_post(self) -> PostSummary {
        match self {
            WirePostEnvelope::Wrapped { post } | WirePostEnvelope::Bare(post) => post.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePost {
    id: String,
    #[serde(default)]
    author_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    likes: BTreeSet<String>,
    #[serde(default)]
    comments: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    mentions: Vec<MentionTag>,
    #[serde(default)]
    tagged_user_ids: Option<Vec<String>>,
}

impl From<WirePost> for PostSummary {
    fn from(wire: WirePost) -> Self {
        // Older posts only carry tagged user ids; keep them as anchorless tags.
        let tags = if wire.mentions.is_empty() {
            wire.tagged_user_ids
                .unwrap_or_default()
                .into_iter()
                .map(|user_id| MentionTag {
                    user_id,
                    username: String::new(),
                    anchor_offset: 0,
                })
                .collect()
        } else {
            wire.mentions
        };
        PostSummary {
            id: wire.id,
            author_id: wire.author_id,
            title: wire.title.filter(|title| !title.is_empty()),
            content: wire.body,
            like_ids: wire.likes,
            comment_count: wire.comments.map_or(0, |c| c.len() as u64),
            created_at: DateTime::<Utc>::from_timestamp_millis(wire.created_at)
                .unwrap_or_default(),
            topics: wire.tags.unwrap_or_default(),
            tags,
        }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mentions: Option<Vec<MentionTag>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tagged_user_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "_id")]
    legacy_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_user_agent() {
        assert!(HttpGateway::new(ClientConfig::default()).is_err());
    }

    #[test]
    fn joins_paths_under_base() {
        let gw = HttpGateway::new(ClientConfig {
            base_url: Some("http://example.test/api".into()),
            user_agent: "feedsync-test".into(),
            ..ClientConfig::default()
        })
        .unwrap();
        let url = gw
            .url("posts/feed", &[("page", "0"), ("tag", "rust lang")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://example.test/api/posts/feed?page=0&tag=rust+lang"
        );
    }

    #[test]
    fn decodes_wrapped_and_bare_posts() {
        let raw = r#"{
            "posts": [
                {"post": {"id": "a", "authorId": "u2", "body": "hi", "likes": ["u1"],
                          "comments": [{}, {}], "createdAt": 1700000000000, "tags": ["Rust"]},
                 "canApply": false},
                {"id": "b", "body": "yo", "taggedUserIds": ["u3"]}
            ],
            "currentPage": 0,
            "hasMore": true
        }"#;
        let page: WireFeedPage = serde_json::from_str(raw).unwrap();
        assert!(page.has_more);
        let posts: Vec<PostSummary> = page.posts.into_iter().map(|p| p.into_post()).collect();
        assert_eq!(posts[0].id, "a");
        assert!(posts[0].is_liked_by("u1"));
        assert_eq!(posts[0].comment_count, 2);
        assert_eq!(posts[0].topics, vec!["Rust".to_string()]);
        assert_eq!(posts[1].tags[0].user_id, "u3");
    }
}
