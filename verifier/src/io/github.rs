//! Metadata collaborator (GitHub REST).
//!
//! [`MetadataClient`] performs single authenticated calls; [`MetadataService`]
//! routes them through the [`CredentialPool`] under the right quota class.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::core::types::{CommitInfo, IssueRecord, Language, Repository};
use crate::error::ApiError;
use crate::io::credentials::{CredentialPool, Quota, QuotaClass, RateLimitSnapshot, Token};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

static CLOSING_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:fix(?:es|ed)?|close[sd]?|resolve[sd]?)\s*:?\s+#(\d+)\b")
        .expect("valid regex")
});

/// A pull request found for a commit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    #[serde(default)]
    pub body: Option<String>,
}

/// Single calls against the metadata service, authenticated with `token`.
pub trait MetadataClient: Send + Sync {
    /// Core class.
    fn repository(&self, token: &Token, full_name: &str) -> Result<Repository, ApiError>;
    /// Not counted against either quota.
    fn rate_limit(&self, token: &Token) -> Result<RateLimitSnapshot, ApiError>;
    /// Search class.
    fn pull_requests_for_commit(
        &self,
        token: &Token,
        full_name: &str,
        sha: &str,
    ) -> Result<Vec<PullRequestRef>, ApiError>;
    /// Core class.
    fn issue(&self, token: &Token, full_name: &str, number: u64) -> Result<IssueRecord, ApiError>;
}

/// Blocking REST client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: Client,
    base_url: String,
}

impl GithubClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("bugverify"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get<T: DeserializeOwned>(
        &self,
        token: &Token,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, token = token.label(), "metadata request");
        let response = self
            .client
            .get(&url)
            .bearer_auth(token.secret())
            .query(query)
            .send()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        decode(check_status(&url, response)?)
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    if let Some(reset_at) = rate_limit_reset(
        status,
        header("x-ratelimit-remaining").as_deref(),
        header("x-ratelimit-reset").as_deref(),
    ) {
        return Err(ApiError::RateLimited { reset_at });
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(url.to_string()));
    }
    let body = response.text().unwrap_or_default();
    Err(ApiError::Status {
        code: status.as_u16(),
        body,
    })
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    response
        .json()
        .map_err(|err| ApiError::Decode(err.to_string()))
}

/// Reset time when a response reports quota exhaustion.
pub fn rate_limit_reset(
    status: StatusCode,
    remaining: Option<&str>,
    reset: Option<&str>,
) -> Option<DateTime<Utc>> {
    let limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && remaining == Some("0"));
    if !limited {
        return None;
    }
    let reset_at = reset
        .and_then(|value| value.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(|| Utc::now() + chrono::TimeDelta::minutes(1));
    Some(reset_at)
}

#[derive(Deserialize)]
struct RepositoryBody {
    full_name: String,
    clone_url: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    stargazers_count: u64,
}

#[derive(Deserialize)]
struct QuotaBody {
    limit: u32,
    remaining: u32,
    reset: i64,
}

impl QuotaBody {
    fn into_quota(self) -> Quota {
        Quota {
            remaining: self.remaining,
            limit: self.limit,
            reset_at: DateTime::<Utc>::from_timestamp(self.reset, 0).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Deserialize)]
struct RateLimitResources {
    core: QuotaBody,
    search: QuotaBody,
}

#[derive(Deserialize)]
struct RateLimitBody {
    resources: RateLimitResources,
}

#[derive(Deserialize)]
struct SearchBody {
    #[serde(default)]
    items: Vec<PullRequestRef>,
}

#[derive(Deserialize)]
struct LabelBody {
    name: String,
}

#[derive(Deserialize)]
struct IssueBody {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    html_url: String,
    #[serde(default)]
    labels: Vec<LabelBody>,
}

impl MetadataClient for GithubClient {
    fn repository(&self, token: &Token, full_name: &str) -> Result<Repository, ApiError> {
        let body: RepositoryBody = self.get(token, &format!("/repos/{full_name}"), &[])?;
        Ok(Repository {
            full_name: body.full_name,
            clone_url: body.clone_url,
            language: body
                .language
                .as_deref()
                .map_or(Language::Unknown, Language::from_label),
            size: body.size,
            stars: body.stargazers_count,
        })
    }

    fn rate_limit(&self, token: &Token) -> Result<RateLimitSnapshot, ApiError> {
        let body: RateLimitBody = self.get(token, "/rate_limit", &[])?;
        Ok(RateLimitSnapshot {
            core: body.resources.core.into_quota(),
            search: body.resources.search.into_quota(),
        })
    }

    fn pull_requests_for_commit(
        &self,
        token: &Token,
        full_name: &str,
        sha: &str,
    ) -> Result<Vec<PullRequestRef>, ApiError> {
        let query = format!("{sha} type:pr repo:{full_name}");
        let body: SearchBody = self.get(token, "/search/issues", &[("q", query.as_str())])?;
        Ok(body.items)
    }

    fn issue(&self, token: &Token, full_name: &str, number: u64) -> Result<IssueRecord, ApiError> {
        let body: IssueBody =
            self.get(token, &format!("/repos/{full_name}/issues/{number}"), &[])?;
        Ok(IssueRecord {
            id: body.number,
            title: body.title,
            body: body.body.unwrap_or_default(),
            url: body.html_url,
            labels: body.labels.into_iter().map(|label| label.name).collect(),
        })
    }
}

/// Issue numbers referenced with a closing keyword (`fixes #12`).
pub fn linked_issue_numbers(text: &str) -> BTreeSet<u64> {
    CLOSING_REFERENCE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|number| number.as_str().parse().ok())
        .collect()
}

/// Metadata calls routed through the credential pool.
#[derive(Clone)]
pub struct MetadataService {
    pool: Arc<CredentialPool>,
    client: Arc<dyn MetadataClient>,
}

impl MetadataService {
    pub fn new(pool: Arc<CredentialPool>, client: Arc<dyn MetadataClient>) -> Self {
        Self { pool, client }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn client(&self) -> &Arc<dyn MetadataClient> {
        &self.client
    }

    pub fn repository(&self, full_name: &str) -> Result<Repository, ApiError> {
        self.pool.call(QuotaClass::Core, |token| {
            self.client.repository(token, full_name)
        })
    }

    /// Issues closed by the fixing commit, from its message and from the
    /// bodies of pull requests that contain it. Missing issues are skipped.
    #[instrument(skip_all, fields(repo = %repository.full_name, commit = %commit.short_hash()))]
    pub fn linked_issues(
        &self,
        repository: &Repository,
        commit: &CommitInfo,
    ) -> Result<Vec<IssueRecord>, ApiError> {
        let mut numbers = linked_issue_numbers(&commit.message);
        let pulls = self.pool.call(QuotaClass::Search, |token| {
            self.client
                .pull_requests_for_commit(token, &repository.full_name, &commit.hash)
        })?;
        for pull in &pulls {
            if let Some(body) = &pull.body {
                numbers.extend(linked_issue_numbers(body));
            }
        }

        let mut issues = Vec::with_capacity(numbers.len());
        for number in numbers {
            match self.pool.call(QuotaClass::Core, |token| {
                self.client.issue(token, &repository.full_name, number)
            }) {
                Ok(issue) => issues.push(issue),
                Err(ApiError::NotFound(_)) => {
                    warn!(issue = number, "linked issue not found");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(issues)
    }
}
