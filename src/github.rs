//! GitHub collaborator interface.
//!
//! The orchestrator and stages consume Git hosting through the narrow
//! `GitProvider` trait; `GitHubClient` is the real implementation over the
//! REST v3 API. Tests substitute an in-memory double.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "gantry-orchestrator";

/// A label attached to an issue or pull request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub name: String,
}

/// A work unit: an issue (or PR) tracked by the Git provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub html_url: String,
    /// Pull requests also come through the issues endpoint; present when
    /// this "issue" is actually a PR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<serde_json::Value>,
}

impl Issue {
    pub fn label_set(&self) -> HashSet<&str> {
        self.labels.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

/// A comment on an issue or pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    pub body: String,
    pub user: CommentAuthor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentAuthor {
    pub login: String,
}

/// A pull request (subset of fields we care about).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
    pub head: PullRef,
    pub base: PullRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRef {
    #[serde(rename = "ref")]
    pub branch: String,
}

/// Validate an `owner/repo` slug: exactly two non-empty segments.
pub fn is_valid_repo_slug(slug: &str) -> bool {
    let parts: Vec<&str> = slug.split('/').collect();
    parts.len() == 2 && parts.iter().all(|p| !p.is_empty())
}

/// Narrow interface over the Git hosting provider.
#[async_trait]
pub trait GitProvider: Send + Sync {
    async fn list_open_issues(&self, label: Option<&str>) -> Result<Vec<Issue>>;
    async fn get_issue(&self, number: u64) -> Result<Issue>;
    async fn add_comment(&self, number: u64, body: &str) -> Result<()>;
    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>>;
    async fn add_labels(&self, number: u64, labels: &[&str]) -> Result<()>;
    async fn remove_label(&self, number: u64, label: &str) -> Result<()>;
    async fn default_branch(&self) -> Result<String>;
    async fn create_branch(&self, name: &str, from_branch: &str) -> Result<()>;
    async fn create_pull(&self, head: &str, base: &str, title: &str, body: &str)
    -> Result<PullRequest>;
    async fn pull_request_diff(&self, number: u64) -> Result<String>;
    async fn merge_pull(&self, number: u64) -> Result<()>;
}

/// GitHub REST v3 client.
pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    repo: String,
    api_base: String,
}

impl GitHubClient {
    pub fn new(token: &str, repo: &str) -> Result<Self> {
        anyhow::ensure!(
            is_valid_repo_slug(repo),
            "Invalid repository slug '{}': expected owner/repo",
            repo
        );
        Ok(Self {
            client: reqwest::Client::new(),
            token: token.to_string(),
            repo: repo.to_string(),
            api_base: GITHUB_API_BASE.to_string(),
        })
    }

    /// Point the client at a different API base (test servers).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, self.repo, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
    }
}

#[async_trait]
impl GitProvider for GitHubClient {
    /// List open issues, excluding pull requests, paginating through all
    /// pages.
    async fn list_open_issues(&self, label: Option<&str>) -> Result<Vec<Issue>> {
        let url = self.url("issues");
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let mut query = vec![
                ("state".to_string(), "open".to_string()),
                ("per_page".to_string(), "100".to_string()),
                ("page".to_string(), page.to_string()),
            ];
            if let Some(label) = label {
                query.push(("labels".to_string(), label.to_string()));
            }

            let batch: Vec<Issue> = self
                .request(reqwest::Method::GET, &url)
                .query(&query)
                .send()
                .await
                .context("Failed to send issues request to GitHub")?
                .error_for_status()
                .context("GitHub issues API returned error status")?
                .json()
                .await
                .context("Failed to parse issues response from GitHub")?;

            let count = batch.len();
            all.extend(batch.into_iter().filter(|i| i.pull_request.is_none()));
            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn get_issue(&self, number: u64) -> Result<Issue> {
        self.request(reqwest::Method::GET, &self.url(&format!("issues/{}", number)))
            .send()
            .await
            .context("Failed to send issue request to GitHub")?
            .error_for_status()
            .context("GitHub issue API returned error status")?
            .json()
            .await
            .context("Failed to parse issue response from GitHub")
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &self.url(&format!("issues/{}/comments", number)),
        )
        .json(&serde_json::json!({ "body": body }))
        .send()
        .await
        .context("Failed to send comment to GitHub")?
        .error_for_status()
        .context("GitHub comment API returned error status")?;
        Ok(())
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>> {
        self.request(
            reqwest::Method::GET,
            &self.url(&format!("issues/{}/comments", number)),
        )
        .query(&[("per_page", "100")])
        .send()
        .await
        .context("Failed to send comments request to GitHub")?
        .error_for_status()
        .context("GitHub comments API returned error status")?
        .json()
        .await
        .context("Failed to parse comments response from GitHub")
    }

    async fn add_labels(&self, number: u64, labels: &[&str]) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &self.url(&format!("issues/{}/labels", number)),
        )
        .json(&serde_json::json!({ "labels": labels }))
        .send()
        .await
        .context("Failed to send labels to GitHub")?
        .error_for_status()
        .context("GitHub labels API returned error status")?;
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &self.url(&format!("issues/{}/labels/{}", number, label)),
            )
            .send()
            .await
            .context("Failed to send label removal to GitHub")?;
        // Removing an absent label is a 404; relabeling must stay idempotent.
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            resp.error_for_status()
                .context("GitHub label removal returned error status")?;
        }
        Ok(())
    }

    async fn default_branch(&self) -> Result<String> {
        let repo: serde_json::Value = self
            .request(
                reqwest::Method::GET,
                &format!("{}/repos/{}", self.api_base, self.repo),
            )
            .send()
            .await
            .context("Failed to send repo request to GitHub")?
            .error_for_status()
            .context("GitHub repo API returned error status")?
            .json()
            .await
            .context("Failed to parse repo response from GitHub")?;
        repo.get("default_branch")
            .and_then(|b| b.as_str())
            .map(|s| s.to_string())
            .context("Repo response missing default_branch")
    }

    async fn create_branch(&self, name: &str, from_branch: &str) -> Result<()> {
        let head: serde_json::Value = self
            .request(
                reqwest::Method::GET,
                &self.url(&format!("git/ref/heads/{}", from_branch)),
            )
            .send()
            .await
            .context("Failed to resolve base branch ref")?
            .error_for_status()
            .context("GitHub ref API returned error status")?
            .json()
            .await
            .context("Failed to parse ref response from GitHub")?;
        let sha = head
            .pointer("/object/sha")
            .and_then(|s| s.as_str())
            .context("Ref response missing object sha")?;

        self.request(reqwest::Method::POST, &self.url("git/refs"))
            .json(&serde_json::json!({
                "ref": format!("refs/heads/{}", name),
                "sha": sha,
            }))
            .send()
            .await
            .context("Failed to send branch creation to GitHub")?
            .error_for_status()
            .context("GitHub branch creation returned error status")?;
        Ok(())
    }

    async fn create_pull(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        self.request(reqwest::Method::POST, &self.url("pulls"))
            .json(&serde_json::json!({
                "head": head,
                "base": base,
                "title": title,
                "body": body,
            }))
            .send()
            .await
            .context("Failed to send PR creation to GitHub")?
            .error_for_status()
            .context("GitHub PR creation returned error status")?
            .json()
            .await
            .context("Failed to parse PR response from GitHub")
    }

    async fn pull_request_diff(&self, number: u64) -> Result<String> {
        self.request(reqwest::Method::GET, &self.url(&format!("pulls/{}", number)))
            .header("Accept", "application/vnd.github.diff")
            .send()
            .await
            .context("Failed to send diff request to GitHub")?
            .error_for_status()
            .context("GitHub diff API returned error status")?
            .text()
            .await
            .context("Failed to read diff response from GitHub")
    }

    async fn merge_pull(&self, number: u64) -> Result<()> {
        self.request(
            reqwest::Method::PUT,
            &self.url(&format!("pulls/{}/merge", number)),
        )
        .json(&serde_json::json!({ "merge_method": "squash" }))
        .send()
        .await
        .context("Failed to send merge request to GitHub")?
        .error_for_status()
        .context("GitHub merge API returned error status")?;
        Ok(())
    }
}
