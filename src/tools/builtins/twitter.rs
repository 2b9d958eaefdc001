use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::tools::{optional_usize, required_str, Tool, ToolArgs};

pub const TOKEN_VAR: &str = "TWITTER_BEARER_TOKEN";
const DEFAULT_MAX_RESULTS: usize = 10;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    includes: Includes,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    text: String,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct TweetSummary {
    pub text: String,
    pub user: String,
    pub created_at: String,
}

/// Recent-tweet search over the Twitter v2 API.
pub struct TwitterSearchTool {
    client: Client,
    api_url: String,
    bearer_token: Option<String>,
}

impl TwitterSearchTool {
    pub fn new(api_url: &str, bearer_token: Option<String>, client: Client) -> Self {
        TwitterSearchTool {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn from_env(api_url: &str, client: Client) -> Self {
        Self::new(api_url, std::env::var(TOKEN_VAR).ok(), client)
    }

    pub fn is_configured(&self) -> bool {
        self.bearer_token.is_some()
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<TweetSummary>> {
        let token = self
            .bearer_token
            .as_deref()
            .ok_or_else(|| anyhow!("{} is not set", TOKEN_VAR))?;

        // The endpoint accepts 10..=100.
        let limit = max_results.clamp(10, 100).to_string();
        let url = format!("{}/tweets/search/recent", self.api_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[
                ("query", query),
                ("max_results", limit.as_str()),
                ("expansions", "author_id"),
                ("tweet.fields", "created_at"),
                ("user.fields", "username"),
            ])
            .send()
            .await
            .context("failed to call Twitter API")?;

        let status = response.status();
        let body = response.text().await.context("failed to read Twitter response")?;
        if !status.is_success() {
            return Err(anyhow!("Twitter API error: {} - {}", status, body));
        }

        let parsed: SearchResponse =
            serde_json::from_str(&body).context("failed to parse Twitter response")?;
        let usernames: HashMap<&str, &str> = parsed
            .includes
            .users
            .iter()
            .map(|u| (u.id.as_str(), u.username.as_str()))
            .collect();

        Ok(parsed
            .data
            .iter()
            .take(max_results)
            .map(|tweet| TweetSummary {
                text: tweet.text.clone(),
                user: tweet
                    .author_id
                    .as_deref()
                    .and_then(|id| usernames.get(id))
                    .unwrap_or(&"")
                    .to_string(),
                created_at: tweet.created_at.clone().unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl Tool for TwitterSearchTool {
    fn name(&self) -> &str {
        "twitter_search"
    }

    fn description(&self) -> &str {
        "Search Twitter for recent tweets"
    }

    fn inputs(&self) -> Value {
        json!({
            "query": {
                "type": "string",
                "description": "The search query"
            },
            "max_results": {
                "type": "integer",
                "description": "Maximum number of tweets to return",
                "default": DEFAULT_MAX_RESULTS,
                "nullable": true
            }
        })
    }

    async fn forward(&self, args: &ToolArgs) -> Result<String> {
        if !self.is_configured() {
            return Ok(format!(
                "Twitter API is not configured. Please set the {} environment variable.",
                TOKEN_VAR
            ));
        }
        let query = required_str(args, "query")?;
        let max_results = optional_usize(args, "max_results").unwrap_or(DEFAULT_MAX_RESULTS);
        let tweets = self.search(query, max_results).await?;
        Ok(serde_json::to_string(&tweets)?)
    }
}
