use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::tools::{optional_usize, required_str, Tool, ToolArgs};

const BROWSER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RESULTS: usize = 5;

static SCRIPT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid regex"));

static STYLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("valid regex"));

static HTML_TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

static MULTIPLE_NEWLINES_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));

static RESULT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".result").expect("valid selector"));

static TITLE_LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".result__title a").expect("valid selector"));

static SNIPPET_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".result__snippet").expect("valid selector"));

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub href: String,
    pub body: String,
}

/// DuckDuckGo HTML search.
pub struct WebSearchTool {
    client: Client,
    search_url: String,
}

impl WebSearchTool {
    pub fn new(search_url: &str, client: Client) -> Self {
        WebSearchTool {
            client,
            search_url: search_url.to_string(),
        }
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let params = [("q", query), ("b", ""), ("kl", "")];
        let response = self
            .client
            .post(&self.search_url)
            .header("User-Agent", BROWSER_AGENT)
            .form(&params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("failed to send search request")?;

        let status = response.status();
        let body = response.text().await.context("failed to read search response")?;
        if !status.is_success() {
            return Err(anyhow!("search error: {}", status));
        }

        Ok(parse_results(&body, max_results))
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve `//duckduckgo.com/l/?uddg=<encoded>&...` redirects to the target.
fn clean_link(link: &str) -> String {
    if link.contains("duckduckgo.com/l/?") {
        if let Some(encoded) = link.split("uddg=").nth(1) {
            let encoded = encoded.split('&').next().unwrap_or_default();
            if let Ok(decoded) = urlencoding::decode(encoded) {
                return decoded.into_owned();
            }
        }
    }
    link.to_string()
}

fn parse_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);
    let mut hits = Vec::new();

    for element in document.select(&RESULT_SELECTOR) {
        if hits.len() >= max_results {
            break;
        }
        let Some(link) = element.select(&TITLE_LINK_SELECTOR).next() else {
            continue;
        };
        let href = link.value().attr("href").unwrap_or_default();
        // Ads
        if href.contains("y.js") {
            continue;
        }
        hits.push(SearchHit {
            title: element_text(link),
            href: clean_link(href),
            body: element
                .select(&SNIPPET_SELECTOR)
                .next()
                .map(element_text)
                .unwrap_or_default(),
        });
    }

    hits
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web using DuckDuckGo"
    }

    fn inputs(&self) -> Value {
        json!({
            "query": {
                "type": "string",
                "description": "Search query"
            },
            "max_results": {
                "type": "integer",
                "description": "Maximum number of results",
                "default": DEFAULT_MAX_RESULTS,
                "nullable": true
            }
        })
    }

    async fn forward(&self, args: &ToolArgs) -> Result<String> {
        let query = required_str(args, "query")?;
        let max_results = optional_usize(args, "max_results").unwrap_or(DEFAULT_MAX_RESULTS);
        let hits = self.search(query, max_results).await?;
        Ok(serde_json::to_string(&hits)?)
    }
}

/// Fetches a page and strips it down to text.
pub struct WebScrapeTool {
    client: Client,
}

impl WebScrapeTool {
    pub fn new(client: Client) -> Self {
        WebScrapeTool { client }
    }

    pub async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", BROWSER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("failed to request {}", url))?;

        let status = response.status();
        let text = response.text().await.context("failed to read page")?;
        if !status.is_success() {
            return Err(anyhow!("page request error: {} - {}", status, url));
        }

        Ok(html_to_text(&text))
    }
}

#[async_trait]
impl Tool for WebScrapeTool {
    fn name(&self) -> &str {
        "web_scrape"
    }

    fn description(&self) -> &str {
        "Scrape content from a webpage"
    }

    fn inputs(&self) -> Value {
        json!({
            "url": {
                "type": "string",
                "description": "URL to scrape"
            }
        })
    }

    async fn forward(&self, args: &ToolArgs) -> Result<String> {
        let url = required_str(args, "url")?;
        self.fetch(url).await
    }
}

pub fn html_to_text(html: &str) -> String {
    let mut result = SCRIPT_REGEX.replace_all(html, "").to_string();
    result = STYLE_REGEX.replace_all(&result, "").to_string();
    result = HTML_TAG_REGEX.replace_all(&result, "").to_string();

    result = result
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    result = MULTIPLE_NEWLINES_REGEX.replace_all(&result, "\n\n").to_string();
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};

    const RESULTS_PAGE: &str = r#"
<html><body>
  <div class="result">
    <h2 class="result__title"><a href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&amp;rut=abc">The <b>Rust</b> Language</a></h2>
    <a class="result__snippet">A language empowering everyone.</a>
  </div>
  <div class="result">
    <h2 class="result__title"><a href="https://duckduckgo.com/y.js?ad=1">Sponsored</a></h2>
  </div>
  <div class="result">
    <h2 class="result__title"><a href="https://doc.rust-lang.org/book/">The Book</a></h2>
    <a class="result__snippet">Learn Rust.</a>
  </div>
  <div class="result">
    <h2 class="result__title"><a href="https://crates.io/">crates.io</a></h2>
  </div>
</body></html>"#;

    #[test]
    fn parses_results_and_skips_ads() {
        let hits = parse_results(RESULTS_PAGE, 5);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].title, "The Rust Language");
        assert_eq!(hits[0].href, "https://www.rust-lang.org/");
        assert_eq!(hits[0].body, "A language empowering everyone.");
        assert_eq!(hits[2].body, "");
    }

    #[test]
    fn max_results_caps_output() {
        let hits = parse_results(RESULTS_PAGE, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].href, "https://doc.rust-lang.org/book/");
    }

    #[test]
    fn html_to_text_drops_scripts_and_tags() {
        let html = "<html><head><style>p{}</style><script>alert(1)</script></head>\
                    <body><p>Hello&nbsp;&amp; welcome</p>\n\n\n<p>bye</p></body></html>";
        assert_eq!(html_to_text(html), "Hello & welcome\n\nbye");
    }

    #[tokio::test]
    async fn search_tool_posts_to_endpoint() {
        let app = Router::new().route("/html", post(|| async { RESULTS_PAGE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let tool = WebSearchTool::new(&format!("http://{}/html", addr), Client::new());
        let mut args = ToolArgs::new();
        args.insert("query".to_string(), json!("rust"));
        args.insert("max_results".to_string(), json!(1));

        let out = tool.forward(&args).await.unwrap();
        let hits: Vec<SearchHit> = serde_json::from_str(&out).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].href, "https://www.rust-lang.org/");
    }
}
