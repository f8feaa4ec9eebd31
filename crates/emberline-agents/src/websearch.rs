use std::sync::LazyLock;
use std::time::Duration;

use emberline_common::{Error, Result};
use emberline_config::SearchConfig;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, warn};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_TIMEOUT: Duration = Duration::from_secs(8);
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Phrases that opt a message into a web search; the query is whatever
/// follows the phrase.
const SEARCH_TRIGGERS: [&str; 12] = [
    "search the web for",
    "search for",
    "look up",
    "google",
    "search online",
    "find online",
    "web search",
    "search the internet",
    "what's the latest",
    "whats the latest",
    "current news",
    "recent news",
];

static RESULT_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a rel="nofollow" class="result__a" href="([^"]+)"[^>]*>([^<]+)</a>"#)
        .expect("result link pattern should compile")
});
static RESULT_SNIPPET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a class="result__snippet"[^>]*>([^<]+)</a>"#)
        .expect("result snippet pattern should compile")
});
static STRIP_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|nav|header|footer)[^>]*>.*?</(script|style|nav|header|footer)>")
        .expect("block strip pattern should compile")
});
static HEADINGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<h[1-3][^>]*>(.*?)</h[1-3]>").expect("heading pattern should compile")
});
static PARAGRAPHS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<p[^>]*>(.*?)</p>").expect("paragraph pattern should compile"));
static LIST_ITEMS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<li[^>]*>(.*?)</li>").expect("list pattern should compile"));
static INNER_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag strip pattern should compile"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern should compile"));

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub content: Option<String>,
}

/// Query extraction, result scraping, and readable-text harvesting against
/// an HTML search endpoint.
pub struct WebSearcher {
    client: Client,
    config: SearchConfig,
}

impl WebSearcher {
    pub fn new(config: SearchConfig) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Pull a search query out of the message text, if a trigger phrase is
    /// present and something follows it.
    pub fn extract_query(text: &str) -> Option<String> {
        let lowered = text.to_lowercase();
        for trigger in SEARCH_TRIGGERS {
            // Offsets come from the lowercased copy, so slice defensively.
            let Some(tail) = lowered
                .find(trigger)
                .and_then(|idx| text.get(idx + trigger.len()..))
            else {
                continue;
            };
            let query = tail
                .trim()
                .trim_matches(['?', '"', '\'', '.', ',', '!'])
                .trim();
            if !query.is_empty() {
                return Some(query.to_string());
            }
        }
        None
    }

    /// Run the search and fetch page content for the top results.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let url = format!("{}/html/?q={}", self.config.base_url, query.replace(' ', "+"));

        let res = self
            .client
            .get(&url)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Search(format!("search request failed: {e}")))?;

        if !res.status().is_success() {
            return Err(Error::Search(format!(
                "search error status: {}",
                res.status()
            )));
        }

        let html = res
            .text()
            .await
            .map_err(|e| Error::Search(format!("failed to read search response: {e}")))?;

        let mut results = parse_results(&html, self.config.max_results);
        debug!(query, count = results.len(), "search results parsed");

        for result in results.iter_mut().take(self.config.fetch_pages) {
            result.content = self.fetch_page_text(&result.url).await;
        }

        Ok(results)
    }

    /// Search and build the context block to append to the outgoing user
    /// turn. `Ok(None)` means the search ran but found nothing.
    pub async fn augment(&self, query: &str) -> Result<Option<String>> {
        let results = self.search(query).await?;
        if results.is_empty() {
            return Ok(None);
        }
        Ok(Some(build_context_block(query, &results)))
    }

    async fn fetch_page_text(&self, url: &str) -> Option<String> {
        let res = self
            .client
            .get(url)
            .timeout(PAGE_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !res.status().is_success() {
            warn!(url, status = %res.status(), "page fetch failed");
            return None;
        }
        let html = res.text().await.ok()?;
        extract_readable_text(&html, self.config.page_char_cap)
    }
}

fn parse_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    let snippets: Vec<String> = RESULT_SNIPPET
        .captures_iter(html)
        .map(|c| c[1].trim().to_string())
        .collect();

    RESULT_LINK
        .captures_iter(html)
        .take(max_results)
        .enumerate()
        .map(|(i, c)| SearchResult {
            title: c[2].trim().to_string(),
            url: unwrap_redirect(&c[1]),
            snippet: snippets.get(i).cloned().unwrap_or_default(),
            content: None,
        })
        .collect()
}

/// Search engines wrap result links in a redirect carrying the real URL in
/// a `uddg` query parameter.
fn unwrap_redirect(link: &str) -> String {
    if !link.contains("uddg=") {
        return link.to_string();
    }
    let absolute = if link.starts_with("//") {
        format!("https:{link}")
    } else {
        link.to_string()
    };
    match url::Url::parse(&absolute) {
        Ok(parsed) => parsed
            .query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, value)| value.into_owned())
            .unwrap_or(absolute),
        Err(_) => link.to_string(),
    }
}

/// Harvest readable text from an HTML page: headings, substantial
/// paragraphs, and leading list items, with chrome stripped out.
pub(crate) fn extract_readable_text(html: &str, cap: usize) -> Option<String> {
    let cleaned = STRIP_BLOCKS.replace_all(html, "");

    let mut parts: Vec<String> = Vec::new();

    for capture in HEADINGS.captures_iter(&cleaned).take(5) {
        let text = INNER_TAGS.replace_all(&capture[1], "").trim().to_string();
        if text.len() > 5 {
            parts.push(format!("## {text}"));
        }
    }

    for capture in PARAGRAPHS.captures_iter(&cleaned) {
        let text = INNER_TAGS.replace_all(&capture[1], "").trim().to_string();
        if text.len() > 30 && !text.starts_with('©') {
            parts.push(text);
        }
    }

    for capture in LIST_ITEMS.captures_iter(&cleaned).take(20) {
        let text = INNER_TAGS.replace_all(&capture[1], "").trim().to_string();
        if text.len() > 20 {
            parts.push(format!("- {text}"));
        }
    }

    let combined = parts.join("\n");
    let collapsed = WHITESPACE.replace_all(&combined, " ").trim().to_string();

    if collapsed.chars().count() < 100 {
        return None;
    }
    if collapsed.chars().count() > cap {
        let clipped: String = collapsed.chars().take(cap).collect();
        return Some(format!("{clipped}..."));
    }
    Some(collapsed)
}

/// Assemble the context block injected into the user turn before dispatch.
pub(crate) fn build_context_block(query: &str, results: &[SearchResult]) -> String {
    let mut block = format!("\n\n[web search results for '{query}']\n\n");
    for (i, result) in results.iter().enumerate() {
        block.push_str(&format!("=== source {}: {} ===\n", i + 1, result.title));
        block.push_str(&format!("url: {}\n", result.url));
        match &result.content {
            Some(content) => block.push_str(&format!("content:\n{content}\n")),
            None => block.push_str(&format!("snippet: {}\n", result.snippet)),
        }
        block.push('\n');
    }
    block.push_str(
        "[end of search results]\n\nUse the content above to answer accurately and cite sources when relevant.",
    );
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_query_after_trigger() {
        assert_eq!(
            WebSearcher::extract_query("can you search for rust 2024 edition changes?"),
            Some("rust 2024 edition changes".to_string())
        );
        assert_eq!(
            WebSearcher::extract_query("Look up the weather in Oslo."),
            Some("the weather in Oslo".to_string())
        );
    }

    #[test]
    fn no_trigger_means_no_query() {
        assert!(WebSearcher::extract_query("tell me about lifetimes").is_none());
        // A trigger with nothing after it is not a query either.
        assert!(WebSearcher::extract_query("search for").is_none());
    }

    #[test]
    fn redirect_urls_are_unwrapped() {
        let link = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fpage&rut=abc";
        assert_eq!(unwrap_redirect(link), "https://example.com/page");

        let direct = "https://example.com/direct";
        assert_eq!(unwrap_redirect(direct), direct);
    }

    #[test]
    fn result_parsing_pairs_links_and_snippets() {
        let html = r#"
            <a rel="nofollow" class="result__a" href="https://one.example/a">First Result</a>
            <a class="result__snippet" href="https://one.example/a">first snippet</a>
            <a rel="nofollow" class="result__a" href="https://two.example/b">Second Result</a>
            <a class="result__snippet" href="https://two.example/b">second snippet</a>
        "#;
        let results = parse_results(html, 5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "First Result");
        assert_eq!(results[0].snippet, "first snippet");
        assert_eq!(results[1].url, "https://two.example/b");
    }

    #[test]
    fn readable_text_harvests_structure_and_strips_chrome() {
        let html = format!(
            "<html><head><script>var x = 1;</script><style>body {{}}</style></head>\
             <body><nav>menu menu menu</nav>\
             <h1>Main Heading</h1>\
             <p>{}</p>\
             <li>{}</li>\
             <footer>copyright footer</footer></body></html>",
            "A paragraph with enough substance to pass the length filter easily.",
            "A list item that is long enough to keep."
        );
        let text = extract_readable_text(&html, 1500).expect("text extracted");
        assert!(text.contains("## Main Heading"));
        assert!(text.contains("enough substance"));
        assert!(text.contains("- A list item"));
        assert!(!text.contains("menu menu"));
        assert!(!text.contains("var x"));
    }

    #[test]
    fn readable_text_respects_the_cap() {
        let para = "sentence with plenty of words to fill the paragraph out nicely. ".repeat(50);
        let html = format!("<p>{para}</p>");
        let text = extract_readable_text(&html, 200).expect("text extracted");
        assert!(text.chars().count() <= 203);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn thin_pages_yield_nothing() {
        assert!(extract_readable_text("<p>too short</p>", 1500).is_none());
    }

    #[test]
    fn context_block_prefers_content_over_snippet() {
        let results = vec![
            SearchResult {
                title: "Deep Dive".into(),
                url: "https://one.example".into(),
                snippet: "short blurb".into(),
                content: Some("full extracted text".into()),
            },
            SearchResult {
                title: "Shallow".into(),
                url: "https://two.example".into(),
                snippet: "only a snippet".into(),
                content: None,
            },
        ];
        let block = build_context_block("test query", &results);
        assert!(block.contains("[web search results for 'test query']"));
        assert!(block.contains("content:\nfull extracted text"));
        assert!(block.contains("snippet: only a snippet"));
        assert!(block.contains("[end of search results]"));
    }
}
