//! Page retrieval: the `Fetcher` seam, an HTTP implementation, and page
//! URL templating.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::PipelineError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/61.0.3163.100 Safari/537.36";

/// Token replaced by the page number in a URL template.
pub const PAGE_TOKEN: &str = "{page}";

/// Encoded `"currentPage":` key inside the provider's query state.
const CURRENT_PAGE_KEY: &str = "currentPage%22%3A";

/// Returns the raw document for a URL.
pub trait Fetcher {
    fn fetch(&self, url: &str) -> Result<String, PipelineError>;
}

/// Blocking HTTP fetcher with browser-like headers.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<String, PipelineError> {
        let fetch_err = |reason: String| PipelineError::Fetch {
            url: url.to_string(),
            reason,
        };
        self.agent
            .get(url)
            .set(
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8",
            )
            .set("accept-language", "en-US,en;q=0.8")
            .set("upgrade-insecure-requests", "1")
            .call()
            .map_err(|e| fetch_err(e.to_string()))?
            .into_string()
            .map_err(|e| fetch_err(e.to_string()))
    }
}

/// URL for `page` of a search template.
///
/// Templates either carry [`PAGE_TOKEN`] or the provider's encoded
/// `currentPage` value, which is rewritten. A template with neither can
/// only serve page 1.
pub fn page_url(template: &str, page: u32) -> Option<String> {
    if template.contains(PAGE_TOKEN) {
        return Some(template.replace(PAGE_TOKEN, &page.to_string()));
    }
    if let Some(at) = template.find(CURRENT_PAGE_KEY) {
        let start = at + CURRENT_PAGE_KEY.len();
        let digits = template[start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        return Some(format!(
            "{}{}{}",
            &template[..start],
            page,
            &template[start + digits..]
        ));
    }
    (page == 1).then(|| template.to_string())
}

/// Fetch pages `1..=pages` of a template, handing each body to `on_page`.
///
/// A failure on page 1 is an error. A failure on a later page stops
/// paging and keeps what was already fetched.
pub fn fetch_pages<F>(
    fetcher: &dyn Fetcher,
    template: &str,
    pages: u32,
    mut on_page: F,
) -> Result<Vec<String>>
where
    F: FnMut(u32, &str) -> Result<()>,
{
    let mut bodies = Vec::with_capacity(pages as usize);

    for page in 1..=pages {
        let Some(url) = page_url(template, page) else {
            warn!(page, "template has no page marker, stopping after page 1");
            break;
        };

        let body = match fetcher.fetch(&url) {
            Ok(body) => body,
            Err(e) if page == 1 => return Err(e).context("failed to fetch first page"),
            Err(e) => {
                warn!(page, error = %e, "fetch failed, keeping earlier pages");
                break;
            }
        };

        debug!(page, bytes = body.len(), "fetched page");
        on_page(page, &body).with_context(|| format!("failed to store page {}", page))?;
        bodies.push(body);
    }

    info!("fetched {} of {} pages", bodies.len(), pages);
    Ok(bodies)
}


#[cfg(test)]
mod tests {
    use super::testing::FakeFetcher;
    use super::*;

    #[test]
    fn test_page_url_token() {
        assert_eq!(
            page_url("https://x.test/s?p={page}", 7).unwrap(),
            "https://x.test/s?p=7"
        );
    }

    #[test]
    fn test_page_url_current_page_rewrite() {
        let template = "https://x.test/?searchQueryState=%7B%22pagination%22%3A%7B%22currentPage%22%3A1%7D%7D";
        assert_eq!(
            page_url(template, 12).unwrap(),
            "https://x.test/?searchQueryState=%7B%22pagination%22%3A%7B%22currentPage%22%3A12%7D%7D"
        );
    }

    #[test]
    fn test_page_url_without_marker() {
        assert_eq!(page_url("https://x.test/", 1).unwrap(), "https://x.test/");
        assert_eq!(page_url("https://x.test/", 2), None);
    }

    #[test]
    fn test_fetch_pages_collects_in_order() {
        let fetcher = FakeFetcher::default()
            .with("u?p=1", "one")
            .with("u?p=2", "two")
            .with("u?p=3", "three");
        let mut seen = Vec::new();
        let bodies = fetch_pages(&fetcher, "u?p={page}", 3, |page, body| {
            seen.push((page, body.to_string()));
            Ok(())
        })
        .unwrap();

        assert_eq!(bodies, vec!["one", "two", "three"]);
        assert_eq!(seen[0], (1, "one".to_string()));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_fetch_pages_stops_on_later_failure() {
        let fetcher = FakeFetcher::default().with("u?p=1", "one");
        let bodies = fetch_pages(&fetcher, "u?p={page}", 5, |_, _| Ok(())).unwrap();
        assert_eq!(bodies, vec!["one"]);
        assert_eq!(fetcher.requests.borrow().len(), 2);
    }

    #[test]
    fn test_fetch_pages_first_page_failure_is_error() {
        let fetcher = FakeFetcher::default();
        assert!(fetch_pages(&fetcher, "u?p={page}", 5, |_, _| Ok(())).is_err());
    }

    #[test]
    fn test_fetch_pages_single_page_template() {
        let fetcher = FakeFetcher::default().with("u", "only");
        let bodies = fetch_pages(&fetcher, "u", 20, |_, _| Ok(())).unwrap();
        assert_eq!(bodies, vec!["only"]);
        assert_eq!(fetcher.requests.borrow().len(), 1);
    }
}
