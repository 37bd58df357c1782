//! Link collection from paginated result listings.
//!
//! Two pagination shapes are supported. Search results advertise a total via
//! a human-readable "Showing A to B of N Results" label and are walked by
//! clicking numbered pagination buttons. Dataset pages are addressed with a
//! `?page=N` suffix from 0 upward and simply stop at the first page with no
//! matching links — the catalog exposes no reliable last-page marker, so an
//! empty page is conclusive exhaustion, not a transient condition.

use anyhow::Result;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{gate, PageDriver};
use crate::models::Record;

/// Marker text the catalog shows for an empty result set.
pub const NO_RESULTS_TEXT: &str = "No results found";

/// Callback invoked after each processed page with that page's records,
/// so the caller can persist incremental progress.
pub type PageCallback<'a> = &'a mut dyn FnMut(&[Record]) -> Result<()>;

/// Number of result pages for a known result count.
pub fn pages_for(total_results: usize, page_size: usize) -> usize {
    if page_size == 0 {
        return 0;
    }
    total_results.div_ceil(page_size)
}

/// Collects records from the catalog's paginated listings.
pub struct LinkCollector {
    base_url: String,
    page_size: usize,
}

impl LinkCollector {
    pub fn new(base_url: impl Into<String>, page_size: usize) -> Self {
        Self {
            base_url: base_url.into(),
            page_size,
        }
    }

    /// Collect every record for one search term, page by page.
    ///
    /// Stops at `max_pages`, at the advertised page count, at a failed page
    /// transition, or at the first page yielding zero records. `on_page` is
    /// invoked for every page that produced records.
    pub async fn collect_for_term<P: PageDriver + ?Sized>(
        &self,
        page: &mut P,
        term: &str,
        max_pages: Option<usize>,
        on_page: PageCallback<'_>,
    ) -> Result<Vec<Record>> {
        let mut all = Vec::new();

        if !self.search_term(page, term).await? {
            return Ok(all);
        }

        let content = page.content().await?;
        let total_pages = self.total_pages(&content, max_pages);
        if total_pages == 0 {
            return Ok(all);
        }

        info!("  page 1/{} - extracting links...", total_pages);
        let records = self.extract_results_page(&content);
        on_page(&records)?;
        info!("  page 1/{}: {} links", total_pages, records.len());
        all.extend(records);

        for page_num in 2..=total_pages {
            info!("  navigating to page {}...", page_num);
            if !self.navigate_to_results_page(page, page_num).await? {
                warn!("  stopping at page {}", page_num - 1);
                break;
            }

            let content = page.content().await?;
            let records = self.extract_results_page(&content);
            if records.is_empty() {
                warn!("  no links on page {}, stopping", page_num);
                break;
            }

            on_page(&records)?;
            all.extend(records);
            info!("  page {}/{}: total {} links", page_num, total_pages, all.len());
        }

        Ok(all)
    }

    /// Collect every record from one dataset, walking `?page=N` from 0.
    ///
    /// A failed navigation ends the dataset; pages processed before the
    /// failure have already been reported through `on_page`.
    pub async fn collect_from_dataset<P: PageDriver + ?Sized>(
        &self,
        page: &mut P,
        dataset_url: &str,
        on_page: PageCallback<'_>,
    ) -> Result<Vec<Record>> {
        info!("processing dataset: {}", dataset_url);
        let base = dataset_url.split('?').next().unwrap_or(dataset_url);
        let mut all = Vec::new();
        let mut page_num = 0usize;

        loop {
            let current_url = format!("{}?page={}", base, page_num);
            info!("  page {} - loading {}...", page_num + 1, current_url);

            if let Err(e) = page.goto(&current_url).await {
                warn!("  navigation failed: {}", e);
                break;
            }

            if page_num == 0 {
                gate::pass_gates(page).await?;
            }
            page.settle(2000).await;

            let content = page.content().await?;
            let records = self.extract_dataset_page(&content, dataset_url);
            if records.is_empty() {
                if page_num == 0 {
                    warn!("no links found in dataset");
                } else {
                    info!("no more links, dataset exhausted");
                }
                break;
            }

            on_page(&records)?;
            info!(
                "  page {}: {} links (total {})",
                page_num + 1,
                records.len(),
                all.len() + records.len()
            );
            all.extend(records);
            page_num += 1;
        }

        info!("  dataset total: {} links", all.len());
        Ok(all)
    }

    /// Type a term into the search box and wait for results to render.
    pub async fn search_term<P: PageDriver + ?Sized>(
        &self,
        page: &mut P,
        term: &str,
    ) -> Result<bool> {
        info!("searching for '{}'", term);

        let _ = page.evaluate("window.scrollTo(0, 500)").await;
        page.settle(2000).await;

        let script = format!(
            r#"(() => {{
                const input = document.getElementById('searchInput');
                const button = document.getElementById('searchButton');
                if (!input || !button) return false;
                input.value = '';
                input.value = {term};
                input.dispatchEvent(new Event('input', {{ bubbles: true }}));
                button.click();
                return true;
            }})()"#,
            term = serde_json::to_string(term)?
        );

        if !page.evaluate_bool(&script).await? {
            error!("search controls not found on page");
            return Ok(false);
        }

        info!("waiting for results to load (may take 20-30 seconds)...");
        self.wait_for_results(page, 60).await
    }

    /// Poll until the results pane has rendered or `max_wait_secs` passes.
    async fn wait_for_results<P: PageDriver + ?Sized>(
        &self,
        page: &mut P,
        max_wait_secs: u64,
    ) -> Result<bool> {
        let mut waited = 0u64;

        while waited < max_wait_secs {
            page.settle(5000).await;
            waited += 5;
            let content = page.content().await?;

            if content.contains(r#"id="loadingMessage" style="display: block"#) {
                info!("  still loading... ({}s)", waited);
                continue;
            }

            if content.contains("Showing") && content.contains("Results") {
                info!("results loaded after {}s", waited);
                return Ok(true);
            }

            if self.has_result_links(&content) {
                info!("results loaded after {}s (found links)", waited);
                return Ok(true);
            }

            // The empty-results page suggests trying a different search.
            if waited >= 15 && content.to_lowercase().contains("different search") {
                warn!("no results found for this search");
                return Ok(true);
            }
        }

        warn!("timeout after {}s waiting for results", waited);
        Ok(false)
    }

    /// Click the numbered pagination button and verify the page has content.
    async fn navigate_to_results_page<P: PageDriver + ?Sized>(
        &self,
        page: &mut P,
        target: usize,
    ) -> Result<bool> {
        let _ = page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await;
        page.settle(1000).await;

        let script = format!(
            r#"(() => {{
                const buttons = document.querySelectorAll('.usa-pagination__button, .usa-pagination a');
                for (const btn of buttons) {{
                    if (btn.textContent.trim() === '{target}') {{
                        btn.click();
                        return true;
                    }}
                }}
                return false;
            }})()"#
        );

        if !page.evaluate_bool(&script).await? {
            warn!("  page {} button not found", target);
            return Ok(false);
        }

        info!("  loading page {}...", target);
        page.settle(5000).await;
        let _ = page.evaluate("window.scrollTo(0, 500)").await;
        page.settle(2000).await;

        let content = page.content().await?;
        if content.contains(NO_RESULTS_TEXT) {
            warn!("  page {} is empty", target);
            return Ok(false);
        }
        if !self.has_result_links(&content) {
            warn!("  page {} has no links", target);
            return Ok(false);
        }
        Ok(true)
    }

    /// Expand the accordion section whose button text includes `label`.
    pub async fn expand_section<P: PageDriver + ?Sized>(
        &self,
        page: &mut P,
        label: &str,
    ) -> Result<bool> {
        info!("expanding '{}' menu...", label);
        page.settle(2000).await;

        let script = format!(
            r#"(() => {{
                const buttons = Array.from(document.querySelectorAll('.usa-accordion__button'));
                const target = buttons.find(b => b.textContent.includes({label}));
                if (target) {{ target.click(); return true; }}
                return false;
            }})()"#,
            label = serde_json::to_string(label)?
        );

        if page.evaluate_bool(&script).await? {
            page.settle(2000).await;
            Ok(true)
        } else {
            error!("accordion button for '{}' not found", label);
            Ok(false)
        }
    }

    /// Dataset page links in the expanded section, deduplicated in order.
    pub fn dataset_links(&self, content: &str, href_pattern: &str) -> Vec<String> {
        let document = Html::parse_document(content);
        let link_sel = match Selector::parse("a[href]") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };

        let mut links: Vec<String> = Vec::new();
        for element in document.select(&link_sel) {
            let href = match element.value().attr("href") {
                Some(h) => h,
                None => continue,
            };
            if !href.contains(href_pattern) {
                continue;
            }
            if let Some(full_url) = self.resolve(href) {
                if !links.contains(&full_url) {
                    links.push(full_url);
                }
            }
        }
        links
    }

    /// Total result pages for the current content, honoring an optional cap.
    pub fn total_pages(&self, content: &str, max_pages: Option<usize>) -> usize {
        if let Some(total_results) = self.parse_total_results(content) {
            let total = pages_for(total_results, self.page_size);
            info!("{} results across {} pages", total_results, total);
            return match max_pages {
                Some(cap) if cap < total => {
                    info!("will process {} pages (limit: {})", cap, cap);
                    cap
                }
                _ => total,
            };
        }

        if self.has_result_links(content) {
            info!("links present but no pagination label");
            return max_pages.unwrap_or(1);
        }

        if content.contains(NO_RESULTS_TEXT) {
            return 0;
        }

        warn!("could not find pagination label, assuming 1 page");
        1
    }

    fn parse_total_results(&self, content: &str) -> Option<usize> {
        let re = Regex::new(r"Showing \d+ to \d+ of ([\d,]+) Results").ok()?;
        let caps = re.captures(content)?;
        caps.get(1)?.as_str().replace(',', "").parse().ok()
    }

    fn has_result_links(&self, content: &str) -> bool {
        let document = Html::parse_document(content);
        let (Ok(container_sel), Ok(link_sel)) =
            (Selector::parse("div#results"), Selector::parse("a[href]"))
        else {
            return false;
        };

        document
            .select(&container_sel)
            .next()
            .map(|container| {
                container.select(&link_sel).any(|a| {
                    a.value()
                        .attr("href")
                        .is_some_and(|h| h.to_lowercase().contains(".pdf"))
                })
            })
            .unwrap_or(false)
    }

    /// Records from a search-results page: PDF anchors inside `#results`,
    /// with the dataset label read from the enclosing heading.
    pub fn extract_results_page(&self, content: &str) -> Vec<Record> {
        let mut records = Vec::new();
        let document = Html::parse_document(content);
        let (Ok(container_sel), Ok(link_sel)) =
            (Selector::parse("div#results"), Selector::parse("a[href]"))
        else {
            return records;
        };

        let Some(container) = document.select(&container_sel).next() else {
            warn!("results container #results not found");
            return records;
        };

        for link in container.select(&link_sel) {
            let href = match link.value().attr("href") {
                Some(h) => h,
                None => continue,
            };
            if !href.to_lowercase().contains(".pdf") {
                continue;
            }
            let Some(full_url) = self.resolve(href) else {
                continue;
            };

            let text = link.text().collect::<String>().trim().to_string();
            let dataset = dataset_label_from_heading(&link);
            match Record::new(full_url, text, dataset) {
                Ok(record) => records.push(record),
                Err(e) => debug!("skipping link: {}", e),
            }
        }

        records
    }

    /// Records from a dataset page: anchors ending in `.pdf`, labeled with
    /// the dataset name derived from the page URL.
    pub fn extract_dataset_page(&self, content: &str, dataset_url: &str) -> Vec<Record> {
        let dataset_name = dataset_name_from_url(dataset_url);
        let mut records = Vec::new();
        let document = Html::parse_document(content);
        let link_sel = match Selector::parse("a[href]") {
            Ok(s) => s,
            Err(_) => return records,
        };

        for link in document.select(&link_sel) {
            let href = match link.value().attr("href") {
                Some(h) => h,
                None => continue,
            };
            if !href.to_lowercase().ends_with(".pdf") {
                continue;
            }
            let Some(full_url) = self.resolve(href) else {
                continue;
            };

            let text = link.text().collect::<String>().trim().to_string();
            match Record::new(full_url, text, Some(dataset_name.clone())) {
                Ok(record) => records.push(record),
                Err(e) => debug!("skipping link: {}", e),
            }
        }

        records
    }

    fn resolve(&self, href: &str) -> Option<String> {
        Url::parse(&self.base_url)
            .ok()?
            .join(href)
            .ok()
            .map(|u| u.to_string())
    }
}

/// Dataset label from the heading enclosing a result link ("… - <label>").
fn dataset_label_from_heading(link: &ElementRef<'_>) -> Option<String> {
    for ancestor in link.ancestors() {
        if let Some(el) = ElementRef::wrap(ancestor) {
            if el.value().name() == "h3" {
                let text: String = el.text().collect();
                if let Some((_, label)) = text.rsplit_once(" - ") {
                    let label = label.trim();
                    if !label.is_empty() {
                        return Some(label.to_string());
                    }
                }
                return None;
            }
        }
    }
    None
}

/// Human-readable dataset name from its page URL tail
/// (`…/data-set-3-files` -> "Data Set 3 Files").
fn dataset_name_from_url(dataset_url: &str) -> String {
    let base = dataset_url.split('?').next().unwrap_or(dataset_url);
    let tail = base.trim_end_matches('/').rsplit('/').next().unwrap_or(base);
    tail.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
