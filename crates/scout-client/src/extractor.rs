use std::sync::Arc;

use htmd::HtmlToMarkdown;
use scout_core::error::AppError;
use scout_core::models::{Content, ExtractedRecord, RecordKind, ScrapeTarget};
use scout_core::traits::Extractor;
use scraper::{Html, Selector};

/// Page-level extractor: one record per fetched page.
///
/// Pulls the `<title>`, picks `<main>`/`<article>`/`<body>` as the content
/// root and converts it to Markdown, stripping non-content elements
/// (script, style, nav, etc.) so layout churn does not read as a change.
pub struct PageExtractor {
    converter: Arc<HtmlToMarkdown>,
}

impl Clone for PageExtractor {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
        }
    }
}

impl PageExtractor {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }

    fn title(doc: &Html) -> Option<String> {
        let selector = Selector::parse("title").ok()?;
        doc.select(&selector)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    }

    fn main_html(doc: &Html) -> String {
        ["main", "article", "body"]
            .iter()
            .filter_map(|tag| Selector::parse(tag).ok())
            .find_map(|selector| doc.select(&selector).next().map(|node| node.inner_html()))
            .unwrap_or_else(|| doc.root_element().html())
    }
}

impl Default for PageExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for PageExtractor {
    fn extract(
        &self,
        target: &ScrapeTarget,
        content: &Content,
    ) -> Result<Vec<ExtractedRecord>, AppError> {
        let doc = Html::parse_document(&content.body);
        let title = Self::title(&doc);
        let markdown = self
            .converter
            .convert(&Self::main_html(&doc))
            .map_err(|e| AppError::ParseError(format!("{}: {e}", target.url)))?;

        if markdown.trim().is_empty() {
            return Err(AppError::ParseError(format!(
                "{}: no readable content",
                target.url
            )));
        }

        Ok(vec![ExtractedRecord::new(
            RecordKind::Page,
            target.url.clone(),
            serde_json::json!({
                "url": target.url,
                "target_kind": target.kind.as_str(),
                "title": title,
                "markdown": markdown.trim(),
            }),
        )])
    }
}
