//! Selector-driven parser for listing and detail pages.
//!
//! Selectors come from [`SelectorConfig`] and are compiled once, so a bad
//! selector fails at startup instead of on the first page.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use prowl_core::config::SelectorConfig;
use prowl_core::error::AppError;
use prowl_core::traits::ListingParser;
use scraper::{Html, Selector};
use url::Url;

#[derive(Debug)]
struct CompiledSelectors {
    listing_link: Selector,
    fields: Vec<(String, Selector)>,
    required_fields: Vec<String>,
}

/// [`ListingParser`] backed by CSS selectors.
#[derive(Debug, Clone)]
pub struct SelectorParser {
    selectors: Arc<CompiledSelectors>,
}

impl SelectorParser {
    pub fn new(config: &SelectorConfig) -> Result<Self, AppError> {
        let listing_link = compile("listing_link", &config.listing_link)?;

        let fields = config
            .fields
            .iter()
            .map(|(name, css)| Ok((name.clone(), compile(name, css)?)))
            .collect::<Result<Vec<_>, AppError>>()?;

        if let Some(missing) = config
            .required_fields
            .iter()
            .find(|f| !config.fields.contains_key(*f))
        {
            return Err(AppError::ConfigError(format!(
                "Required field '{missing}' has no selector"
            )));
        }

        Ok(Self {
            selectors: Arc::new(CompiledSelectors {
                listing_link,
                fields,
                required_fields: config.required_fields.clone(),
            }),
        })
    }
}

fn compile(name: &str, css: &str) -> Result<Selector, AppError> {
    Selector::parse(css)
        .map_err(|e| AppError::ConfigError(format!("Invalid selector '{css}' for {name}: {e}")))
}

impl ListingParser for SelectorParser {
    fn listing_urls(&self, html: &str, page_url: &str) -> Result<Vec<String>, AppError> {
        let base = Url::parse(page_url).map_err(|e| AppError::ParseError {
            url: page_url.to_string(),
            reason: format!("invalid page URL: {e}"),
        })?;
        let document = Html::parse_document(html);

        let mut seen = HashSet::new();
        let urls = document
            .select(&self.selectors.listing_link)
            .filter_map(|el| el.value().attr("href"))
            .filter_map(|href| resolve_link(href, &base))
            .filter(|url| seen.insert(url.clone()))
            .collect();

        Ok(urls)
    }

    fn detail_fields(&self, html: &str, url: &str) -> Result<BTreeMap<String, String>, AppError> {
        let document = Html::parse_document(html);

        let fields: BTreeMap<String, String> = self
            .selectors
            .fields
            .iter()
            .filter_map(|(name, selector)| {
                let element = document.select(selector).next()?;
                let text = normalize_text(element.text());
                (!text.is_empty()).then(|| (name.clone(), text))
            })
            .collect();

        if let Some(missing) = self
            .selectors
            .required_fields
            .iter()
            .find(|f| !fields.contains_key(*f))
        {
            return Err(AppError::ParseError {
                url: url.to_string(),
                reason: format!("missing required field '{missing}'"),
            });
        }
        if fields.is_empty() {
            return Err(AppError::ParseError {
                url: url.to_string(),
                reason: "no configured field matched".into(),
            });
        }

        Ok(fields)
    }
}

/// Resolve `href` against the listing page, keeping only http(s) targets.
/// Fragments are dropped so anchors into the same listing dedupe.
fn resolve_link(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let mut url = base.join(href).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

fn normalize_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
