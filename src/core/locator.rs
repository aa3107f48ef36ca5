//! Image locator
//!
//! Resolves an image descriptor to one concrete file. Direct URLs and local
//! paths pass straight through; listing URLs are walked depth-first, looking
//! for a file with a recognized image extension. Date-stamped directories
//! are visited newest first so the most recent build wins.
//!
//! The walk is bounded three ways: a maximum depth, a budget of listings
//! fetched, and a visited set. Every resolution therefore performs at most
//! `max_visits` fetches.

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use reqwest::Url;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::config::defaults;
use crate::core::image::{is_image_name, last_segment, Descriptor, ImageSource};
use crate::error::ResolutionError;

/// Fetches the body of a directory listing
pub trait ListingFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, String>>;
}

/// Resolves descriptors; the orchestrator's view of a [`Locator`]
pub trait ImageResolver: Send + Sync {
    fn resolve_image<'a>(
        &'a self,
        descriptor: &'a str,
    ) -> BoxFuture<'a, Result<ImageSource, ResolutionError>>;
}

/// One link found in a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Absolute URL
    pub url: String,
    /// Last path segment, without trailing slash
    pub name: String,
    pub is_dir: bool,
}

fn href_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).ok())
        .as_ref()
}

fn date_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(?:\d{4}-\d{2}-\d{2}|\d{4}_\d{2}_\d{2}|\d{4}\.\d{2}\.\d{2}|\d{8})(?:$|\D)")
                .ok()
        })
        .as_ref()
}

/// Sort key for a date-stamped directory name (`YYYYMMDD`), if it is one
pub fn date_key(name: &str) -> Option<String> {
    let matched = date_pattern()?.find(name)?;
    Some(
        matched
            .as_str()
            .chars()
            .filter(char::is_ascii_digit)
            .take(8)
            .collect(),
    )
}

/// Extract child links from a listing page
///
/// Only links strictly below `base` are kept, which drops parent links,
/// other hosts and absolute paths elsewhere on the server. Sort links
/// (`?C=N;O=D`) and fragments are ignored.
pub fn parse_links(base: &str, html: &str) -> Vec<Link> {
    let Some(pattern) = href_pattern() else {
        return Vec::new();
    };
    let base_url = match Url::parse(base) {
        Ok(url) => url,
        Err(e) => {
            warn!("Cannot parse listing URL '{}': {}", base, e);
            return Vec::new();
        }
    };
    let base_str = base_url.as_str();

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for capture in pattern.captures_iter(html) {
        let href = capture[1].trim();
        if href.starts_with('?') || href.starts_with('#') || href.starts_with("mailto:") {
            continue;
        }
        let Ok(mut url) = base_url.join(href) else {
            continue;
        };
        url.set_fragment(None);
        if url.query().is_some() {
            continue;
        }

        let absolute = url.to_string();
        if absolute.len() <= base_str.len() || !absolute.starts_with(base_str) {
            continue;
        }
        if !seen.insert(absolute.clone()) {
            continue;
        }

        let is_dir = absolute.ends_with('/');
        links.push(Link {
            name: last_segment(&absolute).to_string(),
            url: absolute,
            is_dir,
        });
    }
    links
}

/// Order sub-directories for descent: date-stamped newest first, then the
/// rest in listing order
pub fn order_directories(links: &[Link]) -> Vec<&Link> {
    let mut dated: Vec<(String, &Link)> = Vec::new();
    let mut plain = Vec::new();
    for link in links.iter().filter(|l| l.is_dir) {
        match date_key(&link.name) {
            Some(key) => dated.push((key, link)),
            None => plain.push(link),
        }
    }
    dated.sort_by(|(ka, la), (kb, lb)| kb.cmp(ka).then_with(|| lb.name.cmp(&la.name)));
    dated.into_iter().map(|(_, l)| l).chain(plain).collect()
}

/// Resolves descriptors to concrete image sources
pub struct Locator<F> {
    fetcher: F,
    max_depth: usize,
    max_visits: usize,
}

impl<F: ListingFetcher> Locator<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            max_depth: defaults::MAX_LISTING_DEPTH,
            max_visits: defaults::MAX_LISTING_VISITS,
        }
    }

    #[must_use]
    pub fn with_limits(mut self, max_depth: usize, max_visits: usize) -> Self {
        self.max_depth = max_depth;
        self.max_visits = max_visits.max(1);
        self
    }

    /// Resolve a descriptor to exactly one image
    pub async fn resolve(&self, descriptor: &str) -> Result<ImageSource, ResolutionError> {
        match Descriptor::parse(descriptor)? {
            Descriptor::Local(path) => ImageSource::local(&path),
            Descriptor::DirectUrl(url) => Ok(ImageSource::direct(&url)),
            Descriptor::Listing(url) => self.walk(&url).await,
        }
    }

    async fn walk(&self, root: &str) -> Result<ImageSource, ResolutionError> {
        let root = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{root}/")
        };

        let mut stack = vec![(root.clone(), 0usize)];
        let mut visited = HashSet::new();
        let mut traversal = Vec::new();

        while let Some((url, depth)) = stack.pop() {
            if traversal.len() >= self.max_visits {
                warn!("Listing budget of {} exhausted under {}", self.max_visits, root);
                break;
            }
            if !visited.insert(url.clone()) {
                continue;
            }

            debug!("Fetching listing {} (depth {})", url, depth);
            traversal.push(url.clone());

            let body = match self.fetcher.fetch(&url).await {
                Ok(body) => body,
                Err(error) if url == root => {
                    return Err(ResolutionError::Unreachable {
                        url,
                        error,
                        path: traversal,
                    });
                }
                Err(error) => {
                    warn!("Skipping unreachable listing {}: {}", url, error);
                    continue;
                }
            };

            let links = parse_links(&url, &body);
            if let Some(file) = links.iter().find(|l| !l.is_dir && is_image_name(&l.name)) {
                info!("Resolved {} to {}", root, file.url);
                return Ok(ImageSource::from_listing(&root, &file.url, traversal));
            }

            if depth < self.max_depth {
                for dir in order_directories(&links).into_iter().rev() {
                    if !visited.contains(&dir.url) {
                        stack.push((dir.url.clone(), depth + 1));
                    }
                }
            }
        }

        Err(ResolutionError::NoMatch {
            root,
            max_depth: self.max_depth,
            path: traversal,
        })
    }
}

impl<F: ListingFetcher> ImageResolver for Locator<F> {
    fn resolve_image<'a>(
        &'a self,
        descriptor: &'a str,
    ) -> BoxFuture<'a, Result<ImageSource, ResolutionError>> {
        self.resolve(descriptor).boxed()
    }
}
