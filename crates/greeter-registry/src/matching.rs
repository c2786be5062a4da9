//! Wildcard URL matching for routing rules.
//!
//! `*` matches any run of characters, including `/` and `.`, so
//! `/pricing*` covers `/pricing/enterprise` and `*.acme.com` covers
//! `shop.eu.acme.com`. Every other character is literal, including the
//! glob metacharacters `?`, `[` and `{`. Domains compare case-insensitively;
//! paths do not.

use globset::{GlobBuilder, GlobMatcher};

/// A compiled wildcard pattern.
#[derive(Clone, Debug)]
pub struct RoutePattern {
    source: String,
    matcher: GlobMatcher,
}

impl RoutePattern {
    /// Compile a domain pattern. Empty means "any domain".
    pub fn domain(pattern: &str) -> Result<Self, globset::Error> {
        Self::compile(pattern, true)
    }

    /// Compile a path pattern. Empty means "any path".
    pub fn path(pattern: &str) -> Result<Self, globset::Error> {
        Self::compile(pattern, false)
    }

    fn compile(pattern: &str, case_insensitive: bool) -> Result<Self, globset::Error> {
        let pattern = pattern.trim();
        let effective = if pattern.is_empty() { "*" } else { pattern };
        let matcher = GlobBuilder::new(&star_only_glob(effective))
            .literal_separator(false)
            .case_insensitive(case_insensitive)
            .backslash_escape(false)
            .build()?
            .compile_matcher();
        Ok(Self {
            source: effective.to_owned(),
            matcher,
        })
    }

    /// Whether `candidate` matches.
    pub fn is_match(&self, candidate: &str) -> bool {
        self.matcher.is_match(candidate)
    }

    /// The pattern text.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Rewrite `pattern` so only `*` is a wildcard. Runs of `*` collapse to one.
fn star_only_glob(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for (i, literal) in pattern.split('*').enumerate() {
        if i > 0 && !glob.ends_with('*') {
            glob.push('*');
        }
        glob.push_str(&globset::escape(literal));
    }
    glob
}

/// Host and path of a page URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageLocation {
    /// Lower-cased host; empty when the page URL carried none.
    pub host: String,
    /// Path, always starting with `/`.
    pub path: String,
}

impl PageLocation {
    /// Split a page URL. Bare paths (`/pricing`) and scheme-less hosts
    /// (`acme.com/pricing`) are accepted too.
    pub fn parse(page_url: &str) -> Self {
        let trimmed = page_url.trim();
        if let Ok(url) = url::Url::parse(trimmed) {
            if let Some(host) = url.host_str() {
                return Self {
                    host: host.to_ascii_lowercase(),
                    path: url.path().to_owned(),
                };
            }
        }
        if trimmed.starts_with('/') {
            return Self {
                host: String::new(),
                path: strip_query(trimmed).to_owned(),
            };
        }
        match url::Url::parse(&format!("https://{trimmed}")) {
            Ok(url) => Self {
                host: url.host_str().unwrap_or_default().to_ascii_lowercase(),
                path: url.path().to_owned(),
            },
            Err(_) => Self {
                host: String::new(),
                path: "/".to_owned(),
            },
        }
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}
