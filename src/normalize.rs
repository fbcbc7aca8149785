use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://").expect("valid scheme pattern"));

pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison key only; never store or display the result.
pub fn normalize_text(value: &str) -> String {
    normalize_whitespace(value).to_lowercase()
}

pub fn normalize_url(value: &str) -> String {
    CanonicalUrl::parse(value)
        .map(|url| url.to_string())
        .unwrap_or_default()
}

/// A URL reduced to the parts that identify a resource for dedup purposes.
///
/// `http` and `https` collapse to `https`, the host is lowercased, repeated
/// path separators collapse and a trailing separator is dropped. Path and query
/// are otherwise kept as written and the fragment is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    scheme: String,
    host: String,
    path: String,
    query: Option<String>,
}

impl CanonicalUrl {
    pub fn parse(value: &str) -> Option<Self> {
        let value = normalize_whitespace(value);
        if value.is_empty() {
            return None;
        }
        Some(Self::split(&value))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn split(value: &str) -> Self {
        let without_fragment = value.split('#').next().unwrap_or_default();
        let (scheme, rest) = match SCHEME_RE.find(without_fragment) {
            Some(found) => (
                &without_fragment[..found.end() - 3],
                &without_fragment[found.end()..],
            ),
            None => ("https", without_fragment),
        };
        let host_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (host, tail) = rest.split_at(host_end);
        let (path, query) = match tail.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (tail, None),
        };
        Self::assemble(scheme, &host.to_lowercase(), path, query)
    }

    fn assemble(scheme: &str, host: &str, path: &str, query: Option<&str>) -> Self {
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => "https".to_string(),
            other => other.to_string(),
        };
        Self {
            scheme,
            host: host.to_string(),
            path: collapse_path(path),
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
        }
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

fn collapse_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    out.trim_end_matches('/').to_string()
}
