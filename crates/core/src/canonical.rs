//! Upstream URL canonicalization.
//!
//! Client URLs arrive with Git endpoint suffixes (`/info/refs`,
//! `/git-upload-pack`, ...) and host-specific decorations. Canonicalization
//! maps them to the one upstream URL that identifies a repository, which
//! doubles as the local cache key.

use std::path::{Path, PathBuf};

use url::Url;

use crate::status::{Status, StatusResult};

/// Maps a client-supplied URL to the canonical upstream URL.
pub trait UrlCanonicalizer: Send + Sync + 'static {
    fn canonicalize(&self, url: &Url) -> StatusResult<Url>;
}

/// Default canonicalizer.
///
/// Forces `https`, strips the Git endpoint suffixes, a trailing `.git` and
/// a leading `/a/` authorization prefix, and optionally restricts the set
/// of accepted hosts. With `override_base` set, the scheme/host/port of
/// every canonical URL are replaced by the base; this is how tests point
/// the proxy at a local upstream.
pub struct HostCanonicalizer {
    allowed_hosts: Vec<String>,
    override_base: Option<Url>,
}

impl HostCanonicalizer {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts,
            override_base: None,
        }
    }

    /// Rewrite every canonical URL onto `base`, keeping only the path.
    pub fn with_override_base(base: Url) -> Self {
        Self {
            allowed_hosts: Vec::new(),
            override_base: Some(base),
        }
    }
}

fn strip_endpoint_suffixes(path: &str) -> &str {
    let path = path
        .strip_suffix("/info/refs")
        .or_else(|| path.strip_suffix("/git-upload-pack"))
        .or_else(|| path.strip_suffix("/git-receive-pack"))
        .unwrap_or(path);
    path.strip_suffix(".git").unwrap_or(path)
}

impl UrlCanonicalizer for HostCanonicalizer {
    fn canonicalize(&self, url: &Url) -> StatusResult<Url> {
        let mut path = strip_endpoint_suffixes(url.path()).to_string();
        if let Some(rest) = path.strip_prefix("/a/") {
            path = format!("/{rest}");
        }

        if let Some(base) = &self.override_base {
            let mut ret = base.clone();
            ret.set_path(&path);
            return Ok(ret);
        }

        let host = url
            .host_str()
            .ok_or_else(|| Status::invalid_argument("request URL has no host"))?;
        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.iter().any(|h| h == host) {
            return Err(Status::invalid_argument(format!("unsupported host: {host}")));
        }

        let mut ret = Url::parse(&format!("https://{host}"))
            .map_err(|e| Status::invalid_argument(format!("cannot canonicalize URL: {e}")))?;
        ret.set_path(&path);
        if let Some(port) = url.port() {
            ret.set_port(Some(port))
                .map_err(|_| Status::invalid_argument("cannot canonicalize URL: bad port"))?;
        }
        Ok(ret)
    }
}

/// Local mirror directory for a canonical upstream URL:
/// `<root>/<host>/<path>`.
pub fn cache_path(root: &Path, url: &Url) -> PathBuf {
    let mut path = root.to_path_buf();
    if let Some(host) = url.host_str() {
        match url.port() {
            Some(port) => path.push(format!("{host}:{port}")),
            None => path.push(host),
        }
    }
    for segment in url.path().split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

/// Object-store prefix for a canonical upstream URL: `<host>/<path>`.
pub fn object_prefix(url: &Url) -> String {
    let mut parts = Vec::new();
    if let Some(host) = url.host_str() {
        match url.port() {
            Some(port) => parts.push(format!("{host}:{port}")),
            None => parts.push(host.to_string()),
        }
    }
    for segment in url.path().split('/').filter(|s| !s.is_empty()) {
        parts.push(segment.to_string());
    }
    parts.join("/")
}
