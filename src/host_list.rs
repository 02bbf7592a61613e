//! The ordered, append-only set of coordinator endpoints.

use crate::error::{PoolError, Result};
use crate::transport::EndpointTransport;
use std::sync::Arc;

/// One coordinator: its normalized URL and the transport bound to it.
pub struct Endpoint {
    pub url: String,
    pub transport: Arc<dyn EndpointTransport>,
}

/// Normalizes `tcp`/`ssl`/`tls` scheme aliases and the various unix-socket
/// spellings ArangoDB clients accept, the way arangojs's connection layer does.
///
/// Returns the normalized URL plus whether it addresses a unix socket (such
/// endpoints dedup and display correctly even though this transport cannot
/// dial them).
pub fn normalize_url(raw: &str) -> Result<(String, bool)> {
    if let Some(path) = raw.strip_prefix("unix://") {
        return Ok((format!("http+unix://{path}"), true));
    }
    if raw.starts_with("http+unix://") || raw.starts_with("https+unix://") {
        return Ok((raw.to_string(), true));
    }
    if let Some(rest) = raw.strip_prefix("http://unix:") {
        return Ok((format!("http+unix://{rest}"), true));
    }
    if let Some(rest) = raw.strip_prefix("https://unix:") {
        return Ok((format!("https+unix://{rest}"), true));
    }

    let aliased = if let Some(rest) = raw.strip_prefix("tcp://") {
        format!("http://{rest}")
    } else if let Some(rest) = raw.strip_prefix("ssl://") {
        format!("https://{rest}")
    } else if let Some(rest) = raw.strip_prefix("tls://") {
        format!("https://{rest}")
    } else {
        raw.to_string()
    };

    let parsed = url::Url::parse(&aliased)?;
    Ok((parsed.to_string(), false))
}

/// Ordered, deduplicated list of coordinator endpoints. Indices are stable for
/// the life of the pool: entries are appended, never reordered or removed.
#[derive(Default)]
pub struct HostList {
    entries: Vec<Endpoint>,
}

impl HostList {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Endpoint> {
        self.entries.get(index)
    }

    pub fn url_at(&self, index: usize) -> Result<&str> {
        self.entries
            .get(index)
            .map(|e| e.url.as_str())
            .ok_or(PoolError::NoSuchHost(index))
    }

    /// Appends `urls` not already present, returning each input's resulting
    /// index (existing or newly assigned) in input order. `make_transport` may
    /// fail (e.g. an unsupported unix-socket endpoint); on failure no entry is
    /// added for that URL and the error propagates to the caller.
    pub fn add<F>(&mut self, urls: &[String], make_transport: F) -> Result<Vec<usize>>
    where
        F: Fn(&str) -> Result<Arc<dyn EndpointTransport>>,
    {
        let mut indices = Vec::with_capacity(urls.len());
        for raw in urls {
            let (normalized, _is_unix) = normalize_url(raw)?;
            if let Some(pos) = self.entries.iter().position(|e| e.url == normalized) {
                indices.push(pos);
                continue;
            }
            let transport = make_transport(&normalized)?;
            self.entries.push(Endpoint {
                url: normalized,
                transport,
            });
            indices.push(self.entries.len() - 1);
        }
        Ok(indices)
    }

    /// Convenience for adding a single, already-resolved endpoint (used for
    /// leader redirects, which must not re-run the full `add` validation twice).
    pub fn add_one<F>(&mut self, raw: &str, make_transport: F) -> Result<usize>
    where
        F: FnOnce(&str) -> Result<Arc<dyn EndpointTransport>>,
    {
        let (normalized, _is_unix) = normalize_url(raw)?;
        if let Some(pos) = self.entries.iter().position(|e| e.url == normalized) {
            return Ok(pos);
        }
        let transport = make_transport(&normalized)?;
        self.entries.push(Endpoint {
            url: normalized,
            transport,
        });
        Ok(self.entries.len() - 1)
    }
}
