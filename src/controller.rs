//! The cache decision engine.
//!
//! The controller is pure with respect to its inputs: it performs no I/O
//! and reads time only through its injected [`Clock`]. Given a new
//! request and an optionally stored entry it decides between serving the
//! stored response, revalidating it conditionally against the origin, or
//! passing the request through; given an origin response it decides
//! whether the response may be admitted at all. Both execution families
//! share this one implementation verbatim.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::debug;

use crate::clock::{Clock, SystemClock};
use crate::headers::{is_hop_by_hop, CacheControl, MaxStale, Vary};
use crate::key::{generate_key, KeyGenerator, DEFAULT_BODY_KEYED_METHODS};
use crate::model::{Request, Response, StoredEntry};

// rfc9111 3: status codes cacheable by default
const DEFAULT_CACHEABLE_STATUS_CODES: &[u16] =
    &[200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 501];

const DEFAULT_CACHEABLE_METHODS: &[&str] = &["GET", "HEAD"];

// Permanent redirects may be reused without explicit freshness
// information (rfc9111 4.2.2).
const PERMANENT_REDIRECTS: &[u16] = &[301, 308];

/// The heuristic fraction of a response's age used as its freshness
/// lifetime when the origin gave no explicit lifetime.
const HEURISTIC_FRACTION: u32 = 10;

/// The outcome of consulting the cache for a request.
#[derive(Debug)]
pub enum CacheDecision {
    /// The stored response is fresh and selected; serve it.
    Fresh(Response),
    /// Forward this (possibly conditional) request, then merge the answer
    /// with the stored entry.
    NeedsValidation(Request),
    /// No usable entry; pass the request through.
    Miss,
}

/// The cache decision engine.
///
/// Construct with [`Controller::new`] and chain `with_*` methods:
///
/// ```
/// use hishel::Controller;
///
/// let controller = Controller::new()
///     .with_cacheable_methods(&["GET", "HEAD", "POST"])
///     .with_allow_stale(true);
/// ```
#[derive(Clone)]
pub struct Controller {
    cacheable_methods: Vec<String>,
    cacheable_status_codes: Vec<u16>,
    allow_heuristics: bool,
    allow_stale: bool,
    shared: bool,
    force_cache: bool,
    clock: Arc<dyn Clock>,
    key_generator: Option<KeyGenerator>,
    body_keyed_methods: Vec<String>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("cacheable_methods", &self.cacheable_methods)
            .field("cacheable_status_codes", &self.cacheable_status_codes)
            .field("allow_heuristics", &self.allow_heuristics)
            .field("allow_stale", &self.allow_stale)
            .field("shared", &self.shared)
            .field("force_cache", &self.force_cache)
            .field("clock", &self.clock)
            .field(
                "key_generator",
                &self.key_generator.as_ref().map(|_| "Fn(..)"),
            )
            .field("body_keyed_methods", &self.body_keyed_methods)
            .finish()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    /// A controller with the default configuration: `GET`/`HEAD` caching,
    /// the RFC default status-code set, shared-cache semantics, no
    /// heuristics, no stale serving, no forced caching.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cacheable_methods: DEFAULT_CACHEABLE_METHODS
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            cacheable_status_codes: DEFAULT_CACHEABLE_STATUS_CODES.to_vec(),
            allow_heuristics: false,
            allow_stale: false,
            shared: true,
            force_cache: false,
            clock: Arc::new(SystemClock),
            key_generator: None,
            body_keyed_methods: DEFAULT_BODY_KEYED_METHODS
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
        }
    }

    /// Replaces the set of methods whose responses may be cached.
    #[must_use]
    pub fn with_cacheable_methods(mut self, methods: &[&str]) -> Self {
        self.cacheable_methods =
            methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        self
    }

    /// Replaces the set of cacheable status codes.
    #[must_use]
    pub fn with_cacheable_status_codes(mut self, codes: &[u16]) -> Self {
        self.cacheable_status_codes = codes.to_vec();
        self
    }

    /// Permits heuristic freshness and heuristic storage.
    #[must_use]
    pub fn with_allow_heuristics(mut self, allow: bool) -> Self {
        self.allow_heuristics = allow;
        self
    }

    /// Permits serving a stored response when revalidation cannot reach
    /// the origin.
    #[must_use]
    pub fn with_allow_stale(mut self, allow: bool) -> Self {
        self.allow_stale = allow;
        self
    }

    /// Selects shared- or private-cache semantics (`s-maxage`, `private`).
    #[must_use]
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Ignores origin directives that would otherwise prevent caching.
    /// `Vary: *` and the method filter still apply.
    #[must_use]
    pub fn with_force_cache(mut self, force: bool) -> Self {
        self.force_cache = force;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the key deriver.
    #[must_use]
    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = Some(key_generator);
        self
    }

    /// Replaces the set of methods whose bodies participate in the key.
    #[must_use]
    pub fn with_body_keyed_methods(mut self, methods: &[&str]) -> Self {
        self.body_keyed_methods =
            methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        self
    }

    /// The current moment according to the injected clock.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Whether the request body participates in this request's key.
    #[must_use]
    pub fn body_keyed(&self, method: &str) -> bool {
        self.body_keyed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Derives the fingerprint for a request. The body is consulted when
    /// it is materialized and the method is body-keyed.
    #[must_use]
    pub fn cache_key(&self, request: &Request) -> String {
        let body = if self.body_keyed(&request.method) {
            request.body.bytes().map(|b| b.as_ref())
        } else {
            None
        };
        match &self.key_generator {
            Some(generator) => generator(request, body),
            None => generate_key(request, body),
        }
    }

    /// Decides what to do with a stored entry for a new request.
    #[must_use]
    pub fn construct_response_from_cache(
        &self,
        request: &Request,
        entry: &StoredEntry,
    ) -> CacheDecision {
        let stored_response = &entry.response;

        // selecting header fields nominated by the stored response must
        // match the presented request byte for byte
        match Vary::from_headers(&stored_response.headers) {
            Vary::Any => return CacheDecision::Miss,
            Vary::Fields(fields) => {
                for field in fields {
                    if request.headers.get_all(&field)
                        != entry.request.headers.get_all(&field)
                    {
                        debug!("vary mismatch on {field}");
                        return CacheDecision::Miss;
                    }
                }
            }
        }

        let request_cc = CacheControl::from_headers(&request.headers);
        if request_cc.no_store || request.cache_disabled() {
            return CacheDecision::Miss;
        }

        let response_cc = CacheControl::from_headers(&stored_response.headers);

        if !request_cc.no_cache {
            if PERMANENT_REDIRECTS.contains(&stored_response.status) {
                return self.serve_stored(stored_response);
            }
            if self.is_fresh(&request_cc, &response_cc, entry) {
                return self.serve_stored(stored_response);
            }
        }

        // stale (or revalidation was forced): ask the origin, carrying
        // the stored validators when there are any
        let mut validation = request.clone_shape();
        if let Some(etag) = stored_response.headers.get("etag") {
            validation.headers.replace("if-none-match", etag.clone());
        }
        if let Some(modified) = stored_response.headers.get("last-modified") {
            validation.headers.replace("if-modified-since", modified.clone());
        }
        CacheDecision::NeedsValidation(validation)
    }

    fn serve_stored(&self, stored_response: &Response) -> CacheDecision {
        match stored_response.clone_complete() {
            Some(response) => CacheDecision::Fresh(response),
            None => {
                debug!("stored response body is not materialized");
                CacheDecision::Miss
            }
        }
    }

    fn is_fresh(
        &self,
        request_cc: &CacheControl,
        response_cc: &CacheControl,
        entry: &StoredEntry,
    ) -> bool {
        let now = self.now();
        let age = self.current_age(entry, now);
        let mut lifetime =
            self.freshness_lifetime(response_cc, &entry.response, now);

        if let Some(max_age) = request_cc.max_age {
            if age > Duration::from_secs(max_age) {
                return false;
            }
        }
        if let Some(min_fresh) = request_cc.min_fresh {
            lifetime =
                lifetime.saturating_sub(Duration::from_secs(min_fresh));
        }
        let revalidation_required = response_cc.must_revalidate
            || (self.shared && response_cc.proxy_revalidate);
        if !revalidation_required {
            match request_cc.max_stale {
                Some(MaxStale::Unbounded) => return true,
                Some(MaxStale::Limit(extra)) => {
                    lifetime = lifetime
                        .saturating_add(Duration::from_secs(extra));
                }
                None => {}
            }
        }
        age < lifetime
    }

    fn current_age(&self, entry: &StoredEntry, now: SystemTime) -> Duration {
        let headers = &entry.response.headers;
        let created_at = entry.metadata.created_at;
        let initial_age = headers
            .get_str("age")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .or_else(|| {
                let date = headers
                    .get("date")
                    .and_then(|v| crate::headers::parse_http_date(v))?;
                created_at.duration_since(date).ok()
            })
            .unwrap_or_default();
        now.duration_since(created_at).unwrap_or_default() + initial_age
    }

    fn freshness_lifetime(
        &self,
        response_cc: &CacheControl,
        response: &Response,
        now: SystemTime,
    ) -> Duration {
        if self.shared {
            if let Some(s_maxage) = response_cc.s_maxage {
                return Duration::from_secs(s_maxage);
            }
        }
        if let Some(max_age) = response_cc.max_age {
            return Duration::from_secs(max_age);
        }
        if self.allow_heuristics {
            if let Some(modified) = response
                .headers
                .get("last-modified")
                .and_then(|v| crate::headers::parse_http_date(v))
            {
                if let Ok(since) = now.duration_since(modified) {
                    return since / HEURISTIC_FRACTION;
                }
            }
        }
        Duration::ZERO
    }

    /// Merges a revalidation answer with the stored response.
    ///
    /// A 304 keeps the stored status and body; every end-to-end header
    /// present in the answer replaces the matching stored fields, while
    /// hop-by-hop headers are never copied and the stored
    /// `Content-Length` is preserved. Anything other than a 304 replaces
    /// the entry outright.
    #[must_use]
    pub fn handle_validation_response(
        &self,
        old: Response,
        new: Response,
    ) -> Response {
        if new.status != 304 {
            return new;
        }
        let mut headers = old.headers.clone();
        for name in new.headers.names() {
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case(b"content-length")
            {
                continue;
            }
            let name = name.clone();
            let replacements: Vec<_> = new
                .headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case(&name))
                .map(|(_, v)| v.clone())
                .collect();
            headers.remove_all(&name);
            for value in replacements {
                headers.append(name.clone(), value);
            }
        }
        Response {
            status: old.status,
            headers,
            body: old.body,
            extensions: old.extensions,
        }
    }

    /// Whether an origin response may be admitted for this request.
    #[must_use]
    pub fn is_cachable(&self, request: &Request, response: &Response) -> bool {
        let method_allowed = self
            .cacheable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&request.method));
        if !method_allowed {
            return false;
        }
        if matches!(Vary::from_headers(&response.headers), Vary::Any) {
            return false;
        }
        if self.force_cache {
            return true;
        }
        if !self.cacheable_status_codes.contains(&response.status) {
            return false;
        }
        let request_cc = CacheControl::from_headers(&request.headers);
        let response_cc = CacheControl::from_headers(&response.headers);
        if request_cc.no_store || response_cc.no_store {
            return false;
        }
        if self.shared && response_cc.private {
            return false;
        }
        let explicit_freshness = (self.shared
            && response_cc.s_maxage.is_some())
            || response_cc.max_age.is_some()
            || response.headers.contains("expires");
        let has_validator = response.headers.contains("etag")
            || response.headers.contains("last-modified");
        explicit_freshness
            || has_validator
            || self.allow_heuristics
            || PERMANENT_REDIRECTS.contains(&response.status)
    }

    /// Whether a stored response may be served after a failed attempt to
    /// reach the origin.
    #[must_use]
    pub fn allowed_stale(&self, stored_response: &Response) -> bool {
        let cc = CacheControl::from_headers(&stored_response.headers);
        if cc.must_revalidate {
            return false;
        }
        if self.shared && cc.proxy_revalidate {
            return false;
        }
        cc.stale_if_error.is_some_and(|budget| budget > 0) || self.allow_stale
    }
}
