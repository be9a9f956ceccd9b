//! Header containers and parsers for the cache-relevant header fields.
//!
//! Headers are kept as an ordered sequence of `(name, value)` byte pairs
//! rather than a map: order and duplicates are observable (`Set-Cookie`,
//! `Vary`) and must survive a serializer round-trip byte for byte.

use std::time::SystemTime;

use bytes::Bytes;

/// An ordered list of HTTP header fields.
///
/// Names compare case-insensitively; insertion order and duplicate fields
/// are preserved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(Bytes, Bytes)>);

impl Headers {
    /// Creates an empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a field at the end of the list.
    pub fn append(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.0.push((name.into(), value.into()));
    }

    /// Removes every field with the given name, then appends one field
    /// carrying `value`.
    pub fn replace(
        &mut self,
        name: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) {
        let name = name.into();
        self.remove_all(&name);
        self.0.push((name, value.into()));
    }

    /// Removes every field with the given name.
    pub fn remove_all(&mut self, name: &[u8]) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// The value of the first field with the given name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v)
    }

    /// The first value with the given name, as UTF-8.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Every value with the given name, in order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&Bytes> {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v)
            .collect()
    }

    /// Whether a field with the given name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The distinct field names, in first-occurrence order.
    #[must_use]
    pub fn names(&self) -> Vec<&Bytes> {
        let mut names: Vec<&Bytes> = Vec::new();
        for (n, _) in &self.0 {
            if !names.iter().any(|seen| seen.eq_ignore_ascii_case(n)) {
                names.push(n);
            }
        }
        names
    }

    /// Iterates over the fields in order.
    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Bytes)> {
        self.0.iter()
    }

    /// The number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Bytes, Bytes)> for Headers {
    fn from_iter<I: IntoIterator<Item = (Bytes, Bytes)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a (Bytes, Bytes);
    type IntoIter = std::slice::Iter<'a, (Bytes, Bytes)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The `max-stale` request directive: bare means any staleness is
/// acceptable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxStale {
    /// `max-stale` without an argument.
    Unbounded,
    /// `max-stale=N`.
    Limit(u64),
}

/// Parsed `Cache-Control` directives.
///
/// Duplicate headers are coalesced in order; directive names match
/// case-insensitively; unknown directives are preserved but otherwise
/// ignored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheControl {
    /// `no-store`.
    pub no_store: bool,
    /// `no-cache`.
    pub no_cache: bool,
    /// `private`.
    pub private: bool,
    /// `public`.
    pub public: bool,
    /// `must-revalidate`.
    pub must_revalidate: bool,
    /// `proxy-revalidate`.
    pub proxy_revalidate: bool,
    /// `immutable`.
    pub immutable: bool,
    /// `only-if-cached`.
    pub only_if_cached: bool,
    /// `max-age=N`.
    pub max_age: Option<u64>,
    /// `s-maxage=N`.
    pub s_maxage: Option<u64>,
    /// `min-fresh=N`.
    pub min_fresh: Option<u64>,
    /// `max-stale` or `max-stale=N`.
    pub max_stale: Option<MaxStale>,
    /// `stale-while-revalidate=N`.
    pub stale_while_revalidate: Option<u64>,
    /// `stale-if-error=N`.
    pub stale_if_error: Option<u64>,
    /// Directives this cache does not act on, in parse order.
    pub unknown: Vec<(String, Option<String>)>,
}

impl CacheControl {
    /// Parses every `Cache-Control` field in `headers`.
    #[must_use]
    pub fn from_headers(headers: &Headers) -> Self {
        let mut cc = Self::default();
        for value in headers.get_all("cache-control") {
            let Ok(value) = std::str::from_utf8(value) else {
                continue;
            };
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let mut kv = part.splitn(2, '=');
                let name = kv.next().unwrap_or_default().trim();
                let arg = kv.next().map(|v| v.trim().trim_matches('"'));
                cc.apply(name, arg);
            }
        }
        cc
    }

    fn apply(&mut self, name: &str, arg: Option<&str>) {
        let secs = |arg: Option<&str>| arg.and_then(|v| v.parse::<u64>().ok());
        match name.to_ascii_lowercase().as_str() {
            "no-store" => self.no_store = true,
            "no-cache" => self.no_cache = true,
            "private" => self.private = true,
            "public" => self.public = true,
            "must-revalidate" => self.must_revalidate = true,
            "proxy-revalidate" => self.proxy_revalidate = true,
            "immutable" => self.immutable = true,
            "only-if-cached" => self.only_if_cached = true,
            "max-age" => self.max_age = secs(arg),
            "s-maxage" => self.s_maxage = secs(arg),
            "min-fresh" => self.min_fresh = secs(arg),
            "max-stale" => {
                self.max_stale = Some(match secs(arg) {
                    Some(limit) => MaxStale::Limit(limit),
                    None => MaxStale::Unbounded,
                });
            }
            "stale-while-revalidate" => {
                self.stale_while_revalidate = secs(arg);
            }
            "stale-if-error" => self.stale_if_error = secs(arg),
            other => {
                self.unknown
                    .push((other.to_string(), arg.map(str::to_string)));
            }
        }
    }
}

/// The parsed `Vary` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Vary {
    /// `Vary: *`: the stored response is never reusable.
    Any,
    /// An ordered list of lowercased header names to match on.
    Fields(Vec<String>),
}

impl Vary {
    /// Parses every `Vary` field in `headers`, coalescing in order.
    #[must_use]
    pub fn from_headers(headers: &Headers) -> Self {
        let mut fields = Vec::new();
        for value in headers.get_all("vary") {
            let Ok(value) = std::str::from_utf8(value) else {
                continue;
            };
            for name in value.split(',') {
                let name = name.trim();
                if name == "*" {
                    return Vary::Any;
                }
                if !name.is_empty() {
                    fields.push(name.to_ascii_lowercase());
                }
            }
        }
        Vary::Fields(fields)
    }
}

/// Parses an IMF-fixdate header value.
#[must_use]
pub fn parse_http_date(value: &[u8]) -> Option<SystemTime> {
    let value = std::str::from_utf8(value).ok()?;
    httpdate::parse_http_date(value.trim()).ok()
}

/// Formats a timestamp as an IMF-fixdate header value.
#[must_use]
pub fn fmt_http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

// rfc9110 7.6.1
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header is hop-by-hop and must never be copied from a
/// validation response into a stored one.
#[must_use]
pub fn is_hop_by_hop(name: &[u8]) -> bool {
    if name.len() >= 6 && name[..6].eq_ignore_ascii_case(b"proxy-") {
        return true;
    }
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(fields: &[(&str, &str)]) -> Headers {
        fields
            .iter()
            .map(|(n, v)| {
                (Bytes::from(n.to_string()), Bytes::from(v.to_string()))
            })
            .collect()
    }

    #[test]
    fn preserves_order_and_duplicates() {
        let hdrs = headers(&[
            ("Set-Cookie", "a=1"),
            ("Content-Type", "text/plain"),
            ("Set-Cookie", "b=2"),
        ]);
        assert_eq!(hdrs.get("set-cookie").unwrap().as_ref(), b"a=1");
        let all = hdrs.get_all("SET-COOKIE");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].as_ref(), b"b=2");
        assert_eq!(hdrs.names().len(), 2);
    }

    #[test]
    fn replace_collapses_duplicates() {
        let mut hdrs = headers(&[("X-Test", "1"), ("x-test", "2")]);
        hdrs.replace("x-test", "3");
        assert_eq!(hdrs.get_all("x-test").len(), 1);
        assert_eq!(hdrs.get("X-Test").unwrap().as_ref(), b"3");
    }

    #[test]
    fn parses_boolean_and_integer_directives() {
        let hdrs = headers(&[(
            "Cache-Control",
            "no-cache, max-age=3600, s-maxage=7200, must-revalidate",
        )]);
        let cc = CacheControl::from_headers(&hdrs);
        assert!(cc.no_cache);
        assert!(cc.must_revalidate);
        assert_eq!(cc.max_age, Some(3600));
        assert_eq!(cc.s_maxage, Some(7200));
        assert!(!cc.no_store);
    }

    #[test]
    fn coalesces_duplicate_cache_control_headers() {
        let hdrs = headers(&[
            ("Cache-Control", "max-age=60"),
            ("cache-control", "no-store"),
        ]);
        let cc = CacheControl::from_headers(&hdrs);
        assert_eq!(cc.max_age, Some(60));
        assert!(cc.no_store);
    }

    #[test]
    fn unknown_directives_are_preserved() {
        let hdrs =
            headers(&[("Cache-Control", "max-age=1, x-extension=\"v\"")]);
        let cc = CacheControl::from_headers(&hdrs);
        assert_eq!(
            cc.unknown,
            vec![("x-extension".to_string(), Some("v".to_string()))]
        );
    }

    #[test]
    fn bare_and_bounded_max_stale() {
        let bare = CacheControl::from_headers(&headers(&[(
            "Cache-Control",
            "max-stale",
        )]));
        assert_eq!(bare.max_stale, Some(MaxStale::Unbounded));
        let bounded = CacheControl::from_headers(&headers(&[(
            "Cache-Control",
            "max-stale=30",
        )]));
        assert_eq!(bounded.max_stale, Some(MaxStale::Limit(30)));
    }

    #[test]
    fn vary_asterisk_wins() {
        let hdrs =
            headers(&[("Vary", "accept"), ("Vary", "*"), ("Vary", "origin")]);
        assert_eq!(Vary::from_headers(&hdrs), Vary::Any);
    }

    #[test]
    fn vary_fields_are_lowercased_in_order() {
        let hdrs = headers(&[("Vary", "Accept, Accept-Encoding")]);
        assert_eq!(
            Vary::from_headers(&hdrs),
            Vary::Fields(vec![
                "accept".to_string(),
                "accept-encoding".to_string()
            ])
        );
    }

    #[test]
    fn parses_imf_fixdate() {
        let parsed =
            parse_http_date(b"Mon, 25 Aug 2015 12:00:00 GMT").unwrap();
        let secs = parsed
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1_440_504_000);
        assert_eq!(fmt_http_date(parsed), "Mon, 25 Aug 2015 12:00:00 GMT");
    }

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop(b"Connection"));
        assert!(is_hop_by_hop(b"Proxy-Authorization"));
        assert!(is_hop_by_hop(b"transfer-encoding"));
        assert!(!is_hop_by_hop(b"Content-Type"));
        assert!(!is_hop_by_hop(b"Date"));
    }
}
