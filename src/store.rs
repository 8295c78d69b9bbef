use std::{
    mem::size_of,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};

use ahash::RandomState;
use bytes::Bytes;
use http::{
    HeaderMap, Method, StatusCode, Uri,
    header::{CONTENT_LENGTH, DATE, ETAG, EXPIRES, HeaderValue, LAST_MODIFIED},
};
use moka::sync::{Cache as MokaCache, CacheBuilder as MokaCacheBuilder};
use tokio::sync::Mutex;

use crate::{
    Error,
    directives::{self, CacheControl, Vary},
    headers::{calc_headers_size, extract_authority, extract_host, extract_port,
        strip_hop_by_hop_headers},
};

/// Cache key: method plus normalized effective URI.
/// HEAD shares the GET key space so that a stored GET can answer a later HEAD.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PrimaryKey {
    method: Method,
    uri: String,
}

impl PrimaryKey {
    pub fn new(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let method = if *method == Method::HEAD {
            Method::GET
        } else {
            method.clone()
        };

        Self {
            method,
            uri: effective_uri(uri, headers),
        }
    }

    /// GET key for a given target, used for invalidation
    pub fn for_uri(uri: &Uri, headers: &HeaderMap) -> Self {
        Self::new(&Method::GET, uri, headers)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Normalizes a request target: scheme and host lowercased, the default
/// port elided, path and query preserved verbatim. Origin-form targets
/// take their authority from the Host header.
pub fn effective_uri(uri: &Uri, headers: &HeaderMap) -> String {
    let scheme = uri
        .scheme_str()
        .unwrap_or("http")
        .to_ascii_lowercase();

    let authority = extract_authority(uri, headers).unwrap_or_default();
    let host = extract_host(authority).unwrap_or_default().to_ascii_lowercase();
    let default_port = if scheme == "https" { 443 } else { 80 };
    let port = extract_port(authority).filter(|p| *p != default_port);

    let paq = uri.path_and_query().map_or("/", |v| v.as_str());

    match port {
        Some(p) => format!("{scheme}://{host}:{p}{paq}"),
        None => format!("{scheme}://{host}{paq}"),
    }
}

/// One stored representation under a primary key, distinguished by the
/// values the request carried for the response's Vary fields.
#[derive(Debug, Clone)]
pub struct Variant {
    vary: Vary,
    signature: Vec<Option<String>>,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    request_time: SystemTime,
    response_time: SystemTime,
    corrected_initial_age: Duration,
}

impl Variant {
    /// Builds a variant from an upstream response: headers are
    /// canonicalized (hop-by-hop stripped, Date synthesized,
    /// Content-Length pinned to the body) and the corrected initial age
    /// is frozen per RFC 7234 §4.2.3.
    pub fn new(
        req_headers: &HeaderMap,
        status: StatusCode,
        mut headers: HeaderMap,
        body: Bytes,
        request_time: SystemTime,
        response_time: SystemTime,
    ) -> Self {
        strip_hop_by_hop_headers(&mut headers);

        if !headers.contains_key(DATE) {
            headers.insert(DATE, date_value(response_time));
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        let vary = directives::response_vary(&headers);
        let signature = signature(&vary, req_headers);
        let corrected_initial_age =
            corrected_initial_age(&headers, request_time, response_time);

        Self {
            vary,
            signature,
            status,
            headers,
            body,
            request_time,
            response_time,
            corrected_initial_age,
        }
    }

    /// Whether this variant's stored signature matches the inbound request.
    /// `Vary: *` matches nothing.
    pub fn matches(&self, req_headers: &HeaderMap) -> bool {
        match &self.vary {
            Vary::Any => false,
            Vary::Fields(_) => signature(&self.vary, req_headers) == self.signature,
        }
    }

    /// Age the variant has accrued by `now`
    pub fn current_age(&self, now: SystemTime) -> Duration {
        let resident = now.duration_since(self.response_time).unwrap_or_default();
        self.corrected_initial_age + resident
    }

    pub const fn status(&self) -> StatusCode {
        self.status
    }

    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    pub const fn response_time(&self) -> SystemTime {
        self.response_time
    }

    pub const fn corrected_initial_age(&self) -> Duration {
        self.corrected_initial_age
    }

    pub fn cache_control(&self) -> CacheControl {
        directives::response_cache_control(&self.headers)
    }

    pub fn etag(&self) -> Option<&HeaderValue> {
        self.headers.get(ETAG)
    }

    pub fn date(&self) -> Option<SystemTime> {
        directives::parse_date(&self.headers, &DATE)
    }

    pub fn expires(&self) -> Option<SystemTime> {
        directives::parse_date(&self.headers, &EXPIRES)
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        directives::parse_date(&self.headers, &LAST_MODIFIED)
    }

    /// Applies a 304 revalidation: end-to-end headers from the 304 replace
    /// the stored ones, times move forward and the corrected initial age
    /// is recomputed from the fresh Date and Age.
    fn freshened(
        &self,
        not_modified: &HeaderMap,
        request_time: SystemTime,
        response_time: SystemTime,
    ) -> Self {
        let mut merged = not_modified.clone();
        strip_hop_by_hop_headers(&mut merged);

        let mut headers = self.headers.clone();
        for name in merged.keys() {
            headers.remove(name);
        }
        for (name, value) in &merged {
            headers.append(name.clone(), value.clone());
        }

        // The stored body stays, so its length does too
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        if !headers.contains_key(DATE) {
            headers.insert(DATE, date_value(response_time));
        }

        let corrected_initial_age =
            corrected_initial_age(&headers, request_time, response_time);

        Self {
            headers,
            request_time,
            response_time,
            corrected_initial_age,
            ..self.clone()
        }
    }

    fn size(&self) -> usize {
        calc_headers_size(&self.headers) + self.body.len()
    }
}

fn date_value(t: SystemTime) -> HeaderValue {
    HeaderValue::from_str(&httpdate::fmt_http_date(t))
        .unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// RFC 7234 §4.2.3: the age a response already had when it got here.
/// `max(apparent_age, Age) + response_delay`.
fn corrected_initial_age(
    headers: &HeaderMap,
    request_time: SystemTime,
    response_time: SystemTime,
) -> Duration {
    let apparent = directives::parse_date(headers, &DATE)
        .and_then(|date| response_time.duration_since(date).ok())
        .unwrap_or_default();

    let age = directives::parse_age(headers).unwrap_or_default();
    let delay = response_time.duration_since(request_time).unwrap_or_default();

    apparent.max(age) + delay
}

/// Values of the request headers named by Vary, in Vary order.
/// Multi-valued fields are comma-joined, absent ones recorded as such.
fn signature(vary: &Vary, req_headers: &HeaderMap) -> Vec<Option<String>> {
    let Vary::Fields(fields) = vary else {
        return Vec::new();
    };

    fields
        .iter()
        .map(|f| {
            let values: Vec<_> = req_headers
                .get_all(f)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();

            if values.is_empty() {
                None
            } else {
                Some(values.join(", "))
            }
        })
        .collect()
}

/// Everything stored under one primary key
#[derive(Debug)]
pub struct Resource {
    created: SystemTime,
    variants: RwLock<Vec<Arc<Variant>>>,
}

impl Resource {
    fn new(created: SystemTime) -> Self {
        Self {
            created,
            variants: RwLock::new(Vec::new()),
        }
    }

    pub const fn created(&self) -> SystemTime {
        self.created
    }

    /// First variant whose signature matches the request
    pub fn select_variant(&self, req_headers: &HeaderMap) -> Option<Arc<Variant>> {
        self.variants
            .read()
            .unwrap()
            .iter()
            .find(|v| v.matches(req_headers))
            .cloned()
    }

    pub fn variant_count(&self) -> usize {
        self.variants.read().unwrap().len()
    }

    fn size(&self) -> usize {
        self.variants
            .read()
            .unwrap()
            .iter()
            .map(|v| v.size() + size_of::<Arc<Variant>>())
            .sum()
    }
}

fn weigh_resource(k: &PrimaryKey, v: &Arc<Resource>) -> u32 {
    (k.uri.len() + size_of::<PrimaryKey>() + v.size()) as u32
}

/// Mapping from primary key to resource, plus the per-key write locks
/// that collapse concurrent misses onto a single upstream fetch.
pub struct Store {
    resources: MokaCache<PrimaryKey, Arc<Resource>, RandomState>,
    locks: MokaCache<PrimaryKey, Arc<Mutex<()>>, RandomState>,
}

impl Store {
    /// Unbounded unless a total size capacity is given
    pub fn new(capacity: Option<u64>) -> Self {
        let mut builder = MokaCache::builder().weigher(weigh_resource);
        if let Some(v) = capacity {
            builder = builder.max_capacity(v);
        }

        Self {
            resources: builder.build_with_hasher(RandomState::default()),

            // The params of the lock cache are somewhat arbitrary
            locks: MokaCacheBuilder::new(32768)
                .time_to_idle(Duration::from_secs(60))
                .build_with_hasher(RandomState::default()),
        }
    }

    pub fn get(&self, key: &PrimaryKey) -> Option<Arc<Resource>> {
        self.resources.get(key)
    }

    pub fn select_variant(
        &self,
        key: &PrimaryKey,
        req_headers: &HeaderMap,
    ) -> Option<Arc<Variant>> {
        self.get(key).and_then(|r| r.select_variant(req_headers))
    }

    /// Upserts a variant under the key: same Vary and same signature
    /// replaces the stored one, anything else joins the variant list.
    pub fn store(
        &self,
        key: &PrimaryKey,
        variant: Variant,
        now: SystemTime,
    ) -> Result<Arc<Variant>, Error> {
        let resource = self
            .resources
            .get_with_by_ref(key, || Arc::new(Resource::new(now)));

        let variant = Arc::new(variant);
        let mut variants = resource.variants.write().unwrap();

        let slots: Vec<_> = variants
            .iter()
            .enumerate()
            .filter(|(_, v)| v.vary == variant.vary && v.signature == variant.signature)
            .map(|(i, _)| i)
            .collect();

        match slots.as_slice() {
            [] => variants.push(variant.clone()),
            [i] => variants[*i] = variant.clone(),
            // Can't happen while writes hold the per-key lock
            _ => return Err(Error::StoreConflict),
        }

        Ok(variant)
    }

    pub fn invalidate(&self, key: &PrimaryKey) {
        self.resources.invalidate(key);
    }

    /// Atomically swaps a variant for its 304-refreshed copy
    pub fn freshen(
        &self,
        key: &PrimaryKey,
        stale: &Arc<Variant>,
        not_modified: &HeaderMap,
        request_time: SystemTime,
        response_time: SystemTime,
    ) -> Arc<Variant> {
        let fresh = Arc::new(stale.freshened(not_modified, request_time, response_time));

        if let Some(resource) = self.resources.get(key) {
            let mut variants = resource.variants.write().unwrap();
            if let Some(slot) = variants.iter_mut().find(|v| Arc::ptr_eq(v, stale)) {
                *slot = fresh.clone();
            }
        }

        fresh
    }

    /// Per-key coalescing lock: one writer per key, waiting requests
    /// reuse whatever the writer stored
    pub fn lock(&self, key: &PrimaryKey) -> Arc<Mutex<()>> {
        self.locks
            .get_with_by_ref(key, || Arc::new(Mutex::new(())))
    }

    pub fn run_pending_tasks(&self) {
        self.resources.run_pending_tasks();
        self.locks.run_pending_tasks();
    }

    pub fn entry_count(&self) -> u64 {
        self.resources.entry_count()
    }

    pub fn weighted_size(&self) -> u64 {
        self.resources.weighted_size()
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.resources.invalidate_all();
        self.locks.invalidate_all();
        self.run_pending_tasks();
    }
}

#[cfg(test)]
mod test {
    use http::header::ACCEPT_ENCODING;

    use crate::hval;

    use super::*;

    const T0: SystemTime = SystemTime::UNIX_EPOCH;

    fn get_key(uri: &str) -> PrimaryKey {
        PrimaryKey::new(
            &Method::GET,
            &uri.parse().unwrap(),
            &HeaderMap::new(),
        )
    }

    fn response_headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (name, value) in pairs {
            h.append(
                http::header::HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        h
    }

    #[test]
    fn test_primary_key_normalization() {
        // Host case and default port don't matter
        assert_eq!(get_key("http://EXAMPLE.org:80/test"), get_key("http://example.org/test"));
        assert_eq!(get_key("https://example.org:443/test"), get_key("https://example.org/test"));

        // Non-default port, path case and query do
        assert_ne!(get_key("http://example.org:8080/test"), get_key("http://example.org/test"));
        assert_ne!(get_key("http://example.org/TEST"), get_key("http://example.org/test"));
        assert_ne!(get_key("http://example.org/test?a=1"), get_key("http://example.org/test?a=2"));

        // HEAD maps onto the GET key space
        let head = PrimaryKey::new(
            &Method::HEAD,
            &"http://example.org/test".parse().unwrap(),
            &HeaderMap::new(),
        );
        assert_eq!(head, get_key("http://example.org/test"));

        // Origin-form targets take the Host header
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, hval!("Example.org"));
        let origin_form =
            PrimaryKey::new(&Method::GET, &"/test".parse().unwrap(), &headers);
        assert_eq!(origin_form, get_key("http://example.org/test"));
    }

    #[test]
    fn test_variant_canonicalization() {
        let headers = response_headers(&[
            ("connection", "close"),
            ("transfer-encoding", "chunked"),
            ("content-type", "text/plain"),
        ]);
        let v = Variant::new(
            &HeaderMap::new(),
            StatusCode::OK,
            headers,
            Bytes::from_static(b"hello"),
            T0,
            T0 + Duration::from_secs(1),
        );

        // Hop-by-hop gone, Date synthesized, Content-Length pinned
        assert!(v.headers().get("connection").is_none());
        assert!(v.headers().get("transfer-encoding").is_none());
        assert!(v.headers().get(DATE).is_some());
        assert_eq!(v.headers().get(CONTENT_LENGTH), Some(&HeaderValue::from(5)));
    }

    #[test]
    fn test_corrected_initial_age() {
        // Response took 2s; origin's Date is 10s behind our response time
        // and it claims Age 4
        let headers = response_headers(&[
            ("date", "Thu, 01 Jan 1970 00:00:00 GMT"),
            ("age", "4"),
        ]);
        let v = Variant::new(
            &HeaderMap::new(),
            StatusCode::OK,
            headers,
            Bytes::new(),
            T0 + Duration::from_secs(8),
            T0 + Duration::from_secs(10),
        );

        // apparent 10 > age 4, plus 2s delay
        assert_eq!(v.corrected_initial_age(), Duration::from_secs(12));
        assert_eq!(
            v.current_age(T0 + Duration::from_secs(15)),
            Duration::from_secs(17)
        );
    }

    #[test]
    fn test_vary_signatures() {
        let mut req = HeaderMap::new();
        req.insert(ACCEPT_ENCODING, hval!("gzip"));

        let v = Variant::new(
            &req,
            StatusCode::OK,
            response_headers(&[("vary", "Accept-Encoding")]),
            Bytes::new(),
            T0,
            T0,
        );

        assert!(v.matches(&req));

        let mut other = HeaderMap::new();
        other.insert(ACCEPT_ENCODING, hval!("br"));
        assert!(!v.matches(&other));

        // Absent header is its own signature value
        assert!(!v.matches(&HeaderMap::new()));

        // Vary: * stores but never matches
        let v = Variant::new(
            &req,
            StatusCode::OK,
            response_headers(&[("vary", "*")]),
            Bytes::new(),
            T0,
            T0,
        );
        assert!(!v.matches(&req));
    }

    #[test]
    fn test_store_upsert() {
        let store = Store::new(None);
        let key = get_key("http://example.org/test");

        let mut req_gzip = HeaderMap::new();
        req_gzip.insert(ACCEPT_ENCODING, hval!("gzip"));
        let mut req_br = HeaderMap::new();
        req_br.insert(ACCEPT_ENCODING, hval!("br"));

        let make = |req: &HeaderMap, body: &'static [u8]| {
            Variant::new(
                req,
                StatusCode::OK,
                response_headers(&[("vary", "Accept-Encoding")]),
                Bytes::from_static(body),
                T0,
                T0,
            )
        };

        store.store(&key, make(&req_gzip, b"gzip body"), T0).unwrap();
        store.store(&key, make(&req_br, b"br body"), T0).unwrap();
        assert_eq!(store.get(&key).unwrap().variant_count(), 2);

        // Same vary + signature replaces
        store.store(&key, make(&req_gzip, b"gzip body v2"), T0).unwrap();
        let resource = store.get(&key).unwrap();
        assert_eq!(resource.variant_count(), 2);
        assert_eq!(
            resource.select_variant(&req_gzip).unwrap().body().as_ref(),
            b"gzip body v2"
        );
        assert_eq!(
            resource.select_variant(&req_br).unwrap().body().as_ref(),
            b"br body"
        );

        store.invalidate(&key);
        store.run_pending_tasks();
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_freshen() {
        let store = Store::new(None);
        let key = get_key("http://example.org/test");

        let variant = Variant::new(
            &HeaderMap::new(),
            StatusCode::OK,
            response_headers(&[
                ("date", "Thu, 01 Jan 1970 00:00:00 GMT"),
                ("cache-control", "max-age=10"),
                ("etag", "v1"),
            ]),
            Bytes::from_static(b"payload"),
            T0,
            T0,
        );
        let variant = store.store(&key, variant, T0).unwrap();

        let t1 = T0 + Duration::from_secs(60);
        let not_modified = response_headers(&[
            ("date", "Thu, 01 Jan 1970 00:01:00 GMT"),
            ("cache-control", "max-age=30"),
        ]);
        let fresh = store.freshen(&key, &variant, &not_modified, t1, t1);

        // Body and ETag survive, refreshed headers replace, age restarts
        assert_eq!(fresh.body().as_ref(), b"payload");
        assert_eq!(fresh.etag(), Some(&hval!("v1")));
        assert_eq!(
            fresh.cache_control().max_age,
            Some(Duration::from_secs(30))
        );
        assert_eq!(fresh.corrected_initial_age(), Duration::ZERO);
        assert_eq!(fresh.response_time(), t1);

        // The swap is visible through the resource
        let selected = store.select_variant(&key, &HeaderMap::new()).unwrap();
        assert!(Arc::ptr_eq(&selected, &fresh));
    }
}
