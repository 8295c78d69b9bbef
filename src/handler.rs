use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use async_trait::async_trait;
use axum::body::Body;
use http::{
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri,
    header::{
        AGE, AUTHORIZATION, CACHE_CONTROL, CONTENT_LOCATION, DATE, ETAG, EXPIRES,
        IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION, WARNING,
    },
    request::Parts,
};
use http_body::Body as _;
use prometheus::{
    CounterVec, HistogramVec, IntGauge, Registry, register_counter_vec_with_registry,
    register_histogram_vec_with_registry, register_int_gauge_with_registry,
};
use strum_macros::{Display, IntoStaticStr};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::{
    Error,
    body::buffer_body,
    clock::{Clock, SystemClock},
    directives::{self, CacheControl},
    freshness::{self, Freshness, FreshnessInfo, HEURISTIC_LIFETIME_CAP,
        status_heuristically_cacheable},
    headers::{
        WARN_110_RESPONSE_IS_STALE, WARN_111_REVALIDATION_FAILED, WARN_113_HEURISTIC_EXPIRATION,
        X_CACHE, strip_hop_by_hop_headers,
    },
    store::{PrimaryKey, Store, Variant},
    tasks::Run,
    upstream::{Upstream, UpstreamResponse},
};

/// Whether this cache serves one user or many.
/// Shared mode honors `s-maxage` and refuses `private` responses.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Default, clap::ValueEnum)]
#[strum(serialize_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Private,
    Shared,
}

/// Cache outcome, exposed both as the `x-cache` header and as a
/// response extension for downstream middleware
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Skip,
}

impl CacheStatus {
    fn with_response(self, mut resp: Response<Body>) -> Response<Body> {
        resp.headers_mut()
            .insert(X_CACHE, HeaderValue::from_static(self.into()));
        resp.extensions_mut().insert(self);
        resp
    }
}

#[derive(Clone)]
struct Metrics {
    requests_count: CounterVec,
    requests_duration: HistogramVec,
    lock_await: HistogramVec,
    entries: IntGauge,
    memory: IntGauge,
}

impl Metrics {
    fn new(registry: &Registry) -> Self {
        let lbls = &["cache_status"];

        Self {
            requests_count: register_counter_vec_with_registry!(
                "cache_requests_count",
                "Cache requests count",
                lbls,
                registry,
            )
            .unwrap(),

            requests_duration: register_histogram_vec_with_registry!(
                "cache_requests_duration",
                "Time it took to execute the request",
                lbls,
                registry,
            )
            .unwrap(),

            lock_await: register_histogram_vec_with_registry!(
                "cache_lock_await",
                "Time spent waiting for the per-key write lock",
                &["lock_obtained"],
                registry,
            )
            .unwrap(),

            entries: register_int_gauge_with_registry!(
                "cache_entries",
                "Count of resources in the cache",
                registry,
            )
            .unwrap(),

            memory: register_int_gauge_with_registry!(
                "cache_memory",
                "Memory usage by the cache in bytes",
                registry,
            )
            .unwrap(),
        }
    }
}

pub struct Opts {
    pub mode: CacheMode,
    pub cache_size: Option<u64>,
    pub max_item_size: usize,
    pub lock_timeout: Duration,
    pub body_timeout: Duration,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            mode: CacheMode::Private,
            cache_size: None,
            max_item_size: 16 * 1024 * 1024,
            lock_timeout: Duration::from_secs(5),
            body_timeout: Duration::from_secs(60),
        }
    }
}

/// Builds a handler using some overridable defaults
pub struct CacheHandlerBuilder {
    upstream: Arc<dyn Upstream>,
    clock: Arc<dyn Clock>,
    opts: Opts,
    registry: Registry,
}

impl CacheHandlerBuilder {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            upstream,
            clock: Arc::new(SystemClock),
            opts: Opts::default(),
            registry: Registry::new(),
        }
    }

    /// Sets the time source. Defaults to the system clock.
    pub fn clock(mut self, v: Arc<dyn Clock>) -> Self {
        self.clock = v;
        self
    }

    /// Sets private/shared operation. Defaults to private.
    pub const fn mode(mut self, v: CacheMode) -> Self {
        self.opts.mode = v;
        self
    }

    /// Caps the total stored size. Unbounded by default.
    pub const fn cache_size(mut self, v: u64) -> Self {
        self.opts.cache_size = Some(v);
        self
    }

    /// Sets the maximum storable entry size. Default 16MB.
    pub const fn max_item_size(mut self, v: usize) -> Self {
        self.opts.max_item_size = v;
        self
    }

    /// Sets the per-key write lock timeout. Default 5 sec.
    pub const fn lock_timeout(mut self, v: Duration) -> Self {
        self.opts.lock_timeout = v;
        self
    }

    /// Sets the body reading timeout. Default 1 min.
    pub const fn body_timeout(mut self, v: Duration) -> Self {
        self.opts.body_timeout = v;
        self
    }

    /// Sets the metrics registry to use
    pub fn registry(mut self, v: &Registry) -> Self {
        self.registry = v.clone();
        self
    }

    pub fn opts(mut self, v: Opts) -> Self {
        self.opts = v;
        self
    }

    pub fn build(self) -> Result<CacheHandler, Error> {
        if self
            .opts
            .cache_size
            .is_some_and(|v| self.opts.max_item_size as u64 >= v)
        {
            return Err(anyhow!("cache item size should be less than whole cache size").into());
        }

        Ok(CacheHandler {
            store: Store::new(self.opts.cache_size),
            upstream: self.upstream,
            clock: self.clock,
            metrics: Metrics::new(&self.registry),
            dump: std::env::var("DUMP_REQUESTS").is_ok_and(|v| !v.is_empty()),
            opts: self.opts,
        })
    }
}

/// The orchestrator: decides lookup vs bypass per inbound request,
/// selects a variant, serves fresh entries, revalidates or fetches
/// stale/missing ones, stores what is storable and annotates every
/// response with `Age`, `Warning` and `x-cache`.
pub struct CacheHandler {
    store: Store,
    upstream: Arc<dyn Upstream>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    opts: Opts,
    dump: bool,
}

impl CacheHandler {
    pub fn builder(upstream: Arc<dyn Upstream>) -> CacheHandlerBuilder {
        CacheHandlerBuilder::new(upstream)
    }

    /// Handles one inbound request end to end. Errors surface as plain
    /// HTTP error responses, annotated like everything else.
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        if self.dump {
            info!(
                "request ----> {} {} {:?}",
                request.method(),
                request.uri(),
                request.headers()
            );
        }

        let (status, response) = match self.process(request).await {
            Ok(v) => v,
            Err(e) => {
                warn!("request failed: {e:#}");
                let response = Response::builder()
                    .status(e.status_code())
                    .body(Body::from(e.to_string()))
                    .unwrap_or_default();
                (CacheStatus::Miss, response)
            }
        };

        let lbls = &[<&'static str>::from(status)];
        self.metrics.requests_count.with_label_values(lbls).inc();
        self.metrics
            .requests_duration
            .with_label_values(lbls)
            .observe(started.elapsed().as_secs_f64());

        let response = status.with_response(response);
        if self.dump {
            info!(
                "response <---- {} {:?}",
                response.status(),
                response.headers()
            );
        }

        response
    }

    async fn process(&self, request: Request<Body>) -> Result<(CacheStatus, Response<Body>), Error> {
        // Only GET/HEAD go through the cache
        if !matches!(*request.method(), Method::GET | Method::HEAD) {
            return self.pass_through(request).await;
        }

        // GET/HEAD bodies carry no meaning, drop them
        let (mut parts, _) = request.into_parts();
        strip_hop_by_hop_headers(&mut parts.headers);

        let req_cc = directives::request_cache_control(&parts.headers);
        let key = PrimaryKey::new(&parts.method, &parts.uri, &parts.headers);

        // no-store requests skip the cache entirely
        if req_cc.no_store {
            let fetched = sanitize(self.upstream.round_trip(clone_request(&parts)).await?);
            return Ok((CacheStatus::Skip, fetched.response));
        }

        // Serve from storage when the freshness rules allow it and the
        // client didn't force an end-to-end reload
        if !req_cc.no_cache {
            if let Some(v) = self.store.select_variant(&key, &parts.headers) {
                let info = freshness::evaluate(&v, self.clock.now(), &req_cc, self.opts.mode);
                if info.servable_without_revalidation() {
                    return Ok((CacheStatus::Hit, self.serve_variant(&v, &info, &parts)));
                }
            }
        }

        if req_cc.only_if_cached {
            return Err(Error::OnlyIfCachedMiss);
        }

        // Upstream is needed. Writers are serialized per key so that
        // concurrent misses collapse onto a single fetch; a waiter that
        // can't get the lock in time proceeds on its own.
        let lock = self.store.lock(&key);
        let lock_started = Instant::now();
        let guard = select! {
            v = lock.lock() => Some(v),
            () = sleep(self.opts.lock_timeout) => None,
        };
        self.metrics
            .lock_await
            .with_label_values(&[if guard.is_some() { "yes" } else { "no" }])
            .observe(lock_started.elapsed().as_secs_f64());

        // A parallel writer may have filled or freshened the entry
        // while we waited
        let variant = self.store.select_variant(&key, &parts.headers);
        if !req_cc.no_cache {
            if let Some(v) = &variant {
                let info = freshness::evaluate(v, self.clock.now(), &req_cc, self.opts.mode);
                if info.servable_without_revalidation() {
                    return Ok((CacheStatus::Hit, self.serve_variant(v, &info, &parts)));
                }
            }
        }

        let result = self.fetch(&key, &parts, &req_cc, variant.as_ref()).await;
        drop(guard);

        // Client-forced revalidations surface as SKIP however they resolved
        let (status, response) = result?;
        if req_cc.no_cache {
            return Ok((CacheStatus::Skip, response));
        }

        Ok((status, response))
    }

    /// Goes upstream, with validators when revalidating a stored entry,
    /// and sorts out refresh/replace/stale-fallback per the response
    async fn fetch(
        &self,
        key: &PrimaryKey,
        parts: &Parts,
        req_cc: &CacheControl,
        stored: Option<&Arc<Variant>>,
    ) -> Result<(CacheStatus, Response<Body>), Error> {
        let mut outbound = clone_request(parts);

        if let Some(v) = stored {
            if let Some(etag) = v.etag() {
                outbound.headers_mut().insert(IF_NONE_MATCH, etag.clone());
            } else if let Some(lm) = v.headers().get(LAST_MODIFIED) {
                outbound.headers_mut().insert(IF_MODIFIED_SINCE, lm.clone());
            }
        }

        let fetched = match self.upstream.round_trip(outbound).await {
            Ok(v) => sanitize(v),
            Err(e @ (Error::UpstreamUnreachable(_) | Error::UpstreamTimeout)) => {
                return self.serve_stale_fallback(stored, parts, req_cc).ok_or(e);
            }
            Err(e) => return Err(e),
        };

        let status = fetched.response.status();

        // A 304 refreshes the stored entry, which then serves its body
        if status == StatusCode::NOT_MODIFIED {
            if let Some(v) = stored {
                let fresh = self.store.freshen(
                    key,
                    v,
                    fetched.response.headers(),
                    fetched.request_time,
                    fetched.response_time,
                );
                let info =
                    freshness::evaluate(&fresh, self.clock.now(), req_cc, self.opts.mode);
                return Ok((CacheStatus::Hit, self.serve_variant(&fresh, &info, parts)));
            }

            // The client's own conditional got a 304: pass through, unstored
            return Ok((CacheStatus::Miss, fetched.response));
        }

        // Upstream failure: keep serving stale unless forbidden to
        if status.is_server_error() {
            if let Some(resp) = self.serve_stale_fallback(stored, parts, req_cc) {
                return Ok(resp);
            }

            return Ok((CacheStatus::Miss, fetched.response));
        }

        self.store_and_serve(key, parts, req_cc, fetched).await
    }

    /// A stale entry may absorb an upstream failure, with a warning,
    /// unless the response demands revalidation
    fn serve_stale_fallback(
        &self,
        stored: Option<&Arc<Variant>>,
        parts: &Parts,
        req_cc: &CacheControl,
    ) -> Option<(CacheStatus, Response<Body>)> {
        let variant = stored?;
        let cc = variant.cache_control();
        if cc.must_revalidate || cc.no_cache {
            return None;
        }

        let info = freshness::evaluate(variant, self.clock.now(), req_cc, self.opts.mode);
        let mut response = self.serve_variant(variant, &info, parts);
        response
            .headers_mut()
            .append(WARNING, WARN_111_REVALIDATION_FAILED);

        Some((CacheStatus::Hit, response))
    }

    /// Buffers and stores a storable response, then serves the stored
    /// representation; everything else streams through untouched
    async fn store_and_serve(
        &self,
        key: &PrimaryKey,
        parts: &Parts,
        req_cc: &CacheControl,
        fetched: UpstreamResponse,
    ) -> Result<(CacheStatus, Response<Body>), Error> {
        let (resp_parts, body) = fetched.response.into_parts();
        let resp_cc = directives::response_cache_control(&resp_parts.headers);

        // An explicit no-store answer is a skip, but only for this
        // response: the next one decides for itself
        if resp_cc.no_store {
            return Ok((
                CacheStatus::Skip,
                Response::from_parts(resp_parts, body),
            ));
        }

        if !self.storable(parts, req_cc, &resp_parts, &resp_cc) {
            return Ok((CacheStatus::Miss, Response::from_parts(resp_parts, body)));
        }

        // Responses of unknown or excessive size stream through unstored
        let declared = body.size_hint().exact();
        let storable_size = declared.is_some_and(|v| v <= self.opts.max_item_size as u64);
        if !storable_size {
            return Ok((CacheStatus::Miss, Response::from_parts(resp_parts, body)));
        }

        let body = buffer_body(
            body,
            self.opts.max_item_size,
            self.opts.body_timeout,
            declared,
        )
        .await?;

        let variant = Variant::new(
            &parts.headers,
            resp_parts.status,
            resp_parts.headers,
            body,
            fetched.request_time,
            fetched.response_time,
        );
        let variant = self.store.store(key, variant, self.clock.now())?;

        Ok((CacheStatus::Miss, stored_response(&variant, &parts.method)))
    }

    /// Storability per RFC 7234 §3: GET only, cacheable status, no
    /// no-store anywhere, `private` only in private mode, Authorization
    /// only with an explicit allowance
    fn storable(
        &self,
        parts: &Parts,
        req_cc: &CacheControl,
        resp_parts: &http::response::Parts,
        resp_cc: &CacheControl,
    ) -> bool {
        if parts.method != Method::GET {
            return false;
        }

        if req_cc.no_store || resp_cc.no_store {
            return false;
        }

        if resp_cc.private && self.opts.mode == CacheMode::Shared {
            return false;
        }

        if parts.headers.contains_key(AUTHORIZATION)
            && !(resp_cc.public || resp_cc.must_revalidate || resp_cc.s_maxage.is_some())
        {
            return false;
        }

        let explicit_freshness = resp_cc.max_age.is_some()
            || resp_cc.s_maxage.is_some()
            || resp_parts.headers.contains_key(EXPIRES);

        explicit_freshness || status_heuristically_cacheable(resp_parts.status)
    }

    /// Emits a stored variant: a 304 when the client's validators match,
    /// otherwise the representation with Age and Warning stamps. HEAD
    /// gets the headers with the body suppressed.
    fn serve_variant(
        &self,
        variant: &Arc<Variant>,
        info: &FreshnessInfo,
        parts: &Parts,
    ) -> Response<Body> {
        if let Some(response) = not_modified_response(variant, &parts.headers, info) {
            return response;
        }

        let mut response = stored_response(variant, &parts.method);
        stamp_age(response.headers_mut(), info);

        if info.state == Freshness::StaleUsable {
            response
                .headers_mut()
                .append(WARNING, WARN_110_RESPONSE_IS_STALE);
        }

        if info.heuristic && info.current_age > HEURISTIC_LIFETIME_CAP {
            response
                .headers_mut()
                .append(WARNING, WARN_113_HEURISTIC_EXPIRATION);
        }

        response
    }

    /// Non-GET/HEAD methods bypass the cache; successful unsafe ones
    /// invalidate their target and anything they point at
    async fn pass_through(
        &self,
        request: Request<Body>,
    ) -> Result<(CacheStatus, Response<Body>), Error> {
        let (mut parts, body) = request.into_parts();
        strip_hop_by_hop_headers(&mut parts.headers);

        let unsafe_method = matches!(
            parts.method,
            Method::POST | Method::PUT | Method::DELETE | Method::PATCH
        );
        let key = PrimaryKey::for_uri(&parts.uri, &parts.headers);

        let fetched = sanitize(
            self.upstream
                .round_trip(Request::from_parts(parts, body))
                .await?,
        );

        let status = fetched.response.status();
        if unsafe_method && (status.is_success() || status.is_redirection()) {
            self.store.invalidate(&key);

            for name in [LOCATION, CONTENT_LOCATION] {
                let target = fetched
                    .response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok());
                if let Some(target) = target {
                    if let Some(k) = invalidation_key(&key, target) {
                        self.store.invalidate(&k);
                    }
                }
            }
        }

        Ok((CacheStatus::Skip, fetched.response))
    }
}

#[async_trait]
impl Run for CacheHandler {
    async fn run(&self, _: CancellationToken) -> Result<(), anyhow::Error> {
        self.store.run_pending_tasks();
        self.metrics.entries.set(self.store.entry_count() as i64);
        self.metrics.memory.set(self.store.weighted_size() as i64);
        Ok(())
    }
}

fn clone_request(parts: &Parts) -> Request<Body> {
    Request::from_parts(parts.clone(), Body::empty())
}

/// Hop-by-hop response headers stop at this hop as well
fn sanitize(mut fetched: UpstreamResponse) -> UpstreamResponse {
    strip_hop_by_hop_headers(fetched.response.headers_mut());
    fetched
}

/// Builds a client response from the stored representation
fn stored_response(variant: &Variant, method: &Method) -> Response<Body> {
    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(variant.body().clone())
    };

    let mut response = Response::new(body);
    *response.status_mut() = variant.status();
    *response.headers_mut() = variant.headers().clone();

    response
}

fn stamp_age(headers: &mut HeaderMap, info: &FreshnessInfo) {
    headers.insert(AGE, HeaderValue::from(info.current_age.as_secs()));
}

/// RFC 7232 precondition check of the client's validators against the
/// stored entry; a match short-circuits into an empty 304
fn not_modified_response(
    variant: &Variant,
    req_headers: &HeaderMap,
    info: &FreshnessInfo,
) -> Option<Response<Body>> {
    if !client_condition_matches(variant, req_headers) {
        return None;
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;

    for name in [ETAG, DATE, CACHE_CONTROL, EXPIRES] {
        if let Some(v) = variant.headers().get(&name) {
            response.headers_mut().insert(name, v.clone());
        }
    }
    stamp_age(response.headers_mut(), info);

    Some(response)
}

fn client_condition_matches(variant: &Variant, req_headers: &HeaderMap) -> bool {
    // If-None-Match, when present, takes precedence
    if let Some(inm) = req_headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        let Some(etag) = variant.etag().and_then(|v| v.to_str().ok()) else {
            return false;
        };

        return inm
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || weak_strip(candidate) == weak_strip(etag));
    }

    if let Some(ims) = directives::parse_date(req_headers, &IF_MODIFIED_SINCE) {
        if let Some(lm) = variant.last_modified() {
            return lm <= ims;
        }
    }

    false
}

fn weak_strip(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

/// Resolves a Location-style target against the request's effective URI.
/// Cross-origin targets never invalidate local entries.
fn invalidation_key(base: &PrimaryKey, target: &str) -> Option<PrimaryKey> {
    let base_url = Url::parse(base.uri()).ok()?;
    let joined = base_url.join(target).ok()?;

    if joined.host_str() != base_url.host_str() {
        return None;
    }

    let uri = Uri::try_from(joined.as_str()).ok()?;
    Some(PrimaryKey::for_uri(&uri, &HeaderMap::new()))
}
