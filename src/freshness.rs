use std::time::{Duration, SystemTime};

use http::StatusCode;

use crate::{
    directives::CacheControl,
    handler::CacheMode,
    store::Variant,
};

/// Ceiling on heuristic freshness
pub const HEURISTIC_LIFETIME_CAP: Duration = Duration::from_secs(86400);
/// Heuristic lifetime is 1/N of the Date − Last-Modified span
const HEURISTIC_FRACTION: u32 = 10;

/// Statuses a cache may store without explicit freshness information
const HEURISTICALLY_CACHEABLE: [u16; 11] =
    [200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

pub fn status_heuristically_cacheable(status: StatusCode) -> bool {
    HEURISTICALLY_CACHEABLE.contains(&status.as_u16())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within the freshness lifetime, serve as-is
    Fresh,
    /// Stale, but the caller may serve it with a warning
    StaleUsable,
    /// Stale beyond what the client accepts, revalidate first
    StaleRevalidate,
    /// The response forbids serving without successful revalidation
    MustRevalidate,
}

#[derive(Debug, Clone)]
pub struct FreshnessInfo {
    pub state: Freshness,
    pub current_age: Duration,
    pub lifetime: Duration,
    /// Lifetime came from the Last-Modified heuristic
    pub heuristic: bool,
}

impl FreshnessInfo {
    pub const fn servable_without_revalidation(&self) -> bool {
        matches!(self.state, Freshness::Fresh | Freshness::StaleUsable)
    }

    pub const fn is_stale(&self) -> bool {
        !matches!(self.state, Freshness::Fresh)
    }
}

/// Computes the variant's current age and freshness lifetime at `now`,
/// then classifies it under the request's cache directives.
pub fn evaluate(
    variant: &Variant,
    now: SystemTime,
    req_cc: &CacheControl,
    mode: CacheMode,
) -> FreshnessInfo {
    let resp_cc = variant.cache_control();
    let current_age = variant.current_age(now);
    let (mut lifetime, heuristic) = freshness_lifetime(variant, &resp_cc, mode);

    // The request's max-age bounds how old a response the client accepts
    if let Some(v) = req_cc.max_age {
        lifetime = lifetime.min(v);
    }

    // A no-cache response may only be served after revalidation
    if resp_cc.no_cache {
        return FreshnessInfo {
            state: Freshness::MustRevalidate,
            current_age,
            lifetime,
            heuristic,
        };
    }

    let state = if current_age < lifetime {
        match req_cc.min_fresh {
            // The client demands a remaining-freshness margin we can't meet
            Some(v) if lifetime - current_age < v => Freshness::StaleRevalidate,
            _ => Freshness::Fresh,
        }
    } else if resp_cc.must_revalidate {
        Freshness::MustRevalidate
    } else {
        match req_cc.max_stale {
            Some(v) if !v.allows(current_age - lifetime) => Freshness::StaleRevalidate,
            _ => Freshness::StaleUsable,
        }
    };

    FreshnessInfo {
        state,
        current_age,
        lifetime,
        heuristic,
    }
}

/// RFC 7234 §4.2.1 lifetime precedence: s-maxage (shared caches only),
/// max-age, Expires − Date, then the Last-Modified heuristic.
fn freshness_lifetime(
    variant: &Variant,
    resp_cc: &CacheControl,
    mode: CacheMode,
) -> (Duration, bool) {
    if mode == CacheMode::Shared {
        if let Some(v) = resp_cc.s_maxage {
            return (v, false);
        }
    }

    if let Some(v) = resp_cc.max_age {
        return (v, false);
    }

    let date = variant.date();
    if let (Some(expires), Some(date)) = (variant.expires(), date) {
        return (expires.duration_since(date).unwrap_or_default(), false);
    }

    if status_heuristically_cacheable(variant.status()) {
        if let (Some(date), Some(lm)) = (date, variant.last_modified()) {
            let span = date.duration_since(lm).unwrap_or_default();
            return ((span / HEURISTIC_FRACTION).min(HEURISTIC_LIFETIME_CAP), true);
        }
    }

    (Duration::ZERO, false)
}

#[cfg(test)]
mod test {
    use http::{HeaderMap, header::{CACHE_CONTROL, DATE, EXPIRES, LAST_MODIFIED}};

    use crate::hval;

    use super::*;

    const T0: SystemTime = SystemTime::UNIX_EPOCH;

    fn variant(headers: HeaderMap) -> Variant {
        Variant::new(
            &HeaderMap::new(),
            StatusCode::OK,
            headers,
            "body".into(),
            T0,
            T0,
        )
    }

    fn headers(pairs: &[(http::header::HeaderName, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(DATE, hval!("Thu, 01 Jan 1970 00:00:00 GMT"));
        for (name, value) in pairs {
            h.insert(name, http::HeaderValue::from_static(value));
        }
        h
    }

    fn at(secs: u64) -> SystemTime {
        T0 + Duration::from_secs(secs)
    }

    #[test]
    fn test_max_age_lifetime() {
        let v = variant(headers(&[(CACHE_CONTROL, "max-age=60")]));

        let info = evaluate(&v, at(30), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.state, Freshness::Fresh);
        assert_eq!(info.current_age, Duration::from_secs(30));
        assert_eq!(info.lifetime, Duration::from_secs(60));
        assert!(!info.heuristic);

        // Age == lifetime is already stale
        let info = evaluate(&v, at(60), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.state, Freshness::StaleUsable);
    }

    #[test]
    fn test_s_maxage_only_in_shared_mode() {
        let v = variant(headers(&[(CACHE_CONTROL, "max-age=60, s-maxage=10")]));

        let info = evaluate(&v, at(30), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.state, Freshness::Fresh);

        let info = evaluate(&v, at(30), &CacheControl::default(), CacheMode::Shared);
        assert_eq!(info.state, Freshness::StaleUsable);
        assert_eq!(info.lifetime, Duration::from_secs(10));
    }

    #[test]
    fn test_expires_lifetime() {
        let v = variant(headers(&[(EXPIRES, "Thu, 01 Jan 1970 00:02:00 GMT")]));

        let info = evaluate(&v, at(119), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.state, Freshness::Fresh);
        assert_eq!(info.lifetime, Duration::from_secs(120));

        // Expires in the past means zero lifetime
        let v = variant({
            let mut h = headers(&[(EXPIRES, "Thu, 01 Jan 1970 00:00:30 GMT")]);
            h.insert(DATE, hval!("Thu, 01 Jan 1970 00:01:00 GMT"));
            h
        });
        let info = evaluate(&v, at(61), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.lifetime, Duration::ZERO);
    }

    #[test]
    fn test_heuristic_lifetime() {
        // Date - Last-Modified = 1000s, a tenth of that is fresh
        let v = variant({
            let mut h = headers(&[(LAST_MODIFIED, "Thu, 01 Jan 1970 00:00:00 GMT")]);
            h.insert(DATE, hval!("Thu, 01 Jan 1970 00:16:40 GMT"));
            h
        });

        let info = evaluate(&v, at(1050), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.lifetime, Duration::from_secs(100));
        assert!(info.heuristic);

        // No Last-Modified: nothing to measure, zero lifetime, not heuristic
        let v = variant(headers(&[]));
        let info = evaluate(&v, at(1), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.lifetime, Duration::ZERO);
        assert!(!info.heuristic);
        assert_eq!(info.state, Freshness::StaleUsable);
    }

    #[test]
    fn test_heuristic_cap() {
        // A decade-old Last-Modified would heuristically live for a year;
        // the cap holds it to a day
        let v = variant({
            let mut h = headers(&[(LAST_MODIFIED, "Thu, 01 Jan 1970 00:00:00 GMT")]);
            h.insert(DATE, hval!("Fri, 01 Jan 1971 00:00:00 GMT"));
            h
        });
        let resp_cc = v.cache_control();
        let (lifetime, heuristic) = freshness_lifetime(&v, &resp_cc, CacheMode::Private);
        assert_eq!(lifetime, HEURISTIC_LIFETIME_CAP);
        assert!(heuristic);
    }

    #[test]
    fn test_request_max_age_tightens() {
        let v = variant(headers(&[(CACHE_CONTROL, "max-age=86400")]));
        let req = CacheControl {
            max_age: Some(Duration::from_secs(30)),
            ..CacheControl::default()
        };

        let info = evaluate(&v, at(3600), &req, CacheMode::Private);
        assert_eq!(info.state, Freshness::StaleUsable);
        assert_eq!(info.lifetime, Duration::from_secs(30));
    }

    #[test]
    fn test_min_fresh() {
        let v = variant(headers(&[(CACHE_CONTROL, "max-age=60")]));
        let req = CacheControl {
            min_fresh: Some(Duration::from_secs(20)),
            ..CacheControl::default()
        };

        let info = evaluate(&v, at(30), &req, CacheMode::Private);
        assert_eq!(info.state, Freshness::Fresh);

        let info = evaluate(&v, at(50), &req, CacheMode::Private);
        assert_eq!(info.state, Freshness::StaleRevalidate);
    }

    #[test]
    fn test_max_stale() {
        use crate::directives::MaxStale;

        let v = variant(headers(&[(CACHE_CONTROL, "max-age=60")]));

        let req = CacheControl {
            max_stale: Some(MaxStale::Limit(Duration::from_secs(30))),
            ..CacheControl::default()
        };
        let info = evaluate(&v, at(80), &req, CacheMode::Private);
        assert_eq!(info.state, Freshness::StaleUsable);
        let info = evaluate(&v, at(100), &req, CacheMode::Private);
        assert_eq!(info.state, Freshness::StaleRevalidate);

        let req = CacheControl {
            max_stale: Some(MaxStale::Unlimited),
            ..CacheControl::default()
        };
        let info = evaluate(&v, at(100_000), &req, CacheMode::Private);
        assert_eq!(info.state, Freshness::StaleUsable);
    }

    #[test]
    fn test_revalidation_states() {
        let v = variant(headers(&[(CACHE_CONTROL, "max-age=60, must-revalidate")]));
        let info = evaluate(&v, at(61), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.state, Freshness::MustRevalidate);

        // no-cache responses revalidate even while fresh
        let v = variant(headers(&[(CACHE_CONTROL, "max-age=60, no-cache")]));
        let info = evaluate(&v, at(1), &CacheControl::default(), CacheMode::Private);
        assert_eq!(info.state, Freshness::MustRevalidate);
    }
}
