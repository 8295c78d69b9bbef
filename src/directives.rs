use std::time::{Duration, SystemTime};

use http::{
    HeaderMap,
    header::{AGE, CACHE_CONTROL, HeaderName, PRAGMA, VARY},
};
use tracing::{debug, warn};

use crate::Error;

/// `max-stale` either carries a limit or allows unbounded staleness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxStale {
    Unlimited,
    Limit(Duration),
}

impl MaxStale {
    pub const fn allows(&self, excess: Duration) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limit(v) => excess.as_secs() <= v.as_secs(),
        }
    }
}

/// The subset of `Cache-Control` the cache acts on.
/// Unknown directives are dropped during parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub only_if_cached: bool,
    pub must_revalidate: bool,
    pub public: bool,
    pub private: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub min_fresh: Option<Duration>,
    pub max_stale: Option<MaxStale>,
}

impl CacheControl {
    /// Parses a comma-separated directive list. Tokens are case-insensitive,
    /// arguments may be quoted-strings, and unrecognized or unparseable
    /// directives are ignored. Only irrecoverable syntax is an error.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let mut cc = Self::default();

        for directive in split_list(value)? {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }

            let (token, arg) = match directive.split_once('=') {
                Some((t, a)) => (t.trim(), Some(unquote(a.trim()))),
                None => (directive, None),
            };

            match token.to_ascii_lowercase().as_str() {
                "no-store" => cc.no_store = true,
                "no-cache" => cc.no_cache = true,
                "only-if-cached" => cc.only_if_cached = true,
                "must-revalidate" => cc.must_revalidate = true,
                "public" => cc.public = true,
                "private" => cc.private = true,
                "max-age" => cc.max_age = parse_delta(token, arg.as_deref()),
                "s-maxage" => cc.s_maxage = parse_delta(token, arg.as_deref()),
                "min-fresh" => cc.min_fresh = parse_delta(token, arg.as_deref()),
                "max-stale" => {
                    cc.max_stale = match arg {
                        None => Some(MaxStale::Unlimited),
                        Some(_) => parse_delta(token, arg.as_deref()).map(MaxStale::Limit),
                    }
                }
                _ => {}
            }
        }

        Ok(cc)
    }

    /// Collects every `Cache-Control` occurrence (comma-concatenation per
    /// RFC 7230 §3.2.2) and parses the result
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, Error> {
        Self::parse(&join_field_values(headers, &CACHE_CONTROL)?)
    }

    /// Request-side variant: `Pragma: no-cache` counts as
    /// `Cache-Control: no-cache` when the latter is absent
    pub fn from_request_headers(headers: &HeaderMap) -> Result<Self, Error> {
        if !headers.contains_key(CACHE_CONTROL) && pragma_no_cache(headers) {
            return Ok(Self {
                no_cache: true,
                ..Self::default()
            });
        }

        Self::from_headers(headers)
    }
}

/// Lenient request-side parse: irrecoverable input is logged and the
/// header treated as absent
pub fn request_cache_control(headers: &HeaderMap) -> CacheControl {
    CacheControl::from_request_headers(headers).unwrap_or_else(|e| {
        warn!("ignoring request Cache-Control: {e:#}");
        CacheControl::default()
    })
}

/// Lenient response-side parse, same recovery as the request one
pub fn response_cache_control(headers: &HeaderMap) -> CacheControl {
    CacheControl::from_headers(headers).unwrap_or_else(|e| {
        warn!("ignoring response Cache-Control: {e:#}");
        CacheControl::default()
    })
}

fn pragma_no_cache(headers: &HeaderMap) -> bool {
    headers
        .get_all(PRAGMA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("no-cache"))
}

/// Parsed `Vary` header: an ordered field-name list, or `*` which
/// matches no future request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vary {
    Any,
    Fields(Vec<HeaderName>),
}

impl Vary {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, Error> {
        let mut fields = Vec::new();

        for name in join_field_values(headers, &VARY)?.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            if name == "*" {
                return Ok(Self::Any);
            }

            let name = HeaderName::try_from(name)
                .map_err(|e| Error::MalformedDirective(format!("bad Vary field: {e}")))?;
            fields.push(name);
        }

        Ok(Self::Fields(fields))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Fields(f) if f.is_empty())
    }
}

/// Lenient `Vary` parse: irrecoverable input is logged and treated as absent
pub fn response_vary(headers: &HeaderMap) -> Vary {
    Vary::from_headers(headers).unwrap_or_else(|e| {
        warn!("ignoring response Vary: {e:#}");
        Vary::Fields(Vec::new())
    })
}

/// Parses an HTTP-date header field
pub fn parse_date(headers: &HeaderMap, name: &HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

/// Parses the `Age` header as whole seconds
pub fn parse_age(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Splits a header value on commas, honoring quoted-string arguments.
/// An unterminated quoted-string is irrecoverable.
fn split_list(value: &str) -> Result<Vec<&str>, Error> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }

        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if in_quotes {
        return Err(Error::MalformedDirective(format!(
            "unterminated quoted-string in {value:?}"
        )));
    }

    parts.push(&value[start..]);
    Ok(parts)
}

/// Removes surrounding quotes and backslash escapes from an argument
fn unquote(arg: &str) -> String {
    let Some(inner) = arg
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return arg.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped || c != '\\' {
            out.push(c);
            escaped = false;
        } else {
            escaped = true;
        }
    }

    out
}

/// Delta-seconds argument. Failures drop the directive, like unknown tokens.
fn parse_delta(token: &str, arg: Option<&str>) -> Option<Duration> {
    let parsed = arg.and_then(|v| v.parse::<u64>().ok());
    if parsed.is_none() {
        debug!("dropping directive {token} with argument {arg:?}");
    }

    parsed.map(Duration::from_secs)
}

/// Joins repeated occurrences of one header field with commas
fn join_field_values(headers: &HeaderMap, name: &HeaderName) -> Result<String, Error> {
    let mut values = Vec::new();
    for value in headers.get_all(name) {
        let value = value
            .to_str()
            .map_err(|_| Error::MalformedDirective(format!("non-ASCII {name} value")))?;
        values.push(value);
    }

    Ok(values.join(", "))
}
