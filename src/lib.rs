#![warn(clippy::nursery)]

pub mod body;
pub mod cli;
pub mod clock;
pub mod directives;
pub mod freshness;
pub mod handler;
pub mod headers;
pub mod store;
pub mod tasks;
pub mod upstream;

use http::StatusCode;

pub use crate::{
    clock::{Clock, SystemClock},
    handler::{CacheHandler, CacheHandlerBuilder, CacheMode, CacheStatus},
    store::Store,
    upstream::{Upstream, UpstreamResponse},
};

/// Errors surfaced by the cache core
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed cache directive: {0}")]
    MalformedDirective(String),
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("upstream deadline elapsed")]
    UpstreamTimeout,
    #[error("no usable cached response for an only-if-cached request")]
    OnlyIfCachedMiss,
    #[error("conflicting store under one cache key")]
    StoreConflict,
    #[error("upstream body ended before the declared length")]
    BodyTruncated,
    #[error("HTTP body reading timed out")]
    BodyTimedOut,
    #[error("HTTP body is too big")]
    BodyTooBig,
    #[error("HTTP failure: {0}")]
    Http(#[from] http::Error),
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl Error {
    /// Status code with which this error surfaces at the client boundary
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::OnlyIfCachedMiss => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnreachable(_)
            | Self::UpstreamTimeout
            | Self::BodyTruncated
            | Self::BodyTimedOut => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Parses size string as a binary (1k = 1024 etc) in u64
pub fn parse_size(s: &str) -> Result<u64, parse_size::Error> {
    parse_size::Config::new().with_binary().parse_size(s)
}

/// Parses size string as a binary (1k = 1024 etc) in usize
pub fn parse_size_usize(s: &str) -> Result<usize, parse_size::Error> {
    parse_size(s).map(|x| x as usize)
}
