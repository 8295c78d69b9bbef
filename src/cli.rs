use std::time::Duration;

use clap::Args;
use humantime::parse_duration;

use crate::{CacheMode, handler, parse_size, parse_size_usize, upstream};

#[derive(Args, Clone, Debug, Eq, PartialEq)]
pub struct CacheCli {
    /// Whether the cache serves one user (private) or many (shared)
    #[clap(env, long, default_value = "private")]
    pub cache_mode: CacheMode,

    /// Upper bound on the total stored size. Unbounded if not set.
    #[clap(env, long, value_parser = parse_size)]
    pub cache_size: Option<u64>,

    /// Largest single response body the cache will store
    #[clap(env, long, default_value = "16MB", value_parser = parse_size_usize)]
    pub cache_max_item_size: usize,

    /// How long a coalesced request waits for the per-key writer
    /// before fetching on its own
    #[clap(env, long, default_value = "5s", value_parser = parse_duration)]
    pub cache_lock_timeout: Duration,

    /// Timeout for reading an upstream response body
    #[clap(env, long, default_value = "60s", value_parser = parse_duration)]
    pub cache_body_timeout: Duration,
}

impl From<&CacheCli> for handler::Opts {
    fn from(c: &CacheCli) -> Self {
        Self {
            mode: c.cache_mode,
            cache_size: c.cache_size,
            max_item_size: c.cache_max_item_size,
            lock_timeout: c.cache_lock_timeout,
            body_timeout: c.cache_body_timeout,
        }
    }
}

#[derive(Args, Clone, Debug, Eq, PartialEq)]
pub struct UpstreamCli {
    /// Timeout for the TCP connection phase
    #[clap(env, long, default_value = "5s", value_parser = parse_duration)]
    pub upstream_timeout_connect: Duration,

    /// Deadline for the whole upstream round-trip: this includes
    /// connecting, sending the request, receiving the response etc.
    #[clap(env, long, default_value = "60s", value_parser = parse_duration)]
    pub upstream_timeout: Duration,

    /// User-Agent to send on upstream requests
    #[clap(env, long, default_value = "gateway-cache")]
    pub upstream_user_agent: String,
}

impl From<&UpstreamCli> for upstream::Options {
    fn from(c: &UpstreamCli) -> Self {
        Self {
            timeout_connect: c.upstream_timeout_connect,
            timeout: c.upstream_timeout,
            user_agent: c.upstream_user_agent.clone(),
        }
    }
}
