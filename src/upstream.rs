use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::body::Body;
use derive_new::new;
use http::{Request, Response};

use crate::{
    Error,
    body::{HintBody, SyncBody},
    clock::Clock,
    headers::strip_hop_by_hop_headers,
};

/// Origin response paired with the timestamps that age calculations need:
/// when the request was sent and when the response headers arrived.
#[derive(Debug, new)]
pub struct UpstreamResponse {
    pub response: Response<Body>,
    pub request_time: SystemTime,
    pub response_time: SystemTime,
}

/// Origin transport capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync + Debug {
    async fn round_trip(&self, request: Request<Body>) -> Result<UpstreamResponse, Error>;
}

/// Options for the reqwest-backed upstream
#[derive(Debug, Clone)]
pub struct Options {
    pub timeout_connect: Duration,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout_connect: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            user_agent: "gateway-cache".into(),
        }
    }
}

/// Forwards requests to the origin over reqwest, stripping hop-by-hop
/// headers and stamping request/response times from the injected clock
#[derive(Debug)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl ReqwestUpstream {
    pub fn new(opts: Options, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(opts.timeout_connect)
            .tcp_nodelay(true)
            .user_agent(opts.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .context("unable to create reqwest client")?;

        Ok(Self {
            client,
            clock,
            timeout: opts.timeout,
        })
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn round_trip(&self, request: Request<Body>) -> Result<UpstreamResponse, Error> {
        let (mut parts, body) = request.into_parts();

        // Only end-to-end headers cross this hop
        strip_hop_by_hop_headers(&mut parts.headers);

        let url = reqwest::Url::parse(&parts.uri.to_string())
            .map_err(|e| Error::UpstreamUnreachable(format!("invalid upstream URL: {e}")))?;

        let mut outbound = reqwest::Request::new(parts.method, url);
        *outbound.headers_mut() = parts.headers;
        // Use SyncBody wrapper that is Sync (Axum body is !Sync)
        *outbound.body_mut() = Some(reqwest::Body::wrap(SyncBody::new(body)));

        let request_time = self.clock.now();
        let result = tokio::time::timeout(self.timeout, self.client.execute(outbound)).await;
        let response_time = self.clock.now();

        let response = match result {
            Err(_) => return Err(Error::UpstreamTimeout),
            Ok(Err(e)) if e.is_timeout() => return Err(Error::UpstreamTimeout),
            Ok(Err(e)) => return Err(Error::UpstreamUnreachable(e.to_string())),
            Ok(Ok(v)) => v,
        };

        // Convert the reqwest response into an Axum one, keeping the
        // Content-Length knowledge as a size hint
        let content_length = response.content_length();
        let response: http::Response<_> = response.into();
        let (parts, body) = response.into_parts();
        let body = HintBody::new(body, content_length);

        Ok(UpstreamResponse::new(
            Response::from_parts(parts, Body::new(body)),
            request_time,
            response_time,
        ))
    }
}
