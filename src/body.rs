use std::{
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};

use axum::body::Body;
use bytes::{Buf, Bytes};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::Error;

/// Reads the given body to completion under a size and a time limit.
/// When the declared length is known, a short read is a truncation error
/// and the result must not be stored or served.
pub async fn buffer_body<H: HttpBody + Send>(
    body: H,
    size_limit: usize,
    timeout: Duration,
    declared_len: Option<u64>,
) -> Result<Bytes, Error>
where
    <H as HttpBody>::Data: Buf + Send + Sync + 'static,
    <H as HttpBody>::Error: std::error::Error + Send + Sync + 'static,
{
    // Collect the body up to the limit
    let body = tokio::time::timeout(timeout, Limited::new(body, size_limit).collect()).await;

    // Body reading timed out
    let Ok(body) = body else {
        return Err(Error::BodyTimedOut);
    };

    let body = body
        .map_err(|e| {
            e.downcast_ref::<LengthLimitError>().map_or_else(
                || Error::UpstreamUnreachable(e.to_string()),
                |_| Error::BodyTooBig,
            )
        })?
        .to_bytes();

    if declared_len.is_some_and(|v| v != body.len() as u64) {
        return Err(Error::BodyTruncated);
    }

    Ok(body)
}

/// Wrapper that makes the provided body Sync
#[derive(Debug)]
pub struct SyncBody {
    inner: Mutex<Pin<Box<Body>>>,
}

impl SyncBody {
    pub fn new(inner: Body) -> Self {
        Self {
            inner: Mutex::new(Box::pin(inner)),
        }
    }
}

impl HttpBody for SyncBody {
    type Data = Bytes;
    type Error = axum::Error;

    #[inline]
    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.inner.lock().unwrap().as_mut().poll_frame(cx)
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.inner.lock().unwrap().as_ref().is_end_stream()
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.inner.lock().unwrap().as_ref().size_hint()
    }
}

/// Wrapper that overrides the size hint of the inner body.
/// Used to carry the upstream Content-Length through body conversions.
#[derive(Debug)]
pub struct HintBody {
    inner: http_body_util::combinators::UnsyncBoxBody<Bytes, axum::Error>,
    hint: SizeHint,
}

impl HintBody {
    pub fn new<B>(body: B, size: Option<u64>) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<axum::BoxError>,
    {
        Self {
            inner: body.map_err(axum::Error::new).boxed_unsync(),
            hint: size.map(SizeHint::with_exact).unwrap_or_default(),
        }
    }
}

impl HttpBody for HintBody {
    type Data = Bytes;
    type Error = axum::Error;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.hint.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_buffer_body() {
        let body = Body::from("hello");
        let buf = buffer_body(body, 1024, Duration::from_secs(1), Some(5))
            .await
            .unwrap();
        assert_eq!(buf.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_buffer_body_too_big() {
        let body = Body::from("a".repeat(32));
        let result = buffer_body(body, 16, Duration::from_secs(1), None).await;
        assert!(matches!(result, Err(Error::BodyTooBig)));
    }

    #[tokio::test]
    async fn test_buffer_body_truncated() {
        // The origin declared 100 bytes but the stream ended after 5
        let body = Body::new(HintBody::new(Body::from("short"), Some(100)));
        let result = buffer_body(body, 1024, Duration::from_secs(1), Some(100)).await;
        assert!(matches!(result, Err(Error::BodyTruncated)));
    }

    #[tokio::test]
    async fn test_hint_body() {
        let body = HintBody::new(Body::from("foobarbaz"), Some(9));
        assert_eq!(body.size_hint().exact(), Some(9));

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"foobarbaz");
    }

    #[tokio::test]
    async fn test_sync_body() {
        let body = SyncBody::new(Body::from("foobar"));
        assert_eq!(body.size_hint().exact(), Some(6));

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"foobar");
    }
}
