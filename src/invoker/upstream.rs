//! The upstream generative service, as seen by this crate.

use crate::extract::ResponseFormat;
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// One call to a generative model: prompt in, raw text out.
///
/// Authentication, model selection and request shaping belong to the
/// implementor. Failures should be reported as [`crate::Error::Upstream`]
/// with a [`crate::UpstreamErrorKind`] so the invoker can tell fatal,
/// quota and transient errors apart.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn generate(&self, prompt: &str, format: &ResponseFormat) -> Result<String>;

    fn name(&self) -> &str {
        "upstream"
    }
}

type GenerateFn =
    dyn Fn(String, ResponseFormat) -> BoxFuture<'static, Result<String>> + Send + Sync;

/// Adapter turning an async closure into an [`Upstream`].
pub struct FnUpstream {
    name: String,
    f: Box<GenerateFn>,
}

#[async_trait]
impl Upstream for FnUpstream {
    async fn generate(&self, prompt: &str, format: &ResponseFormat) -> Result<String> {
        (self.f)(prompt.to_string(), format.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a closure returning a future.
///
/// ```rust
/// use ai_gencache::invoker::upstream_fn;
/// use futures::FutureExt;
///
/// let upstream = upstream_fn("echo", |prompt, _format| {
///     async move { Ok(format!("{{\"echo\": {:?}}}", prompt)) }.boxed()
/// });
/// ```
pub fn upstream_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Upstream>
where
    F: Fn(String, ResponseFormat) -> BoxFuture<'static, Result<String>> + Send + Sync + 'static,
{
    Arc::new(FnUpstream {
        name: name.into(),
        f: Box::new(f),
    })
}
