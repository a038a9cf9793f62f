use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use hyper::body::Incoming;
use hyper::Request;

use crate::proxy_url::ProxyUrl;

/// Error surfaced by a decision hook.
///
/// A failing hook aborts the exchange: the client receives `500` for plain
/// HTTP requests and `502` for CONNECT requests.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HookError(String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// What the engine should do with one client request.
///
/// At most one of `upstream` and `custom_response` may be set, and
/// `custom_response` only applies to plain HTTP requests.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    /// Answer with a `407` challenge and close
    pub require_auth: bool,
    /// Chain the exchange through this upstream proxy instead of connecting
    /// to the target directly
    pub upstream: Option<ProxyUrl>,
    /// Serve this response without contacting any origin (HTTP only)
    pub custom_response: Option<CustomResponse>,
    /// Answer with this status and close
    pub fail_with: Option<StatusCode>,
}

/// Synthetic response served in place of contacting an origin.
///
/// The emitter always sets `Content-Length` from the body and drops any
/// `Transfer-Encoding` the headers carry.
#[derive(Debug, Clone)]
pub struct CustomResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CustomResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

impl Default for CustomResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Inputs handed to the decision hook, once per client request.
///
/// Credentials come from a decoded `Proxy-Authorization: Basic` header and
/// default to empty strings when the header is absent or malformed.
pub struct HookArgs<'a> {
    /// The client request as parsed, headers in original case
    pub request: &'a Request<Incoming>,
    pub username: String,
    pub password: String,
    /// Target hostname (from the CONNECT authority or the absolute-form URI)
    pub hostname: String,
    pub port: u16,
    /// `false` for CONNECT tunnels, `true` otherwise
    pub is_http: bool,
}

/// Per-request decision callback.
///
/// Implementations may resolve immediately or await other work; the engine
/// suspends the connection until the returned future completes. Plain
/// closures of the right shape get a blanket implementation:
///
/// ```no_run
/// use hopproxy::{Decision, HookArgs, HookError};
///
/// let hook = |args: HookArgs<'_>| -> Result<Decision, HookError> {
///     Ok(Decision {
///         require_auth: args.username.is_empty(),
///         ..Decision::default()
///     })
/// };
/// ```
pub trait DecisionHook: Send + Sync {
    fn decide<'a>(
        &'a self,
        args: HookArgs<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Decision, HookError>> + Send + 'a>>;
}

impl<F> DecisionHook for F
where
    F: Fn(HookArgs<'_>) -> Result<Decision, HookError> + Send + Sync,
{
    fn decide<'a>(
        &'a self,
        args: HookArgs<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Decision, HookError>> + Send + 'a>> {
        let decision = self(args);
        Box::pin(async move { decision })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_decision_is_pass_through() {
        let decision = Decision::default();
        assert!(!decision.require_auth);
        assert!(decision.upstream.is_none());
        assert!(decision.custom_response.is_none());
        assert!(decision.fail_with.is_none());
    }

    #[test]
    fn custom_response_defaults_to_empty_200() {
        let response = CustomResponse::default();
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.headers.is_empty());
        assert!(response.body.is_empty());
    }

    #[test]
    fn closures_implement_the_hook_trait() {
        fn assert_hook(_hook: &dyn DecisionHook) {}

        let hook = |_args: HookArgs<'_>| -> Result<Decision, HookError> {
            Ok(Decision::default())
        };
        assert_hook(&hook);
    }
}
