//! Programmable forward HTTP proxy.
//!
//! Clients speak plain HTTP or CONNECT to the proxy. Once per request a
//! [`DecisionHook`] chooses whether to demand Basic credentials, which
//! upstream proxy (if any) to chain through, or a synthetic response to
//! serve without contacting any origin; otherwise the engine relays bytes
//! between the client and the target.
//!
//! [`anonymize_proxy`] and [`create_tunnel`] are thin local front-ends over
//! the same engine for credential-unaware clients.

pub mod anonymize;
mod chain;
pub mod config;
mod forward;
mod handler;
pub mod hook;
pub mod proxy_url;
pub mod server;
mod stats;
mod tcp_tunnel;
mod tunnel;

pub use anonymize::{anonymize_proxy, close_anonymized_proxy, AnonymizeError};
pub use hook::{CustomResponse, Decision, DecisionHook, HookArgs, HookError};
pub use proxy_url::{parse_url, redact_url, redact_url_with, ProxyUrl, UrlError, REDACTED};
pub use server::{ProxyServer, ServerError, ServerEvent, ServerOptions};
pub use stats::ConnectionStats;
pub use tcp_tunnel::{close_tunnel, create_tunnel, TunnelError};

#[cfg(test)]
mod tests;
