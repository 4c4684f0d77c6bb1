//! HTTP surface of the forwarding engine.
//!
//! - `server` - listener loop, body buffering, forward-or-fallback dispatch
//! - `handler` - the stage pipeline for requests a rule matched
//! - `forwarding` - upstream dispatch and error responses
//! - `client` - pooled upstream client
//! - `headers` / `params` - header sanitation and the JSON views scripts receive
//! - `fallback` - the [`Fallback`] seam for requests the engine does not own

mod client;
mod context;
mod fallback;
mod forwarding;
mod handler;
mod headers;
mod params;
mod server;

pub use client::{create_http_client, HttpClient, NoVerifier};
pub use context::{BufferedRequest, ForwardContext, TraceSettings};
pub use fallback::{Fallback, NotFoundFallback};
pub use forwarding::{dispatch, error_response, json_response};
pub use handler::{handle_forward, ForwardOutcome};
pub use headers::{sanitize_request_headers, strip_response_headers};
pub use server::ConduitServer;
