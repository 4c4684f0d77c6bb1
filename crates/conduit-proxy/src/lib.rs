//! Conduit: a rule-driven HTTP forwarding engine.
//!
//! Inbound paths are matched against stored [`rules::ForwardRule`]s; a match is
//! relayed to the rule's upstream after optional header and parameter scripts, and
//! the upstream response passes through an optional response script on the way
//! back. Each forwarded response carries a base64 JSON trace of every stage.

pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod routing;
pub mod rules;
pub mod scripting;
pub mod trace;

pub use config::Config;
pub use error::{ForwardError, UpstreamError};
pub use proxy::{ConduitServer, Fallback, NotFoundFallback};
pub use rules::{create_rule_store, ForwardRule, RuleStore};
