//! Core of the build gateway.
//!
//! The gateway sits in front of one or more build execution clusters. Every inbound request is
//! authenticated and authorized by asking a remote decision service, and the resulting verdicts
//! are kept in a [`DecisionCache`](caching::DecisionCache) so that the remote service only sees
//! one request per distinct question while the answer is still valid. Execution calls are then
//! routed to a backend that is selected by the instance name of the request.

#[macro_use]
pub mod metrics;

pub mod auth;
pub mod caching;
pub mod config;
pub mod error;
pub mod instance_name;
pub mod logging;
pub mod routing;
pub mod utils;

pub use error::GatewayError;
pub use instance_name::InstanceName;
