//! Authentication and authorization of incoming requests by a remote decision service.
//!
//! Both the [`RemoteAuthenticator`] and the [`RemoteAuthorizer`] serialize their requests to
//! canonical JSON, and look the serialized request up in a [`DecisionCache`]. Only on a miss is
//! the remote [`DecisionService`] consulted, and its verdict is reused until the expiration time
//! the service returned along with it.
//!
//! [`DecisionCache`]: crate::caching::DecisionCache

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::caching::Expiration;
use crate::GatewayError;

mod authenticator;
mod authorizer;
mod headers;
mod http;
mod metadata;

pub use authenticator::{RemoteAuthenticator, RequestHeaders, RequestHeadersAuthenticator};
pub use authorizer::RemoteAuthorizer;
pub use headers::HeaderForwardingAuthenticator;
pub use http::HttpDecisionService;
pub use metadata::AuthenticationMetadata;

/// The response of a remote decision service.
///
/// Exactly one of `allow` and `deny` is expected to be set. The payload of `allow` is the
/// authentication metadata for authentication requests, and ignored for authorization requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<String>,
    /// Until when the verdict may be reused. It is not reused at all if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_expiration_time: Option<DateTime<Utc>>,
}

/// The verdict contained in a [`DecisionResponse`].
#[derive(Debug, PartialEq)]
pub enum Verdict<'a> {
    Allow(&'a serde_json::Value),
    Deny(&'a str),
    Invalid,
}

impl DecisionResponse {
    pub fn allow(payload: serde_json::Value) -> Self {
        Self {
            allow: Some(payload),
            ..Default::default()
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            deny: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.cache_expiration_time = Some(expiration);
        self
    }

    pub fn verdict(&self) -> Verdict<'_> {
        match (&self.allow, &self.deny) {
            (Some(payload), None) => Verdict::Allow(payload),
            (None, Some(message)) => Verdict::Deny(message),
            _ => Verdict::Invalid,
        }
    }

    /// The expiration of the verdict. This applies to denials as well.
    pub fn expiration(&self) -> Expiration {
        match self.cache_expiration_time {
            Some(time) => Expiration::At(SystemTime::from(time)),
            None => Expiration::Uncacheable,
        }
    }
}

/// A remote service deciding on authentication and authorization requests.
///
/// The requests are passed as serialized JSON. Errors returned from here describe failures to
/// reach the service, not denials.
pub trait DecisionService: Send + Sync + 'static {
    fn authenticate(
        &self,
        cancel: CancellationToken,
        request: Bytes,
    ) -> BoxFuture<'_, Result<DecisionResponse, GatewayError>>;

    fn authorize(
        &self,
        cancel: CancellationToken,
        request: Bytes,
    ) -> BoxFuture<'_, Result<DecisionResponse, GatewayError>>;
}

impl fmt::Debug for dyn DecisionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecisionService")
    }
}

#[cfg(test)]
pub(crate) mod testutils {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use parking_lot::Mutex;

    use super::*;

    type Responder =
        Box<dyn Fn(&serde_json::Value) -> Result<DecisionResponse, GatewayError> + Send + Sync>;

    /// A [`DecisionService`] answering from a closure, recording the requests it receives.
    pub struct MockDecisionService {
        responder: Responder,
        pub requests: Mutex<Vec<serde_json::Value>>,
        calls: AtomicUsize,
    }

    impl MockDecisionService {
        /// Replays `responses` in order of the calls.
        pub fn new(
            responses: impl IntoIterator<Item = Result<DecisionResponse, GatewayError>>,
        ) -> Self {
            let responses: Mutex<VecDeque<_>> = Mutex::new(responses.into_iter().collect());
            Self::from_fn(move |_| {
                responses
                    .lock()
                    .pop_front()
                    .expect("unexpected call to the decision service")
            })
        }

        pub fn from_fn(
            responder: impl Fn(&serde_json::Value) -> Result<DecisionResponse, GatewayError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn respond(&self, request: Bytes) -> Result<DecisionResponse, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let request: serde_json::Value = serde_json::from_slice(&request).unwrap();
            let response = (self.responder)(&request);
            self.requests.lock().push(request);
            response
        }
    }

    impl DecisionService for MockDecisionService {
        fn authenticate(
            &self,
            _cancel: CancellationToken,
            request: Bytes,
        ) -> BoxFuture<'_, Result<DecisionResponse, GatewayError>> {
            let response = self.respond(request);
            async move { response }.boxed()
        }

        fn authorize(
            &self,
            _cancel: CancellationToken,
            request: Bytes,
        ) -> BoxFuture<'_, Result<DecisionResponse, GatewayError>> {
            let response = self.respond(request);
            async move { response }.boxed()
        }
    }
}
