use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::caching::{Clock, Decision, DecisionCache, DecisionCacheConfig};
use crate::GatewayError;

use super::{AuthenticationMetadata, DecisionService, Verdict};

/// Request headers selected for authentication, keyed by lowercase header name.
pub type RequestHeaders = BTreeMap<String, Vec<String>>;

/// Grants or denies access based on the headers of a request.
pub trait RequestHeadersAuthenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        headers: RequestHeaders,
    ) -> BoxFuture<'a, Result<AuthenticationMetadata, GatewayError>>;
}

#[derive(Serialize)]
struct AuthenticateRequest<'a> {
    request_metadata: &'a RequestHeaders,
    scope: &'a serde_json::Value,
}

/// Forwards request headers to a remote [`DecisionService`] for authentication.
///
/// Verdicts are cached by a SHA-256 hash of the serialized request, so the cache holds no
/// credentials.
#[derive(Debug)]
pub struct RemoteAuthenticator {
    service: Arc<dyn DecisionService>,
    scope: serde_json::Value,
    cache: DecisionCache<AuthenticationMetadata, GatewayError>,
}

impl RemoteAuthenticator {
    pub fn new(
        service: Arc<dyn DecisionService>,
        scope: serde_json::Value,
        cache: DecisionCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            scope,
            cache: DecisionCache::new("authenticate", cache, clock),
        }
    }

    async fn authenticate_cached(
        &self,
        cancel: &CancellationToken,
        headers: RequestHeaders,
    ) -> Result<AuthenticationMetadata, GatewayError> {
        let request = AuthenticateRequest {
            request_metadata: &headers,
            scope: &self.scope,
        };
        let request = serde_json::to_vec(&request).map_err(|err| {
            GatewayError::Unauthenticated(format!(
                "Failed to marshal authenticate request: {err}"
            ))
        })?;

        let service = Arc::clone(&self.service);
        self.cache
            .get(cancel, Bytes::from(request), move |cancel, request| {
                async move { authenticate_remotely(&*service, cancel, request).await }
            })
            .await
    }
}

impl RequestHeadersAuthenticator for RemoteAuthenticator {
    fn authenticate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        headers: RequestHeaders,
    ) -> BoxFuture<'a, Result<AuthenticationMetadata, GatewayError>> {
        self.authenticate_cached(cancel, headers).boxed()
    }
}

async fn authenticate_remotely(
    service: &dyn DecisionService,
    cancel: CancellationToken,
    request: Bytes,
) -> Decision<AuthenticationMetadata, GatewayError> {
    let response = match service.authenticate(cancel, request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(error = %err, "remote authentication failed");
            return Decision::uncacheable(Err(GatewayError::Unauthenticated(format!(
                "Remote authentication failed: {}",
                err.message()
            ))));
        }
    };

    let result = match response.verdict() {
        Verdict::Allow(metadata) => AuthenticationMetadata::from_value(metadata.clone())
            .map_err(|err| {
                GatewayError::Unauthenticated(format!(
                    "Bad authentication response: {}",
                    err.message()
                ))
            }),
        Verdict::Deny(message) => Err(GatewayError::Unauthenticated(message.to_owned())),
        Verdict::Invalid => Err(GatewayError::Unauthenticated(
            "Invalid authentication verdict".into(),
        )),
    };
    Decision::new(result, response.expiration())
}
