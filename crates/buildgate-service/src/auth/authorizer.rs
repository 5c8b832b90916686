use std::sync::Arc;

use bytes::Bytes;
use futures::future;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::caching::{Clock, Decision, DecisionCache, DecisionCacheConfig};
use crate::{GatewayError, InstanceName};

use super::{AuthenticationMetadata, DecisionService, Verdict};

#[derive(Serialize)]
struct AuthorizeRequest<'a> {
    authentication_metadata: &'a serde_json::Value,
    scope: &'a serde_json::Value,
    instance_name: &'a str,
}

/// Asks a remote [`DecisionService`] whether an authenticated client may access instance names.
#[derive(Debug)]
pub struct RemoteAuthorizer {
    service: Arc<dyn DecisionService>,
    scope: serde_json::Value,
    cache: DecisionCache<(), GatewayError>,
}

impl RemoteAuthorizer {
    pub fn new(
        service: Arc<dyn DecisionService>,
        scope: serde_json::Value,
        cache: DecisionCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            scope,
            cache: DecisionCache::new("authorize", cache, clock),
        }
    }

    /// Authorizes access to each of `instance_names`.
    ///
    /// Returns one result per instance name, in the same order. The instance names are authorized
    /// concurrently, and each of them is cached separately.
    pub async fn authorize(
        &self,
        cancel: &CancellationToken,
        metadata: &AuthenticationMetadata,
        instance_names: &[InstanceName],
    ) -> Vec<Result<(), GatewayError>> {
        let checks = instance_names
            .iter()
            .map(|instance_name| self.authorize_single(cancel, metadata, instance_name));
        future::join_all(checks).await
    }

    async fn authorize_single(
        &self,
        cancel: &CancellationToken,
        metadata: &AuthenticationMetadata,
        instance_name: &InstanceName,
    ) -> Result<(), GatewayError> {
        let request = AuthorizeRequest {
            authentication_metadata: metadata.full(),
            scope: &self.scope,
            instance_name: instance_name.as_str(),
        };
        let request = serde_json::to_vec(&request).map_err(|err| {
            GatewayError::PermissionDenied(format!("Failed to marshal authorize request: {err}"))
        })?;

        let service = Arc::clone(&self.service);
        self.cache
            .get(cancel, Bytes::from(request), move |cancel, request| {
                async move { authorize_remotely(&*service, cancel, request).await }
            })
            .await
    }
}

async fn authorize_remotely(
    service: &dyn DecisionService,
    cancel: CancellationToken,
    request: Bytes,
) -> Decision<(), GatewayError> {
    let response = match service.authorize(cancel, request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(error = %err, "remote authorization failed");
            return Decision::uncacheable(Err(GatewayError::PermissionDenied(format!(
                "Remote authorization failed: {}",
                err.message()
            ))));
        }
    };

    let result = match response.verdict() {
        Verdict::Allow(_) => Ok(()),
        Verdict::Deny(message) => Err(GatewayError::PermissionDenied(message.to_owned())),
        Verdict::Invalid => Err(GatewayError::PermissionDenied(
            "Invalid authorize verdict".into(),
        )),
    };
    Decision::new(result, response.expiration())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use chrono::DateTime;
    use serde_json::json;

    use crate::auth::testutils::MockDecisionService;
    use crate::auth::DecisionResponse;
    use crate::caching::ManualClock;

    use super::*;

    fn setup(
        responses: Vec<Result<DecisionResponse, GatewayError>>,
    ) -> (RemoteAuthorizer, Arc<MockDecisionService>) {
        buildgate_test::setup();
        let service = Arc::new(MockDecisionService::new(responses));
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
        let authorizer = RemoteAuthorizer::new(
            service.clone(),
            json!({"gateway": "ci"}),
            DecisionCacheConfig::default(),
            clock,
        );
        (authorizer, service)
    }

    fn metadata() -> AuthenticationMetadata {
        AuthenticationMetadata::from_value(json!({"public": {"user": "alice"}})).unwrap()
    }

    fn names(names: &[&str]) -> Vec<InstanceName> {
        names
            .iter()
            .map(|name| InstanceName::new(name).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_one_result_per_instance_name() {
        buildgate_test::setup();
        let service = Arc::new(MockDecisionService::from_fn(|request| {
            let expiration = DateTime::from(SystemTime::UNIX_EPOCH + Duration::from_secs(60));
            match request["instance_name"].as_str() {
                Some("android") => Ok(DecisionResponse::allow(json!({})).with_expiration(expiration)),
                Some("ios") => Ok(DecisionResponse::deny("Not a member of ios")),
                _ => Ok(DecisionResponse::default()),
            }
        }));
        let authorizer = RemoteAuthorizer::new(
            service.clone(),
            json!({"gateway": "ci"}),
            DecisionCacheConfig::default(),
            Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH)),
        );
        let cancel = CancellationToken::new();

        let results = authorizer
            .authorize(&cancel, &metadata(), &names(&["android", "ios", "web"]))
            .await;
        assert_eq!(
            results,
            vec![
                Ok(()),
                Err(GatewayError::PermissionDenied("Not a member of ios".into())),
                Err(GatewayError::PermissionDenied(
                    "Invalid authorize verdict".into()
                )),
            ]
        );
        assert_eq!(service.calls(), 3);

        // Only the allow verdict carried an expiration time.
        let results = authorizer
            .authorize(&cancel, &metadata(), &names(&["android", "ios"]))
            .await;
        assert_eq!(
            results,
            vec![
                Ok(()),
                Err(GatewayError::PermissionDenied("Not a member of ios".into())),
            ]
        );
        assert_eq!(service.calls(), 4);

        let requests = service.requests.lock();
        let android = requests
            .iter()
            .find(|request| request["instance_name"] == "android")
            .unwrap();
        assert_eq!(
            android,
            &json!({
                "authentication_metadata": {"public": {"user": "alice"}},
                "scope": {"gateway": "ci"},
                "instance_name": "android",
            })
        );
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let (authorizer, _service) =
            setup(vec![Err(GatewayError::Unavailable("timed out".into()))]);

        let results = authorizer
            .authorize(&CancellationToken::new(), &metadata(), &names(&[""]))
            .await;
        assert_eq!(
            results,
            vec![Err(GatewayError::PermissionDenied(
                "Remote authorization failed: timed out".into()
            ))]
        );
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (authorizer, service) = setup(vec![]);
        let results = authorizer
            .authorize(&CancellationToken::new(), &metadata(), &[])
            .await;
        assert!(results.is_empty());
        assert_eq!(service.calls(), 0);
    }
}
