//! Ties the authenticator, the authorizer and the backends together.
//!
//! Every call of the gateway goes through [`RequestService::admit`] first, which authenticates the
//! caller by its request headers and authorizes it for the instance name of the call. Only
//! admitted calls are routed to a backend.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use buildgate_service::auth::{
    AuthenticationMetadata, HeaderForwardingAuthenticator, HttpDecisionService,
    RemoteAuthenticator, RemoteAuthorizer,
};
use buildgate_service::caching::{Clock, SystemClock};
use buildgate_service::config::Config;
use buildgate_service::routing::{
    parse_instance_name, BackendRegistry, BuildQueue, DemultiplexingBuildQueue,
};
use buildgate_service::utils::http::create_client;
use buildgate_service::{metric, GatewayError};
use tokio_util::sync::CancellationToken;

struct Inner {
    authenticator: Option<HeaderForwardingAuthenticator>,
    authorizer: Option<RemoteAuthorizer>,
    queue: Arc<dyn BuildQueue>,
}

/// The state shared by all endpoints.
#[derive(Clone)]
pub struct RequestService {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestService")
            .field("authenticator", &self.inner.authenticator)
            .field("authorizer", &self.inner.authorizer)
            .finish_non_exhaustive()
    }
}

impl RequestService {
    /// Creates the service from its configuration.
    ///
    /// No connections are made until the first request is served.
    pub fn create(config: &Config) -> Result<Self> {
        let client =
            create_client(config.connect_timeout).context("failed to create the HTTP client")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let authenticator = match &config.authenticator {
            Some(auth) => {
                let service = Arc::new(HttpDecisionService::new(
                    client.clone(),
                    &auth.url,
                    config.request_timeout,
                ));
                let remote =
                    RemoteAuthenticator::new(service, auth.scope.clone(), auth.cache, clock.clone());
                let authenticator =
                    HeaderForwardingAuthenticator::new(Arc::new(remote), &auth.header_keys)
                        .context("invalid authenticator configuration")?;
                tracing::info!(url = %auth.url, "authenticating requests remotely");
                Some(authenticator)
            }
            None => {
                tracing::warn!("no authenticator configured, all requests are anonymous");
                None
            }
        };

        let authorizer = config.authorizer.as_ref().map(|auth| {
            let service = Arc::new(HttpDecisionService::new(
                client.clone(),
                &auth.url,
                config.request_timeout,
            ));
            tracing::info!(url = %auth.url, "authorizing requests remotely");
            RemoteAuthorizer::new(service, auth.scope.clone(), auth.cache, clock.clone())
        });

        let registry = BackendRegistry::from_config(&client, &config.backends);
        if registry.is_empty() {
            tracing::warn!("no backends configured, all execution requests will fail");
        }
        let queue = Arc::new(DemultiplexingBuildQueue::new(Arc::new(registry)));

        Ok(Self::new(authenticator, authorizer, queue))
    }

    pub fn new(
        authenticator: Option<HeaderForwardingAuthenticator>,
        authorizer: Option<RemoteAuthorizer>,
        queue: Arc<dyn BuildQueue>,
    ) -> Self {
        let inner = Inner {
            authenticator,
            authorizer,
            queue,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The build queue admitted calls are routed to.
    pub fn queue(&self) -> &dyn BuildQueue {
        &*self.inner.queue
    }

    /// Authenticates the caller and authorizes it to access `instance_name`.
    pub async fn admit(
        &self,
        cancel: &CancellationToken,
        headers: &HeaderMap,
        instance_name: &str,
    ) -> Result<(), GatewayError> {
        let metadata = self.authenticate(cancel, headers).await?;
        self.authorize(cancel, &metadata, instance_name).await
    }

    /// Authenticates the caller by its request headers.
    ///
    /// Without an authenticator, every caller is anonymous.
    pub async fn authenticate(
        &self,
        cancel: &CancellationToken,
        headers: &HeaderMap,
    ) -> Result<AuthenticationMetadata, GatewayError> {
        let metadata = match &self.inner.authenticator {
            Some(authenticator) => authenticator.authenticate(cancel, headers).await,
            None => Ok(AuthenticationMetadata::empty()),
        };
        let metadata = metadata.inspect_err(|_| {
            metric!(counter("requests.rejected") += 1, "stage" => "authenticate");
        })?;

        sentry::configure_scope(|scope| {
            for (key, value) in metadata.tracing_attributes() {
                scope.set_tag(&format!("auth.{key}"), value);
            }
        });
        Ok(metadata)
    }

    /// Authorizes an authenticated caller to access `instance_name`.
    ///
    /// Instance names the router would reject are rejected here already, so they never reach the
    /// remote authorizer.
    pub async fn authorize(
        &self,
        cancel: &CancellationToken,
        metadata: &AuthenticationMetadata,
        instance_name: &str,
    ) -> Result<(), GatewayError> {
        let instance_name = parse_instance_name(instance_name).inspect_err(|_| {
            metric!(counter("requests.rejected") += 1, "stage" => "validate");
        })?;
        let Some(authorizer) = &self.inner.authorizer else {
            return Ok(());
        };

        let mut results = authorizer
            .authorize(cancel, metadata, std::slice::from_ref(&instance_name))
            .await;
        let result = results.pop().unwrap_or_else(|| {
            Err(GatewayError::Internal(
                "No authorization result for instance name".into(),
            ))
        });
        result.inspect_err(|_| {
            metric!(counter("requests.rejected") += 1, "stage" => "authorize");
        })
    }
}
