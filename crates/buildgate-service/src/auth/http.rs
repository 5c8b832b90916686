use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::utils::http::{endpoint, send, transport_error};
use crate::GatewayError;

use super::{DecisionResponse, DecisionService};

/// A [`DecisionService`] reached over HTTP.
///
/// Requests are `POST`ed as JSON to `<url>/authenticate` and `<url>/authorize`, and the service
/// answers with a JSON [`DecisionResponse`].
#[derive(Debug)]
pub struct HttpDecisionService {
    client: Client,
    authenticate_url: Url,
    authorize_url: Url,
    timeout: Duration,
}

impl HttpDecisionService {
    pub fn new(client: Client, url: &Url, timeout: Duration) -> Self {
        Self {
            client,
            authenticate_url: endpoint(url, "authenticate"),
            authorize_url: endpoint(url, "authorize"),
            timeout,
        }
    }

    async fn call(
        &self,
        cancel: CancellationToken,
        name: &'static str,
        url: &Url,
        request: Bytes,
    ) -> Result<DecisionResponse, GatewayError> {
        tracing::trace!(%url, "calling remote decision service");
        let started = Instant::now();
        let builder = self
            .client
            .post(url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(request);

        let result = match send(&cancel, builder).await {
            Ok(response) => response
                .json::<DecisionResponse>()
                .await
                .map_err(transport_error),
            Err(err) => Err(err),
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metric!(
            timer("decisions.remote.duration") = started.elapsed(),
            "endpoint" => name,
            "status" => status,
        );
        result
    }
}

impl DecisionService for HttpDecisionService {
    fn authenticate(
        &self,
        cancel: CancellationToken,
        request: Bytes,
    ) -> BoxFuture<'_, Result<DecisionResponse, GatewayError>> {
        self.call(cancel, "authenticate", &self.authenticate_url, request).boxed()
    }

    fn authorize(
        &self,
        cancel: CancellationToken,
        request: Bytes,
    ) -> BoxFuture<'_, Result<DecisionResponse, GatewayError>> {
        self.call(cancel, "authorize", &self.authorize_url, request).boxed()
    }
}
