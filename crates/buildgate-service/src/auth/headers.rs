use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName};
use tokio_util::sync::CancellationToken;

use crate::GatewayError;

use super::{AuthenticationMetadata, RequestHeaders, RequestHeadersAuthenticator};

/// Authenticates incoming HTTP requests by forwarding a fixed set of their headers to a
/// [`RequestHeadersAuthenticator`].
///
/// Headers that are absent from a request are omitted, rather than forwarded with no values.
pub struct HeaderForwardingAuthenticator {
    inner: Arc<dyn RequestHeadersAuthenticator>,
    header_keys: Vec<HeaderName>,
}

impl std::fmt::Debug for HeaderForwardingAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderForwardingAuthenticator")
            .field("header_keys", &self.header_keys)
            .finish_non_exhaustive()
    }
}

impl HeaderForwardingAuthenticator {
    /// Creates an authenticator forwarding the headers named in `header_keys`.
    ///
    /// Header keys must be given in their canonical lowercase form.
    pub fn new(
        inner: Arc<dyn RequestHeadersAuthenticator>,
        header_keys: &[String],
    ) -> Result<Self, GatewayError> {
        let header_keys = header_keys
            .iter()
            .map(|key| {
                let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                    GatewayError::InvalidArgument(format!("Header key {key:?} is not valid"))
                })?;
                if name.as_str() != key {
                    return Err(GatewayError::InvalidArgument(format!(
                        "Header key {key:?} is not canonical, did you mean {:?}?",
                        name.as_str()
                    )));
                }
                Ok(name)
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { inner, header_keys })
    }

    /// Selects the configured headers from `headers`.
    ///
    /// Values that are not valid UTF-8 are forwarded lossily.
    pub fn select_headers(&self, headers: &HeaderMap) -> RequestHeaders {
        self.header_keys
            .iter()
            .filter_map(|key| {
                let values: Vec<_> = headers
                    .get_all(key)
                    .iter()
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                    .collect();
                (!values.is_empty()).then(|| (key.as_str().to_owned(), values))
            })
            .collect()
    }

    pub async fn authenticate(
        &self,
        cancel: &CancellationToken,
        headers: &HeaderMap,
    ) -> Result<AuthenticationMetadata, GatewayError> {
        let selected = self.select_headers(headers);
        self.inner.authenticate(cancel, selected).await
    }
}
