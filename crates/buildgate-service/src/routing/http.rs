use std::io;

use futures::future::{BoxFuture, FutureExt};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::utils::http::{endpoint, send, transport_error};
use crate::GatewayError;

use super::{
    BuildQueue, ExecuteRequest, GetCapabilitiesRequest, Operation, OperationStream,
    ServerCapabilities, StreamFrame, WaitExecutionRequest,
};

/// Lines of an operation stream longer than this are rejected.
const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// A [`BuildQueue`] reached over HTTP, speaking the same protocol as the gateway itself.
///
/// - `GET <url>/capabilities/<instance name>` returns [`ServerCapabilities`].
/// - `POST <url>/execute` takes an [`ExecuteRequest`].
/// - `POST <url>/operations/<operation name>` waits for an execution.
///
/// The latter two respond with newline delimited JSON [`StreamFrame`]s.
#[derive(Debug)]
pub struct HttpBuildQueue {
    client: Client,
    url: Url,
}

impl HttpBuildQueue {
    pub fn new(client: Client, url: &Url) -> Self {
        Self {
            client,
            url: url.clone(),
        }
    }

    async fn fetch_capabilities(
        &self,
        cancel: &CancellationToken,
        request: GetCapabilitiesRequest,
    ) -> Result<ServerCapabilities, GatewayError> {
        let mut url = endpoint(&self.url, "capabilities");
        if !request.instance_name.is_empty() {
            url = endpoint(&url, &request.instance_name);
        }
        let response = send(cancel, self.client.get(url)).await?;
        response.json().await.map_err(transport_error)
    }

    async fn start_execution(
        &self,
        cancel: &CancellationToken,
        request: ExecuteRequest,
    ) -> Result<OperationStream, GatewayError> {
        let url = endpoint(&self.url, "execute");
        let response = send(cancel, self.client.post(url).json(&request)).await?;
        Ok(operation_stream(response))
    }

    async fn wait_for_execution(
        &self,
        cancel: &CancellationToken,
        request: WaitExecutionRequest,
    ) -> Result<OperationStream, GatewayError> {
        let mut url = endpoint(&self.url, "operations");
        // Operation names may contain slashes, which are encoded as part of a single segment.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(&request.name);
        }
        let response = send(cancel, self.client.post(url)).await?;
        Ok(operation_stream(response))
    }
}

/// Parses a newline delimited JSON response body into operations.
///
/// The stream ends after the first error.
fn operation_stream(response: Response) -> OperationStream {
    let body = response.bytes_stream().map_err(io::Error::other);
    let lines = FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
    );

    lines
        .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
        .map(|line| {
            let line = line.map_err(|err| {
                GatewayError::Unavailable(format!("Failed to read operation stream: {err}"))
            })?;
            parse_frame(&line)
        })
        .scan(false, |failed, item| {
            if *failed {
                return futures::future::ready(None);
            }
            *failed = item.is_err();
            futures::future::ready(Some(item))
        })
        .boxed()
}

fn parse_frame(line: &str) -> Result<Operation, GatewayError> {
    let frame = serde_json::from_str(line).map_err(|err| {
        GatewayError::Internal(format!("Invalid frame in operation stream: {err}"))
    })?;
    match frame {
        StreamFrame::Operation(operation) => Ok(operation),
        StreamFrame::Error(body) => {
            let message = body.message.clone();
            Err(body
                .into_error()
                .unwrap_or(GatewayError::Unavailable(message)))
        }
    }
}

impl BuildQueue for HttpBuildQueue {
    fn get_capabilities<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: GetCapabilitiesRequest,
    ) -> BoxFuture<'a, Result<ServerCapabilities, GatewayError>> {
        self.fetch_capabilities(cancel, request).boxed()
    }

    fn execute<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: ExecuteRequest,
    ) -> BoxFuture<'a, Result<OperationStream, GatewayError>> {
        self.start_execution(cancel, request).boxed()
    }

    fn wait_execution<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: WaitExecutionRequest,
    ) -> BoxFuture<'a, Result<OperationStream, GatewayError>> {
        self.wait_for_execution(cancel, request).boxed()
    }
}
