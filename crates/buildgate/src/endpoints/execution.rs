use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use buildgate_service::error::ErrorBody;
use buildgate_service::routing::{
    split_operation_name, ExecuteRequest, OperationStream, StreamFrame, WaitExecutionRequest,
};
use buildgate_service::metric;
use futures::{future, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::service::RequestService;

use super::ResponseError;

/// Starts an execution and streams its operations as newline delimited JSON.
pub async fn execute(
    State(service): State<RequestService>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ResponseError> {
    let request: ExecuteRequest = serde_json::from_slice(&body)?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    service
        .admit(&cancel, &headers, &request.instance_name)
        .await?;
    metric!(counter("executions.started") += 1);
    let operations = service.queue().execute(&cancel, request).await?;
    Ok(stream_operations(operations))
}

/// Waits for an execution started earlier, streaming its operations as newline delimited JSON.
pub async fn wait_execution(
    State(service): State<RequestService>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ResponseError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let metadata = service.authenticate(&cancel, &headers).await?;
    let (instance_name, _) = split_operation_name(&name)?;
    service.authorize(&cancel, &metadata, instance_name).await?;
    let operations = service
        .queue()
        .wait_execution(&cancel, WaitExecutionRequest { name })
        .await?;
    Ok(stream_operations(operations))
}

fn stream_operations(operations: OperationStream) -> Response {
    let frames = operations
        .scan(false, |failed, operation| {
            if *failed {
                return future::ready(None);
            }
            *failed = operation.is_err();
            let frame = match operation {
                Ok(operation) => StreamFrame::Operation(operation),
                Err(err) => {
                    tracing::debug!(error = %err, "operation stream failed");
                    StreamFrame::Error(ErrorBody::from(&err))
                }
            };
            future::ready(Some(frame))
        })
        .map(|frame| Ok::<_, Infallible>(encode_frame(&frame)));

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(frames),
    )
        .into_response()
}

fn encode_frame(frame: &StreamFrame) -> Bytes {
    let mut line = serde_json::to_vec(frame).unwrap_or_else(|err| {
        let body = ErrorBody {
            code: "internal".into(),
            message: format!("Failed to encode operation: {err}"),
        };
        serde_json::to_vec(&StreamFrame::Error(body)).unwrap_or_default()
    });
    line.push(b'\n');
    Bytes::from(line)
}
