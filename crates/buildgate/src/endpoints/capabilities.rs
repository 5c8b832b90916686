use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use buildgate_service::routing::{GetCapabilitiesRequest, ServerCapabilities};
use tokio_util::sync::CancellationToken;

use crate::service::RequestService;

use super::ResponseError;

/// Returns the capabilities of the backend serving the empty instance name.
pub async fn get_default_capabilities(
    State(service): State<RequestService>,
    headers: HeaderMap,
) -> Result<Json<ServerCapabilities>, ResponseError> {
    get_capabilities(service, headers, String::new()).await
}

/// Returns the capabilities of the backend serving an instance name.
pub async fn get_instance_capabilities(
    State(service): State<RequestService>,
    Path(instance_name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ServerCapabilities>, ResponseError> {
    get_capabilities(service, headers, instance_name).await
}

async fn get_capabilities(
    service: RequestService,
    headers: HeaderMap,
    instance_name: String,
) -> Result<Json<ServerCapabilities>, ResponseError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    service.admit(&cancel, &headers, &instance_name).await?;
    let request = GetCapabilitiesRequest { instance_name };
    let capabilities = service.queue().get_capabilities(&cancel, request).await?;
    Ok(Json(capabilities))
}
