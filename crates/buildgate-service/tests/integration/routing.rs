use std::sync::Arc;

use buildgate_service::config::BackendConfig;
use buildgate_service::routing::{
    BackendRegistry, BuildQueue, DemultiplexingBuildQueue, Digest, ExecuteRequest,
    GetCapabilitiesRequest, WaitExecutionRequest,
};
use buildgate_service::{GatewayError, InstanceName};
use futures::TryStreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{client, BackendServer};

fn gateway(backends: &[(&str, &BackendServer)]) -> DemultiplexingBuildQueue {
    let backends: Vec<_> = backends
        .iter()
        .map(|(prefix, server)| BackendConfig {
            instance_name_prefix: InstanceName::new(prefix).unwrap(),
            url: server.url(),
        })
        .collect();
    let registry = BackendRegistry::from_config(&client(), &backends);
    DemultiplexingBuildQueue::new(Arc::new(registry))
}

fn execute_request(instance_name: &str) -> ExecuteRequest {
    ExecuteRequest {
        instance_name: instance_name.into(),
        action_digest: Digest {
            hash: "8b1a9953c4611296a827abf8c47804d7".into(),
            size_bytes: 142,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_capabilities_are_routed_by_prefix() {
    let fallback = BackendServer::new("fallback");
    let linux = BackendServer::new("linux");
    let queue = gateway(&[("", &fallback), ("linux", &linux)]);
    let cancel = CancellationToken::new();

    let capabilities = queue
        .get_capabilities(
            &cancel,
            GetCapabilitiesRequest {
                instance_name: "linux/x86".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(capabilities.other["backend"], json!("linux"));
    assert_eq!(capabilities.other["instance_name"], json!("linux/x86"));

    let capabilities = queue
        .get_capabilities(&cancel, GetCapabilitiesRequest::default())
        .await
        .unwrap();
    assert_eq!(capabilities.other["backend"], json!("fallback"));

    assert_eq!(linux.accesses(), 1);
    assert_eq!(fallback.accesses(), 1);
}

#[tokio::test]
async fn test_execute_and_wait() {
    let linux = BackendServer::new("linux");
    let queue = gateway(&[("linux", &linux)]);
    let cancel = CancellationToken::new();

    let operations: Vec<_> = queue
        .execute(&cancel, execute_request("linux"))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let name = "linux|linux-8b1a9953c4611296a827abf8c47804d7";
    assert_eq!(operations.len(), 2);
    assert!(operations.iter().all(|operation| operation.name == name));
    assert!(!operations[0].done);
    assert!(operations[1].done);
    assert_eq!(operations[1].other["response"], json!({"backend": "linux"}));

    let operations: Vec<_> = queue
        .wait_execution(&cancel, WaitExecutionRequest { name: name.into() })
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].name, name);
    assert!(operations[0].done);

    assert_eq!(linux.accesses(), 2);
}

#[tokio::test]
async fn test_backend_errors() {
    let linux = BackendServer::new("linux");
    let queue = gateway(&[("linux", &linux)]);
    let cancel = CancellationToken::new();

    let result = queue
        .wait_execution(
            &cancel,
            WaitExecutionRequest {
                name: "linux|missing".into(),
            },
        )
        .await;
    assert_eq!(
        result.err(),
        Some(GatewayError::NotFound("Unknown operation".into()))
    );

    let result = queue.execute(&cancel, execute_request("windows")).await;
    assert_eq!(
        result.err(),
        Some(GatewayError::NotFound(
            "Failed to obtain backend for instance \"windows\": No backend configured".into()
        ))
    );
    assert_eq!(linux.accesses(), 1);
}

#[tokio::test]
async fn test_unreachable_backend() {
    // Nothing listens on a port that was just released.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let registry = BackendRegistry::from_config(
        &client(),
        &[BackendConfig {
            instance_name_prefix: InstanceName::empty(),
            url: format!("http://127.0.0.1:{port}/").parse().unwrap(),
        }],
    );
    let queue = DemultiplexingBuildQueue::new(Arc::new(registry));
    let result = queue
        .execute(&CancellationToken::new(), execute_request(""))
        .await;
    assert!(
        matches!(result, Err(GatewayError::Unavailable(_))),
        "{:?}",
        result.err()
    );
}
