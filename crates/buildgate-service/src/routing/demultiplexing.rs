use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{GatewayError, InstanceName};

use super::{
    BuildQueue, BuildQueueGetter, ExecuteRequest, GetCapabilitiesRequest, OperationStream,
    ServerCapabilities, WaitExecutionRequest,
};

/// Separates the instance name from the backend's name in the operation names handed to clients.
const SEPARATOR: char = '|';

/// Validates an instance name received from a client.
///
/// On top of the rules of [`InstanceName::new`], the name must not contain a pipe character, as
/// that separates the instance name in operation names.
pub fn parse_instance_name(instance_name: &str) -> Result<InstanceName, GatewayError> {
    if instance_name.contains(SEPARATOR) {
        return Err(GatewayError::InvalidArgument(
            "Instance name cannot contain a pipe character".into(),
        ));
    }
    InstanceName::new(instance_name)
        .map_err(|err| err.wrap(format_args!("Invalid instance name {instance_name:?}")))
}

/// Splits an operation name handed to a client into the instance name and the backend's name.
///
/// The split happens at the first pipe character.
pub fn split_operation_name(name: &str) -> Result<(&str, &str), GatewayError> {
    name.split_once(SEPARATOR).ok_or_else(|| {
        GatewayError::InvalidArgument("Unable to extract instance from operation name".into())
    })
}

/// A [`BuildQueue`] forwarding every call to the backend responsible for its instance name.
///
/// Operation names returned to clients are prefixed with the instance name and a pipe character,
/// so that `wait_execution` calls can be routed by the operation name alone. Consequently,
/// instance names containing a pipe character are rejected.
pub struct DemultiplexingBuildQueue {
    getter: Arc<dyn BuildQueueGetter>,
}

impl DemultiplexingBuildQueue {
    pub fn new(getter: Arc<dyn BuildQueueGetter>) -> Self {
        Self { getter }
    }

    fn backend(
        &self,
        instance_name: &str,
    ) -> Result<(InstanceName, Arc<dyn BuildQueue>), GatewayError> {
        let parsed = parse_instance_name(instance_name)?;
        let backend = self.getter.get(&parsed).map_err(|err| {
            err.wrap(format_args!(
                "Failed to obtain backend for instance {instance_name:?}"
            ))
        })?;
        Ok((parsed, backend))
    }

    async fn get_capabilities_routed(
        &self,
        cancel: &CancellationToken,
        request: GetCapabilitiesRequest,
    ) -> Result<ServerCapabilities, GatewayError> {
        let (_, backend) = self.backend(&request.instance_name)?;
        backend.get_capabilities(cancel, request).await
    }

    async fn execute_routed(
        &self,
        cancel: &CancellationToken,
        request: ExecuteRequest,
    ) -> Result<OperationStream, GatewayError> {
        let (instance_name, backend) = self.backend(&request.instance_name)?;
        let operations = backend.execute(cancel, request).await?;
        Ok(prefix_operation_names(instance_name, operations))
    }

    async fn wait_execution_routed(
        &self,
        cancel: &CancellationToken,
        request: WaitExecutionRequest,
    ) -> Result<OperationStream, GatewayError> {
        let (instance_name, name) = split_operation_name(&request.name)?;
        let (instance_name, backend) = self.backend(instance_name)?;
        let request = WaitExecutionRequest {
            name: name.to_owned(),
        };
        let operations = backend.wait_execution(cancel, request).await?;
        Ok(prefix_operation_names(instance_name, operations))
    }
}

fn prefix_operation_names(
    instance_name: InstanceName,
    operations: OperationStream,
) -> OperationStream {
    operations
        .map(move |operation| {
            operation.map(|mut operation| {
                operation.name = format!("{instance_name}{SEPARATOR}{}", operation.name);
                operation
            })
        })
        .boxed()
}

impl BuildQueue for DemultiplexingBuildQueue {
    fn get_capabilities<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: GetCapabilitiesRequest,
    ) -> BoxFuture<'a, Result<ServerCapabilities, GatewayError>> {
        self.get_capabilities_routed(cancel, request).boxed()
    }

    fn execute<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: ExecuteRequest,
    ) -> BoxFuture<'a, Result<OperationStream, GatewayError>> {
        self.execute_routed(cancel, request).boxed()
    }

    fn wait_execution<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: WaitExecutionRequest,
    ) -> BoxFuture<'a, Result<OperationStream, GatewayError>> {
        self.wait_execution_routed(cancel, request).boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::routing::testutils::{Call, MockBuildQueue, Reply};
    use crate::routing::{Digest, Operation};

    use super::*;

    const OPERATION: &str = "df4ab561-4e81-48c7-a387-edc7d899a76f";

    /// A getter handing out a single backend for `ubuntu1804`, recording the lookups.
    struct Getter {
        backend: Option<Arc<MockBuildQueue>>,
        lookups: Mutex<Vec<String>>,
    }

    impl BuildQueueGetter for Getter {
        fn get(&self, instance_name: &InstanceName) -> Result<Arc<dyn BuildQueue>, GatewayError> {
            self.lookups.lock().push(instance_name.to_string());
            match &self.backend {
                Some(backend) if instance_name.as_str() == "ubuntu1804" => {
                    Ok(backend.clone() as Arc<dyn BuildQueue>)
                }
                _ => Err(GatewayError::NotFound("Backend not found".into())),
            }
        }
    }

    fn setup(replies: Vec<Reply>) -> (DemultiplexingBuildQueue, Arc<MockBuildQueue>) {
        buildgate_test::setup();
        let backend = MockBuildQueue::new(replies);
        let getter = Getter {
            backend: Some(backend.clone()),
            lookups: Mutex::new(Vec::new()),
        };
        (DemultiplexingBuildQueue::new(Arc::new(getter)), backend)
    }

    fn execute_request(instance_name: &str) -> ExecuteRequest {
        ExecuteRequest {
            instance_name: instance_name.into(),
            action_digest: Digest {
                hash: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".into(),
                size_bytes: 0,
            },
            ..Default::default()
        }
    }

    fn capabilities_request(instance_name: &str) -> GetCapabilitiesRequest {
        GetCapabilitiesRequest {
            instance_name: instance_name.into(),
        }
    }

    fn wait_request(name: &str) -> WaitExecutionRequest {
        WaitExecutionRequest { name: name.into() }
    }

    fn pipe_error() -> GatewayError {
        GatewayError::InvalidArgument("Instance name cannot contain a pipe character".into())
    }

    fn missing_backend_error() -> GatewayError {
        GatewayError::NotFound(
            "Failed to obtain backend for instance \"Nonexistent backend\": Backend not found"
                .into(),
        )
    }

    fn unreachable() -> GatewayError {
        GatewayError::Unavailable("Server not reachable".into())
    }

    #[tokio::test]
    async fn test_get_capabilities() {
        let capabilities = ServerCapabilities {
            other: json!({"cache_capabilities": {"digest_functions": ["SHA256"]}})
                .as_object()
                .unwrap()
                .clone(),
        };
        let (queue, backend) = setup(vec![
            Reply::Capabilities(Err(unreachable())),
            Reply::Capabilities(Ok(capabilities.clone())),
        ]);
        let cancel = CancellationToken::new();

        let result = queue
            .get_capabilities(&cancel, capabilities_request("Hello|World"))
            .await;
        assert_eq!(result, Err(pipe_error()));

        let result = queue
            .get_capabilities(&cancel, capabilities_request("Nonexistent backend"))
            .await;
        assert_eq!(result, Err(missing_backend_error()));

        // Backend errors are passed through unchanged.
        let result = queue
            .get_capabilities(&cancel, capabilities_request("ubuntu1804"))
            .await;
        assert_eq!(result, Err(unreachable()));

        let result = queue
            .get_capabilities(&cancel, capabilities_request("ubuntu1804"))
            .await;
        assert_eq!(result, Ok(capabilities));

        assert_eq!(
            *backend.calls.lock(),
            vec![
                Call::GetCapabilities(capabilities_request("ubuntu1804")),
                Call::GetCapabilities(capabilities_request("ubuntu1804")),
            ]
        );
    }

    #[tokio::test]
    async fn test_execute() {
        let (queue, backend) = setup(vec![
            Reply::Operations(Err(unreachable())),
            Reply::Operations(Ok(vec![
                Ok(Operation::new(OPERATION, false)),
                Ok(Operation::new(OPERATION, true)),
            ])),
        ]);
        let cancel = CancellationToken::new();

        let result = queue.execute(&cancel, execute_request("Hello|World")).await;
        assert_eq!(result.err(), Some(pipe_error()));

        let result = queue
            .execute(&cancel, execute_request("Nonexistent backend"))
            .await;
        assert_eq!(result.err(), Some(missing_backend_error()));

        let result = queue.execute(&cancel, execute_request("ubuntu1804")).await;
        assert_eq!(result.err(), Some(unreachable()));

        let operations: Vec<_> = queue
            .execute(&cancel, execute_request("ubuntu1804"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let prefixed = format!("ubuntu1804|{OPERATION}");
        assert_eq!(
            operations,
            vec![
                Operation::new(prefixed.clone(), false),
                Operation::new(prefixed, true),
            ]
        );

        // The request is forwarded unchanged.
        assert_eq!(
            backend.calls.lock().last(),
            Some(&Call::Execute(execute_request("ubuntu1804")))
        );
    }

    #[tokio::test]
    async fn test_execute_invalid_instance_name() {
        let (queue, _backend) = setup(vec![]);
        let result = queue
            .execute(&CancellationToken::new(), execute_request("a/blobs"))
            .await;
        assert_eq!(
            result.err(),
            Some(GatewayError::InvalidArgument(
                "Invalid instance name \"a/blobs\": Instance name contains reserved keyword \"blobs\""
                    .into()
            ))
        );
    }

    #[test]
    fn test_split_operation_name() {
        assert_eq!(split_operation_name("linux|a|b"), Ok(("linux", "a|b")));
        assert_eq!(split_operation_name("|a"), Ok(("", "a")));
        assert_eq!(
            split_operation_name("no-instance"),
            Err(GatewayError::InvalidArgument(
                "Unable to extract instance from operation name".into()
            ))
        );
    }

    #[test]
    fn test_parse_instance_name() {
        assert_eq!(parse_instance_name("linux/x86").unwrap().as_str(), "linux/x86");
        assert_eq!(parse_instance_name("a|b"), Err(pipe_error()));
        assert!(matches!(
            parse_instance_name("a//b"),
            Err(GatewayError::InvalidArgument(msg)) if msg.starts_with("Invalid instance name \"a//b\"")
        ));
    }

    #[tokio::test]
    async fn test_stream_errors_pass_through() {
        let (queue, _backend) = setup(vec![Reply::Operations(Ok(vec![
            Ok(Operation::new(OPERATION, false)),
            Err(GatewayError::Unavailable("Worker lost".into())),
        ]))]);

        let operations: Vec<_> = queue
            .execute(&CancellationToken::new(), execute_request("ubuntu1804"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            operations,
            vec![
                Ok(Operation::new(format!("ubuntu1804|{OPERATION}"), false)),
                Err(GatewayError::Unavailable("Worker lost".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_wait_execution() {
        let (queue, backend) = setup(vec![
            Reply::Operations(Err(unreachable())),
            Reply::Operations(Ok(vec![Ok(Operation::new(OPERATION, true))])),
        ]);
        let cancel = CancellationToken::new();

        let result = queue
            .wait_execution(
                &cancel,
                wait_request(
                    "This is an operation name that doesn't contain a pipe, meaning we can't demultiplex",
                ),
            )
            .await;
        assert_eq!(
            result.err(),
            Some(GatewayError::InvalidArgument(
                "Unable to extract instance from operation name".into()
            ))
        );

        let result = queue
            .wait_execution(&cancel, wait_request(&format!("Nonexistent backend|{OPERATION}")))
            .await;
        assert_eq!(result.err(), Some(missing_backend_error()));

        let result = queue
            .wait_execution(&cancel, wait_request(&format!("ubuntu1804|{OPERATION}")))
            .await;
        assert_eq!(result.err(), Some(unreachable()));

        let operations: Vec<_> = queue
            .wait_execution(&cancel, wait_request(&format!("ubuntu1804|{OPERATION}")))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            operations,
            vec![Operation::new(format!("ubuntu1804|{OPERATION}"), true)]
        );

        // The backend only sees its own part of the operation name.
        assert_eq!(
            *backend.calls.lock(),
            vec![
                Call::WaitExecution(wait_request(OPERATION)),
                Call::WaitExecution(wait_request(OPERATION)),
            ]
        );
    }

    #[tokio::test]
    async fn test_wait_execution_splits_on_first_pipe() {
        let (queue, backend) = setup(vec![Reply::Operations(Ok(vec![]))]);

        let operations: Vec<_> = queue
            .wait_execution(&CancellationToken::new(), wait_request("ubuntu1804|a|b"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(operations.is_empty());
        assert_eq!(
            *backend.calls.lock(),
            vec![Call::WaitExecution(wait_request("a|b"))]
        );
    }
}
