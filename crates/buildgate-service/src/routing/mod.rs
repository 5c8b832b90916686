//! Routing of execution calls to backends.
//!
//! A [`BuildQueue`] is anything that can execute actions. The [`DemultiplexingBuildQueue`] is
//! one that owns no workers itself, but forwards each call to the backend responsible for the
//! instance name of the call, as selected by a [`BuildQueueGetter`] such as the
//! [`BackendRegistry`].

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::{GatewayError, InstanceName};

mod demultiplexing;
mod http;
mod registry;
mod types;

pub use demultiplexing::{parse_instance_name, split_operation_name, DemultiplexingBuildQueue};
pub use http::HttpBuildQueue;
pub use registry::BackendRegistry;
pub use types::*;

/// The operations streamed back by `execute` and `wait_execution`.
pub type OperationStream = BoxStream<'static, Result<Operation, GatewayError>>;

/// A service executing actions, reporting progress as a stream of operations.
pub trait BuildQueue: Send + Sync {
    fn get_capabilities<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: GetCapabilitiesRequest,
    ) -> BoxFuture<'a, Result<ServerCapabilities, GatewayError>>;

    fn execute<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: ExecuteRequest,
    ) -> BoxFuture<'a, Result<OperationStream, GatewayError>>;

    fn wait_execution<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: WaitExecutionRequest,
    ) -> BoxFuture<'a, Result<OperationStream, GatewayError>>;
}

/// Selects the [`BuildQueue`] responsible for an instance name.
pub trait BuildQueueGetter: Send + Sync {
    fn get(&self, instance_name: &InstanceName) -> Result<Arc<dyn BuildQueue>, GatewayError>;
}

impl<F> BuildQueueGetter for F
where
    F: Fn(&InstanceName) -> Result<Arc<dyn BuildQueue>, GatewayError> + Send + Sync,
{
    fn get(&self, instance_name: &InstanceName) -> Result<Arc<dyn BuildQueue>, GatewayError> {
        self(instance_name)
    }
}
