//! Reconciliation logic for the IPAM CRDs.
//!
//! Each resource kind has its own reconciler implementing [`Reconcile`]; the
//! watch layer in `crate::watcher` drives any of them the same way.

pub mod address_pool;
pub mod block_request;

pub use address_pool::AddressPoolReconciler;
pub use block_request::BlockRequestReconciler;

use crate::error::ControllerError;
use kube_runtime::controller::Action;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Converges one object of a resource kind towards its desired state.
///
/// Implementations must be idempotent: the watch layer delivers events
/// at least once, possibly duplicated, and in no particular order across
/// objects.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Resource: kube::Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static;
    
    /// Kind name used in logs
    fn kind(&self) -> &'static str;
    
    /// Event filter evaluated before `reconcile`.
    ///
    /// `old` is the last version the watch layer saw (`None` on first sight).
    /// Must be pure.
    fn should_process(&self, _old: Option<&Self::Resource>, _new: &Self::Resource) -> bool {
        true
    }
    
    async fn reconcile(&self, resource: &Self::Resource) -> Result<Action, ControllerError>;
}
