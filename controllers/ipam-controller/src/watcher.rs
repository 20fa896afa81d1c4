//! Kubernetes resource watchers.
//!
//! Custom resources are driven through `kube_runtime::Controller` by the
//! generic [`watch_resource`], which evaluates the reconciler's event filter
//! and applies per-object Fibonacci requeue backoff on errors. Node
//! membership is followed with a plain watcher loop feeding the reclaimer.

use crate::backoff::RequeueBackoff;
use crate::error::ControllerError;
use crate::reclaimer::NodeBlockReclaimer;
use crate::reconciler::Reconcile;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{watcher, Controller, WatchStreamExt, controller::{Action, Config as ControllerConfig}};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Prune `LastSeen` after this many observations
const PRUNE_EVERY: usize = 512;

/// Last version handed to the event filter, per object
struct LastSeen<K: kube::Resource<DynamicType = ()>> {
    objects: HashMap<ObjectRef<K>, Arc<K>>,
    observations: usize,
}

/// Shared state of one resource kind's dispatch loop
struct Dispatch<R: Reconcile> {
    reconciler: Arc<R>,
    backoff: RequeueBackoff,
    last_seen: Mutex<LastSeen<R::Resource>>,
    store: Store<R::Resource>,
}

impl<R: Reconcile> Dispatch<R> {
    fn new(reconciler: Arc<R>, store: Store<R::Resource>) -> Self {
        Self {
            reconciler,
            backoff: RequeueBackoff::default(),
            last_seen: Mutex::new(LastSeen {
                objects: HashMap::new(),
                observations: 0,
            }),
            store,
        }
    }
    
    /// Records `obj` as the latest version and returns the previous one.
    fn observe(&self, obj: &Arc<R::Resource>) -> Option<Arc<R::Resource>> {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = last_seen.objects.insert(ObjectRef::from_obj(obj.as_ref()), obj.clone());
        
        // Forget objects that left the cache (deleted)
        last_seen.observations += 1;
        if last_seen.observations % PRUNE_EVERY == 0 {
            last_seen.objects.retain(|key, _| self.store.get(key).is_some());
        }
        previous
    }
}

async fn dispatch<R: Reconcile>(
    obj: Arc<R::Resource>,
    ctx: Arc<Dispatch<R>>,
) -> Result<Action, ControllerError> {
    let kind = ctx.reconciler.kind();
    let name = obj.name_any();
    
    let previous = ctx.observe(&obj);
    if !ctx.reconciler.should_process(previous.as_deref(), &obj) {
        debug!("Skipping {} {}: filtered", kind, name);
        return Ok(Action::await_change());
    }
    
    debug!("Reconciling {} {}", kind, name);
    let action = ctx.reconciler.reconcile(&obj).await?;
    ctx.backoff.reset(&name);
    Ok(action)
}

fn error_policy<R: Reconcile>(
    obj: Arc<R::Resource>,
    error: &ControllerError,
    ctx: Arc<Dispatch<R>>,
) -> Action {
    let name = obj.name_any();
    let delay = ctx.backoff.next_delay(&name);
    error!(
        "Reconciliation error for {} {}: {} (retrying in {}s)",
        ctx.reconciler.kind(),
        name,
        error,
        delay.as_secs()
    );
    Action::requeue(delay)
}

/// Drives `reconciler` from a watch on `api` until the watch ends.
///
/// Delete events never reach the reconciler.
pub async fn watch_resource<R: Reconcile>(
    api: Api<R::Resource>,
    reconciler: Arc<R>,
    concurrency: u16,
) -> Result<(), ControllerError> {
    let kind = reconciler.kind();
    info!("Starting {} watcher", kind);
    
    let controller = Controller::new(api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(concurrency));
    let ctx = Arc::new(Dispatch::new(reconciler, controller.store()));
    
    controller
        .run(dispatch::<R>, error_policy::<R>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", kind, obj.name),
                Err(e) => warn!("Controller error for {}: {}", kind, e),
            }
        })
        .await;
    
    Ok(())
}

/// Follows cluster node membership and reclaims blocks of removed nodes.
///
/// Every re-list after the first one triggers a full sweep, since deletes
/// that happened while the watch was down are not delivered as events.
pub async fn watch_nodes(api: Api<Node>, reclaimer: Arc<NodeBlockReclaimer>) -> Result<(), ControllerError> {
    info!("Starting Node watcher");
    
    let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();
    let mut initial_list_done = false;
    
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("Node watcher error: {}", e);
                continue;
            }
        };
        
        match event {
            watcher::Event::Delete(node) => {
                let name = node.name_any();
                info!("Node deleted: {}", name);
                
                match reclaimer.on_node_removed(&name).await {
                    Ok(report) if !report.failed.is_empty() => {
                        warn!(
                            "Released {} blocks of node {}, {} failed (left for the next sweep)",
                            report.released.len(), name, report.failed.len()
                        );
                    }
                    Ok(report) => {
                        info!("Released {} blocks of node {}", report.released.len(), name);
                    }
                    Err(e) => error!("Failed to reclaim blocks of node {}: {}", name, e),
                }
            }
            watcher::Event::Apply(node) | watcher::Event::InitApply(node) => {
                debug!("Node seen: {}", node.name_any());
            }
            watcher::Event::Init => {
                debug!("Node watcher (re)listing");
            }
            watcher::Event::InitDone => {
                if !initial_list_done {
                    initial_list_done = true;
                    info!("Node watcher initialization complete");
                    continue;
                }
                info!("Node watcher re-listed, sweeping for orphaned blocks");
                if let Err(e) = reclaimer.sweep().await {
                    error!("Reclaim sweep failed: {}", e);
                }
            }
        }
    }
    
    Err(ControllerError::Watch("Node watch stream ended".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{BlockRequest, BlockRequestSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts reconciles; only first sightings pass the filter
    #[derive(Default)]
    struct FirstSightOnly {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Reconcile for FirstSightOnly {
        type Resource = BlockRequest;
        
        fn kind(&self) -> &'static str {
            "BlockRequest"
        }
        
        fn should_process(&self, old: Option<&BlockRequest>, _new: &BlockRequest) -> bool {
            old.is_none()
        }
        
        async fn reconcile(&self, _resource: &BlockRequest) -> Result<Action, ControllerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Action::await_change())
        }
    }

    fn request(name: &str) -> Arc<BlockRequest> {
        Arc::new(BlockRequest::new(name, BlockRequestSpec {
            pool_name: "default".to_string(),
            node_name: "node1".to_string(),
        }))
    }

    fn context() -> (Arc<FirstSightOnly>, Arc<Dispatch<FirstSightOnly>>) {
        let reconciler = Arc::new(FirstSightOnly::default());
        let (reader, _writer) = kube_runtime::reflector::store::<BlockRequest>();
        let ctx = Arc::new(Dispatch::new(reconciler.clone(), reader));
        (reconciler, ctx)
    }

    #[tokio::test]
    async fn test_dispatch_passes_previous_version_to_filter() {
        let (reconciler, ctx) = context();
        
        dispatch(request("a"), ctx.clone()).await.unwrap();
        dispatch(request("a"), ctx.clone()).await.unwrap();
        dispatch(request("b"), ctx.clone()).await.unwrap();
        
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_policy_backs_off_per_object() {
        let (_reconciler, ctx) = context();
        let err = || ControllerError::Reconciliation("boom".to_string());
        
        let delays: Vec<Action> = (0..3)
            .map(|_| error_policy(request("a"), &err(), ctx.clone()))
            .collect();
        assert_eq!(delays, vec![
            Action::requeue(Duration::from_secs(1)),
            Action::requeue(Duration::from_secs(1)),
            Action::requeue(Duration::from_secs(2)),
        ]);
        assert_eq!(
            error_policy(request("b"), &err(), ctx.clone()),
            Action::requeue(Duration::from_secs(1))
        );
    }
}
