//! Owned-resource ledger.
//!
//! Every subsidiary resource a reconcile creates is recorded in object status
//! so finalize can clean it up, even after a controller restart. The ledger
//! never interprets the refs; deletion goes through the `ResourceCleaner`
//! collaborator and tolerates not-found.

use tracing::{debug, info, warn};

use crate::api::{ManagedObject, ObjectSpec, ResourceRef};
use crate::engine::types::{Context, Result};

/// Record a resource this reconcile created. Persists immediately when the
/// ref is new, so a crash between creation and the next status write cannot
/// orphan it.
pub async fn add_owned<S: ObjectSpec>(
    ctx: &Context<S>,
    obj: &mut ManagedObject<S>,
    resource: ResourceRef,
) -> Result<()> {
    if obj.status.owned_resources.insert(resource.clone()) {
        debug!(resource = %resource, object = %obj.key(), "Recording owned resource");
        *obj = ctx.store.update_status(obj).await?;
    }
    Ok(())
}

/// Drop a ref from the ledger after the resource was deliberately deleted.
pub async fn remove_owned<S: ObjectSpec>(
    ctx: &Context<S>,
    obj: &mut ManagedObject<S>,
    resource: &ResourceRef,
) -> Result<()> {
    if obj.status.owned_resources.remove(resource) {
        *obj = ctx.store.update_status(obj).await?;
    }
    Ok(())
}

/// Delete every recorded resource, invoked during finalize. Individual
/// failures are logged and the ref stays in the ledger; returns whether the
/// ledger is fully drained, and the caller must keep the finalizer and retry
/// until it is.
pub async fn cleanup_owned<S: ObjectSpec>(
    ctx: &Context<S>,
    obj: &mut ManagedObject<S>,
) -> Result<bool> {
    let refs: Vec<ResourceRef> = obj.status.owned_resources.iter().cloned().collect();
    info!(object = %obj.key(), count = refs.len(), "Cleaning up owned resources");

    let mut drained_any = false;
    for resource in refs {
        match ctx.cleaner.delete_resource(&resource).await {
            Ok(()) => {
                obj.status.owned_resources.remove(&resource);
                drained_any = true;
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Failed to delete owned resource, will retry");
            }
        }
    }

    if drained_any {
        *obj = ctx.store.update_status(obj).await?;
    }
    Ok(obj.status.owned_resources.is_empty())
}
