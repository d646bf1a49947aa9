//! The bidirectional sync engine.
//!
//! Each supported kind implements [`Syncer`]; the generic driver in
//! [`generic`] runs the per-key state machine over it, and [`manager`] wires
//! watch events into per-kind work queues.
//!
//! Forward and backward flows are deliberately separate decisions over the
//! same key pair: a reconcile never writes the side that triggered it with
//! data derived from that same side, which is what keeps the loop free of
//! write cycles.

pub mod config_maps;
pub mod endpoints;
pub mod events;
pub mod generic;
pub mod ingresses;
pub mod manager;
pub mod persistent_volume_claims;
pub mod pods;
pub mod queue;
pub mod secrets;
pub mod service_accounts;
pub mod services;

use async_trait::async_trait;

use crate::client::SyncedObject;
use crate::error::Result;

/// Which side owns the object's spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// The virtual object is the source of truth; the physical side mirrors it
    Forward,
    /// The physical side generates the object (endpoints); the virtual side
    /// mirrors it
    Backward,
}

/// Per-kind reconciliation decisions and mutations.
///
/// Decision methods never write. Mutation methods perform their own API
/// writes through the clusters the syncer was constructed with, so they stay
/// directly testable against fake stores.
#[async_trait]
pub trait Syncer: Send + Sync {
    type Object: SyncedObject;

    /// Lowercase plural kind name, e.g. "secrets"; used for logging and the
    /// disable list
    fn kind_name(&self) -> &'static str;

    fn direction(&self) -> SyncDirection {
        SyncDirection::Forward
    }

    /// Whether the virtual object is in scope and needs a physical projection
    async fn forward_create_needed(&self, v: &Self::Object) -> Result<bool>;

    /// Whether the physical object drifted from the virtual one
    async fn forward_update_needed(&self, p: &Self::Object, v: &Self::Object) -> Result<bool>;

    /// Whether host-assigned state needs to flow back onto the virtual object
    async fn backward_update_needed(&self, _p: &Self::Object, _v: &Self::Object) -> Result<bool> {
        Ok(false)
    }

    /// Project the virtual object into the target namespace
    async fn forward_create(&self, v: &Self::Object) -> Result<Self::Object>;

    /// Re-derive the desired physical state from the virtual object and patch
    async fn forward_update(&self, p: &Self::Object, v: &Self::Object) -> Result<Self::Object>;

    /// Delete the physical projection
    async fn forward_delete(&self, p: &Self::Object) -> Result<()>;

    /// Copy host-assigned state onto the virtual object
    async fn backward_update(&self, _p: &Self::Object, _v: &Self::Object) -> Result<()> {
        Ok(())
    }

    /// Create the virtual object from physical state (backward kinds only).
    /// The key names the virtual identity; host-generated objects carry no
    /// reverse-lookup annotations to derive it from. Returning `Ok(None)`
    /// means creation is not applicable for this key.
    async fn backward_create(
        &self,
        _key: &crate::translate::refs::ResourceRef,
        _p: &Self::Object,
    ) -> Result<Option<Self::Object>> {
        Ok(None)
    }
}
