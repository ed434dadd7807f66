//! Seams between the starter and its neighbours.
//!
//! [`Placer`] is what a pipeline dispatcher drives (a [`Node`] in
//! production); [`StartSink`] is what feeds the starter (the resurrector
//! and the bus listener).

use async_trait::async_trait;

use slotgrid_node::{Instance, Node, Placement};

/// Performs one placement attempt to completion.
#[async_trait]
pub trait Placer: Send + Sync {
    async fn place(&self, instance: Instance) -> Placement;
}

#[async_trait]
impl Placer for Node {
    async fn place(&self, instance: Instance) -> Placement {
        self.start_instance(instance).await
    }
}

/// Accepts start requests for slots.
#[async_trait]
pub trait StartSink: Send + Sync {
    async fn start(&self, app: &str, index: u32);
}
