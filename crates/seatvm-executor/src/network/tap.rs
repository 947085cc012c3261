use super::NetworkOps;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates and removes the per-seat tap devices on the fabric bridge.
#[derive(Clone)]
pub struct TapManager {
    ops: Arc<dyn NetworkOps>,
    bridge: String,
}

impl TapManager {
    pub fn new(ops: Arc<dyn NetworkOps>, bridge: impl Into<String>) -> Self {
        Self {
            ops,
            bridge: bridge.into(),
        }
    }

    /// Create `name`, enslave it to the bridge and bring it up.
    ///
    /// Names are derived from the seat identity, so an existing device with this
    /// name is a leftover from a crashed run of the same seat and gets replaced.
    pub async fn create_interface(&self, name: &str) -> Result<()> {
        if self.ops.link_exists(name).await? {
            warn!(tap = %name, "Replacing stale TAP device");
            self.ops.delete_link(name).await?;
        }

        self.ops.create_tap(name).await?;

        let attach = async {
            self.ops.set_master(name, &self.bridge).await?;
            self.ops.set_up(name).await
        };
        if let Err(e) = attach.await {
            self.delete_interface(name).await;
            return Err(e);
        }

        info!(tap = %name, bridge = %self.bridge, "TAP device ready");
        Ok(())
    }

    /// Best-effort removal; a missing device counts as removed.
    pub async fn delete_interface(&self, name: &str) {
        match self.ops.delete_link(name).await {
            Ok(true) => info!(tap = %name, "Deleted TAP device"),
            Ok(false) => debug!(tap = %name, "TAP device already gone"),
            Err(e) => warn!(tap = %name, error = %e, "Failed to delete TAP device"),
        }
    }
}
