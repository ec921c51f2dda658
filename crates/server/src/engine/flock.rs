//! Swarm participation per vault.

use super::error::EngineResult;
use super::handle::VaultHandle;
use super::Vaultr;
use crate::metrics::REPLICATION_STREAMS_ACTIVE;
use pinfold_core::FlockIntent;
use tracing::{debug, trace, warn};

impl Vaultr {
    /// Move `handle` to `intent`.
    ///
    /// An unchanged intent does nothing. Any change while flocking tears the
    /// vault down first: its streams are destroyed and it leaves the swarm
    /// channel. A non-dormant intent then rejoins the channel. When a swarm
    /// call fails the vault is left with no recorded intent.
    pub async fn set_flock_intent(
        &self,
        handle: &VaultHandle,
        intent: FlockIntent,
    ) -> EngineResult<()> {
        let _serial = handle.lock_flock().await;

        let Some(transition) = handle.transition(intent) else {
            trace!(vault = %handle.key(), ?intent, "Flock intent unchanged");
            return Ok(());
        };

        let dkey = handle.discovery_key();
        if transition.was_flocking {
            for stream in &transition.detached {
                stream.destroy();
                REPLICATION_STREAMS_ACTIVE.dec();
            }
            if let Err(e) = self.archives.swarm.leave(dkey).await {
                handle.clear_flock();
                return Err(e.into());
            }
            debug!(
                vault = %handle.key(),
                streams = transition.detached.len(),
                "Left swarm"
            );
        }

        if intent.is_dormant() {
            return Ok(());
        }

        if let Err(e) = self.archives.swarm.listen(dkey).await {
            handle.clear_flock();
            warn!(vault = %handle.key(), error = %e, "Failed to join swarm");
            return Err(e.into());
        }
        debug!(
            vault = %handle.key(),
            upload = intent.upload,
            download = intent.download,
            "Joined swarm"
        );
        Ok(())
    }
}
