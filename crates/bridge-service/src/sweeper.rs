use std::sync::Arc;

use tokio::{
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, info};

use bridge_core::SessionStore;

/// Sweep expired sessions every `every`, independent of traffic.
pub fn spawn_session_sweeper(store: Arc<SessionStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; nothing can have expired yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.cleanup_expired();
            if removed > 0 {
                info!(removed, remaining = store.len(), "Expired sessions swept");
            } else {
                debug!(remaining = store.len(), "Session sweep: nothing expired");
            }
        }
    })
}
