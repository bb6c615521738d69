//! Liveness pings from primary to backup and the backup's timeout watch.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    select,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::HeartbeatSettings,
    error::RoleError,
    frame::Message,
    peer::PeerLink,
    role::{Role, RoleCoordinator},
};

const UNARMED: u64 = u64::MAX;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Time of the most recent heartbeat seen on the peer link, stored as
/// milliseconds since the clock was created. Starts unarmed: a backup that
/// has never heard from a primary has nothing to time out.
pub struct HeartbeatClock {
    origin: Instant,
    last_seen_ms: AtomicU64,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_seen_ms: AtomicU64::new(UNARMED),
        }
    }

    pub fn observe(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_seen_ms.store(now, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.last_seen_ms.load(Ordering::Acquire) != UNARMED
    }

    /// Time since the last heartbeat, or `None` if none has arrived yet.
    pub fn since_last(&self) -> Option<Duration> {
        match self.last_seen_ms.load(Ordering::Acquire) {
            UNARMED => None,
            ms => Some(
                self.origin
                    .elapsed()
                    .saturating_sub(Duration::from_millis(ms)),
            ),
        }
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushes a heartbeat onto the peer link every `interval` until the link
/// fails or `cancel` fires. The peer link manager starts a new sender for
/// every link it establishes.
pub async fn run_sender(link: Arc<PeerLink>, interval: Duration, cancel: CancellationToken) {
    // `tokio::time::interval` panics on a zero period.
    let mut ticker = tokio::time::interval(interval.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !link.forward(Message::heartbeat()).await {
                    debug!("heartbeat sender stopping: peer link down");
                    break;
                }
            }
        }
    }
}

/// Backup-side watchdog that promotes the node once the primary has been
/// silent for longer than the configured timeout.
pub struct HeartbeatMonitor {
    clock: Arc<HeartbeatClock>,
    role: Arc<RoleCoordinator>,
    settings: HeartbeatSettings,
}

impl HeartbeatMonitor {
    pub fn new(
        clock: Arc<HeartbeatClock>,
        role: Arc<RoleCoordinator>,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            clock,
            role,
            settings,
        }
    }

    /// Runs one timeout check. Returns `true` only for the check that
    /// performed the promotion.
    pub fn check(&self) -> bool {
        let Some(elapsed) = self.clock.since_last() else {
            return false;
        };
        if elapsed < self.settings.timeout() {
            return false;
        }

        match self.role.promote() {
            Ok(()) => {
                warn!(?elapsed, "primary heartbeat timed out");
                true
            }
            Err(RoleError::PromotionAlreadyOccurred) => false,
            Err(err) => {
                debug!(error = %err, "timeout ignored");
                false
            }
        }
    }

    /// Checks on a timer until the node is promoted or `cancel` fires. The
    /// monitor does not restart after promotion.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.check_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(timeout = ?self.settings.timeout(), "watching primary heartbeat");

        loop {
            select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if self.role.role() != Role::Backup || self.check() {
                        return;
                    }
                }
            }
        }
    }
}
