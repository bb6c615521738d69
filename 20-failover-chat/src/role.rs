//! Node role and the single BACKUP → PROMOTED transition.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use tokio::sync::Notify;
use tracing::warn;

use crate::error::RoleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Started as the serving node; never changes.
    Primary,
    /// Replicating the primary and watching its heartbeat.
    Backup,
    /// A former backup that took over after the primary went silent.
    Promoted,
}

impl Role {
    fn as_u8(self) -> u8 {
        match self {
            Role::Primary => 0,
            Role::Backup => 1,
            Role::Promoted => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Role::Primary,
            1 => Role::Backup,
            _ => Role::Promoted,
        }
    }

    /// Whether this node is the one clients should be talking to.
    pub fn is_active(self) -> bool {
        matches!(self, Role::Primary | Role::Promoted)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Primary => "primary",
            Role::Backup => "backup",
            Role::Promoted => "promoted",
        };
        f.write_str(name)
    }
}

/// Owns the node's role. The role is a single atomic so readers never see
/// a torn value while a promotion is in flight.
pub struct RoleCoordinator {
    role: AtomicU8,
    promoted: Notify,
}

impl RoleCoordinator {
    pub fn new(initial: Role) -> Self {
        Self {
            role: AtomicU8::new(initial.as_u8()),
            promoted: Notify::new(),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    /// Moves BACKUP → PROMOTED. Only the first caller succeeds.
    pub fn promote(&self) -> Result<(), RoleError> {
        match self.role.compare_exchange(
            Role::Backup.as_u8(),
            Role::Promoted.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                warn!("promoted to primary");
                self.promoted.notify_waiters();
                Ok(())
            }
            Err(current) => match Role::from_u8(current) {
                Role::Promoted => Err(RoleError::PromotionAlreadyOccurred),
                other => Err(RoleError::NotBackup(other)),
            },
        }
    }

    /// Resolves once the node has been promoted. Never resolves on a
    /// primary.
    pub async fn wait_for_promotion(&self) {
        loop {
            let notified = self.promoted.notified();
            tokio::pin!(notified);
            // Register before checking so a promotion between the check and
            // the await is not missed.
            notified.as_mut().enable();
            if self.role() == Role::Promoted {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn backup_promotes_once() {
        let role = RoleCoordinator::new(Role::Backup);
        assert_eq!(role.promote(), Ok(()));
        assert_eq!(role.role(), Role::Promoted);
        assert_eq!(role.promote(), Err(RoleError::PromotionAlreadyOccurred));
        assert_eq!(role.role(), Role::Promoted);
    }

    #[test]
    fn primary_never_transitions() {
        let role = RoleCoordinator::new(Role::Primary);
        assert_eq!(role.promote(), Err(RoleError::NotBackup(Role::Primary)));
        assert_eq!(role.role(), Role::Primary);
    }

    #[test]
    fn concurrent_promotions_have_one_winner() {
        let role = Arc::new(RoleCoordinator::new(Role::Backup));
        let winners: usize = (0..8)
            .map(|_| {
                let role = Arc::clone(&role);
                std::thread::spawn(move || role.promote().is_ok())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn waiters_wake_on_promotion() {
        let role = Arc::new(RoleCoordinator::new(Role::Backup));
        let waiter = {
            let role = Arc::clone(&role);
            tokio::spawn(async move { role.wait_for_promotion().await })
        };

        tokio::task::yield_now().await;
        role.promote().unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_promoted() {
        let role = RoleCoordinator::new(Role::Backup);
        role.promote().unwrap();
        tokio::time::timeout(Duration::from_millis(100), role.wait_for_promotion())
            .await
            .expect("already promoted");
    }
}
