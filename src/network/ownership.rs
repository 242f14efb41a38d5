//! Write-ownership arbitration between control clients.
//!
//! At most one client may drive the robot at a time. The first client to send
//! a write command becomes the owner; ownership lapses after a quiet period so
//! a vanished client cannot hold the robot hostage. Safety commands never
//! consult the arbiter.

use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

use crate::{error::OwnershipDenied, protocol::mailbox::ClientId};

#[derive(Debug, Clone, Default)]
pub struct OwnershipToken {
    pub holder: Option<ClientId>,
    pub last_touched_at: Option<Instant>,
}

pub struct OwnershipArbiter {
    token: Mutex<OwnershipToken>,
    timeout: Duration,
}

impl OwnershipArbiter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: Mutex::new(OwnershipToken::default()),
            timeout,
        }
    }

    pub fn authorize_write(&self, client: &ClientId) -> Result<(), OwnershipDenied> {
        self.authorize_write_at(client, Instant::now())
    }

    /// Grants, refreshes or denies ownership as of `now`.
    pub fn authorize_write_at(&self, client: &ClientId, now: Instant) -> Result<(), OwnershipDenied> {
        let mut token = self.token.lock();
        let stale = token
            .last_touched_at
            .is_none_or(|t| now.saturating_duration_since(t) > self.timeout);

        match token.holder.clone() {
            Some(holder) if &holder == client => {}
            Some(holder) if !stale => {
                return Err(OwnershipDenied {
                    owner: holder.to_string(),
                });
            }
            previous => {
                match previous {
                    Some(old) => info!("[CTRL] ownership {old} timed out, granted to {client}"),
                    None => info!("[CTRL] ownership granted to {client}"),
                }
                token.holder = Some(client.clone());
            }
        }
        token.last_touched_at = Some(now);
        Ok(())
    }

    /// Drops ownership if `client` holds it.
    pub fn release(&self, client: &ClientId) {
        let mut token = self.token.lock();
        if token.holder.as_ref() == Some(client) {
            info!("[CTRL] ownership released by {client}");
            *token = OwnershipToken::default();
        }
    }

    pub fn holder(&self) -> Option<ClientId> {
        self.token.lock().holder.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ClientId, ClientId) {
        (ClientId::from("10.0.0.5:40000"), ClientId::from("10.0.0.6:40001"))
    }

    #[test]
    fn first_writer_wins_and_others_are_denied() {
        let arbiter = OwnershipArbiter::new(Duration::from_secs(8));
        let (a, b) = ids();
        let t0 = Instant::now();
        assert!(arbiter.authorize_write_at(&a, t0).is_ok());
        let denied = arbiter.authorize_write_at(&b, t0 + Duration::from_secs(1)).unwrap_err();
        assert_eq!(denied.owner, a.to_string());
        assert_eq!(denied.reply(), "CMD_BUSY#OWNER:10.0.0.5:40000\n");
        assert_eq!(arbiter.holder(), Some(a));
    }

    #[test]
    fn owner_activity_keeps_ownership_alive() {
        let arbiter = OwnershipArbiter::new(Duration::from_secs(8));
        let (a, b) = ids();
        let t0 = Instant::now();
        arbiter.authorize_write_at(&a, t0).unwrap();
        arbiter.authorize_write_at(&a, t0 + Duration::from_secs(6)).unwrap();
        assert!(arbiter.authorize_write_at(&b, t0 + Duration::from_secs(12)).is_err());
    }

    #[test]
    fn stale_ownership_is_taken_over() {
        let arbiter = OwnershipArbiter::new(Duration::from_secs(8));
        let (a, b) = ids();
        let t0 = Instant::now();
        arbiter.authorize_write_at(&a, t0).unwrap();
        assert!(arbiter.authorize_write_at(&b, t0 + Duration::from_secs(9)).is_ok());
        assert_eq!(arbiter.holder(), Some(b));
    }

    #[test]
    fn release_only_affects_the_holder() {
        let arbiter = OwnershipArbiter::new(Duration::from_secs(8));
        let (a, b) = ids();
        arbiter.authorize_write(&a).unwrap();
        arbiter.release(&b);
        assert_eq!(arbiter.holder(), Some(a.clone()));
        arbiter.release(&a);
        assert_eq!(arbiter.holder(), None);
        assert!(arbiter.authorize_write(&b).is_ok());
    }
}
