//! Local port tracking for tunnels
//!
//! Every tunnel manager shares one `PortRegistry`; a port is reserved before
//! any suspension point so two concurrent allocations never pick the same one.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// First local port tried for a tunnel
pub const TUNNEL_BASE_PORT: u16 = 9736;

/// Set of local ports currently held by tunnels
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: DashMap<u16, ()>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the first untracked port at or above `start`
    pub fn reserve_from(&self, start: u16) -> Option<u16> {
        let mut port = start;
        loop {
            if let Entry::Vacant(slot) = self.ports.entry(port) {
                slot.insert(());
                return Some(port);
            }
            port = port.checked_add(1)?;
        }
    }

    /// Stop tracking `port`; returns whether it was tracked
    pub fn release(&self, port: u16) -> bool {
        self.ports.remove(&port).is_some()
    }

    pub fn is_tracked(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Tracked ports in ascending order
    pub fn tracked(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.ports.iter().map(|entry| *entry.key()).collect();
        ports.sort_unstable();
        ports
    }
}

/// A reserved port that is released on drop unless kept
pub struct PortReservation {
    registry: Arc<PortRegistry>,
    port: u16,
    armed: bool,
}

impl PortReservation {
    /// Reserve the first untracked port at or above `start`
    pub fn acquire(registry: &Arc<PortRegistry>, start: u16) -> Option<Self> {
        registry.reserve_from(start).map(|port| Self {
            registry: registry.clone(),
            port,
            armed: true,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keep the port tracked; the caller now owns its release
    pub fn keep(mut self) -> u16 {
        self.armed = false;
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release(self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_skips_tracked_ports() {
        let registry = PortRegistry::new();
        assert_eq!(registry.reserve_from(TUNNEL_BASE_PORT), Some(TUNNEL_BASE_PORT));
        assert_eq!(registry.reserve_from(TUNNEL_BASE_PORT), Some(TUNNEL_BASE_PORT + 1));
        assert_eq!(registry.tracked(), vec![TUNNEL_BASE_PORT, TUNNEL_BASE_PORT + 1]);
    }

    #[test]
    fn test_release_once() {
        let registry = PortRegistry::new();
        let port = registry.reserve_from(TUNNEL_BASE_PORT).unwrap();
        assert!(registry.release(port));
        assert!(!registry.release(port));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reserve_at_top_of_range() {
        let registry = PortRegistry::new();
        assert_eq!(registry.reserve_from(u16::MAX), Some(u16::MAX));
        assert_eq!(registry.reserve_from(u16::MAX), None);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let registry = Arc::new(PortRegistry::new());
        {
            let reservation = PortReservation::acquire(&registry, TUNNEL_BASE_PORT).unwrap();
            assert!(registry.is_tracked(reservation.port()));
        }
        assert!(registry.is_empty());

        let kept = PortReservation::acquire(&registry, TUNNEL_BASE_PORT).unwrap().keep();
        assert!(registry.is_tracked(kept));
    }
}
