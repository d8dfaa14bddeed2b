//! Tickets: funded claims that keep a chunk at or below some level.

mod manager;
mod player;

pub use manager::{ChunkScheduling, TicketManager, MAX_VIEW_DISTANCE, MOB_SPAWN_RANGE};
pub use player::{PlayerDistance, PlayerTickets};

use crate::prelude::*;
use core::cmp::Ordering;

/// Index of a player in the world's player table.
pub type PlayerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TicketKind {
    Start,
    Player,
    Forced,
    Light,
    Portal,
    PostTeleport,
    Unknown,
}
impl TicketKind {
    pub const ALL: [TicketKind; 7] = [
        TicketKind::Start,
        TicketKind::Player,
        TicketKind::Forced,
        TicketKind::Light,
        TicketKind::Portal,
        TicketKind::PostTeleport,
        TicketKind::Unknown,
    ];
    pub fn name(self) -> &'static str {
        match self {
            TicketKind::Start => "start",
            TicketKind::Player => "player",
            TicketKind::Forced => "forced",
            TicketKind::Light => "light",
            TicketKind::Portal => "portal",
            TicketKind::PostTeleport => "post_teleport",
            TicketKind::Unknown => "unknown",
        }
    }
}

/// Distinguishes tickets of the same kind and level on one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TicketKey {
    Unit,
    Pos(ChunkPos),
    Id(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    pub kind: TicketKind,
    pub level: u32,
    pub key: TicketKey,
    pub created_tick: u64,
}
impl Ticket {
    pub fn new(kind: TicketKind, level: u32, key: TicketKey) -> Self {
        Self {
            kind,
            level,
            key,
            created_tick: 0,
        }
    }
    fn identity(&self) -> (u32, TicketKind, TicketKey) {
        (self.level, self.kind, self.key)
    }
}
// creation tick is bookkeeping, not identity
impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for Ticket {}
impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

/// How long each kind of ticket lives, in ticks. Built once and shared.
#[derive(Debug, Clone)]
pub struct TicketRegistry {
    timeouts: [Option<u64>; 7],
}
impl TicketRegistry {
    pub fn vanilla() -> Self {
        let mut registry = Self { timeouts: [None; 7] };
        registry.set_timeout(TicketKind::Unknown, Some(1));
        registry.set_timeout(TicketKind::PostTeleport, Some(5));
        registry.set_timeout(TicketKind::Portal, Some(300));
        registry
    }
    pub fn set_timeout(&mut self, kind: TicketKind, timeout: Option<u64>) {
        self.timeouts[kind as usize] = timeout;
    }
    pub fn timeout(&self, kind: TicketKind) -> Option<u64> {
        self.timeouts[kind as usize]
    }
    pub fn has_timed_out(&self, ticket: &Ticket, tick: u64) -> bool {
        self.timeout(ticket.kind)
            .map_or(false, |timeout| tick.saturating_sub(ticket.created_tick) > timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn lowest_level_sorts_first() {
        let mut set = BTreeSet::new();
        set.insert(Ticket::new(TicketKind::Unknown, 33, TicketKey::Unit));
        set.insert(Ticket::new(TicketKind::Player, 31, TicketKey::Pos(ChunkPos::new(0, 0))));
        set.insert(Ticket::new(TicketKind::Start, 22, TicketKey::Unit));
        assert_eq!(set.first().map(|t| t.level), Some(22));
    }

    #[test]
    fn creation_tick_is_not_identity() {
        let mut a = Ticket::new(TicketKind::Forced, 31, TicketKey::Id(3));
        let b = a;
        a.created_tick = 99;
        assert_eq!(a, b);
    }

    #[test]
    fn timeouts_are_strictly_after() {
        let registry = TicketRegistry::vanilla();
        let mut ticket = Ticket::new(TicketKind::PostTeleport, 32, TicketKey::Unit);
        ticket.created_tick = 10;
        assert!(!registry.has_timed_out(&ticket, 15));
        assert!(registry.has_timed_out(&ticket, 16));
        let forced = Ticket::new(TicketKind::Forced, 31, TicketKey::Unit);
        assert!(!registry.has_timed_out(&forced, u64::MAX));
        for kind in TicketKind::ALL {
            assert!(!kind.name().is_empty());
        }
    }
}
