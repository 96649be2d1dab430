use std::fmt;

use super::payload::PagePayload;

/// Outcome of consulting the cache for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevalidationState {
    /// Fresh payload.
    Hit(PagePayload),
    /// Expired but inside the grace window; serve it and refresh in the background.
    Stale(PagePayload),
    /// Nothing usable and nobody is rendering it.
    Miss,
    /// Waited for another renderer and ran out of budget.
    Timeout,
    /// Another renderer finished while we waited.
    Fulfill(PagePayload),
    /// Client demanded a fresh render.
    Force,
    /// Not cacheable.
    Bypass,
}

impl RevalidationState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Hit(_) => StateKind::Hit,
            Self::Stale(_) => StateKind::Stale,
            Self::Miss => StateKind::Miss,
            Self::Timeout => StateKind::Timeout,
            Self::Fulfill(_) => StateKind::Fulfill,
            Self::Force => StateKind::Force,
            Self::Bypass => StateKind::Bypass,
        }
    }

    pub fn payload(&self) -> Option<&PagePayload> {
        match self {
            Self::Hit(payload) | Self::Stale(payload) | Self::Fulfill(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Payload-free tag of a [`RevalidationState`], echoed to clients and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKind {
    Hit,
    Stale,
    Miss,
    Timeout,
    Fulfill,
    Force,
    Bypass,
}

impl StateKind {
    pub const ALL: [StateKind; 7] = [
        StateKind::Hit,
        StateKind::Stale,
        StateKind::Miss,
        StateKind::Timeout,
        StateKind::Fulfill,
        StateKind::Force,
        StateKind::Bypass,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StateKind::Hit => "hit",
            StateKind::Stale => "stale",
            StateKind::Miss => "miss",
            StateKind::Timeout => "timeout",
            StateKind::Fulfill => "fulfill",
            StateKind::Force => "force",
            StateKind::Bypass => "bypass",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
