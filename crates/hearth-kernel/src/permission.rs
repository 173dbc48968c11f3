//! Module permissions.
//!
//! A permission set is a bitset over a fixed vocabulary.  Modules declare
//! the set they need once; the registry grants exactly that set at
//! registration time, and every sensitive kernel-API call checks the
//! matching bit.

use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A set of permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permission(u32);

impl Permission {
    pub const NONE: Self = Self(0);

    // IPC
    pub const IPC_SEND: Self = Self(1);
    pub const IPC_RECEIVE: Self = Self(1 << 1);

    // Events
    pub const EVENT_EMIT: Self = Self(1 << 2);
    pub const EVENT_SUBSCRIBE: Self = Self(1 << 3);

    // Storage
    pub const STORAGE_READ: Self = Self(1 << 4);
    pub const STORAGE_WRITE: Self = Self(1 << 5);

    // System
    pub const SYSTEM_EVENTS: Self = Self(1 << 6);
    pub const SECURITY_EVENTS: Self = Self(1 << 7);
    pub const CALENDAR_READ: Self = Self(1 << 8);

    // LLM
    pub const LLM_LOCAL: Self = Self(1 << 9);
    pub const LLM_EXTERNAL: Self = Self(1 << 10);

    // Composites
    pub const ALL_IPC: Self = Self(Self::IPC_SEND.0 | Self::IPC_RECEIVE.0);
    pub const ALL_EVENTS: Self = Self(Self::EVENT_EMIT.0 | Self::EVENT_SUBSCRIBE.0);
    pub const ALL_STORAGE: Self = Self(Self::STORAGE_READ.0 | Self::STORAGE_WRITE.0);
    pub const ALL_LLM: Self = Self(Self::LLM_LOCAL.0 | Self::LLM_EXTERNAL.0);
    pub const ALL: Self = Self(u32::MAX);

    /// Whether every bit of `other` is present in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(Permission, &str); 11] = [
            (Permission::IPC_SEND, "ipc-send"),
            (Permission::IPC_RECEIVE, "ipc-receive"),
            (Permission::EVENT_EMIT, "event-emit"),
            (Permission::EVENT_SUBSCRIBE, "event-subscribe"),
            (Permission::STORAGE_READ, "storage-read"),
            (Permission::STORAGE_WRITE, "storage-write"),
            (Permission::SYSTEM_EVENTS, "system-events"),
            (Permission::SECURITY_EVENTS, "security-events"),
            (Permission::CALENDAR_READ, "calendar-read"),
            (Permission::LLM_LOCAL, "llm-local"),
            (Permission::LLM_EXTERNAL, "llm-external"),
        ];

        if self.is_empty() {
            return f.write_str("none");
        }

        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_subset() {
        let granted = Permission::EVENT_EMIT | Permission::EVENT_SUBSCRIBE;
        assert!(granted.contains(Permission::EVENT_EMIT));
        assert!(granted.contains(Permission::ALL_EVENTS));
        assert!(!granted.contains(Permission::STORAGE_READ));
        assert!(!granted.contains(Permission::ALL_EVENTS | Permission::STORAGE_READ));
        assert!(granted.contains(Permission::NONE));
    }

    #[test]
    fn composites_cover_members() {
        assert!(Permission::ALL_IPC.contains(Permission::IPC_SEND));
        assert!(Permission::ALL_IPC.contains(Permission::IPC_RECEIVE));
        assert!(Permission::ALL_STORAGE.contains(Permission::STORAGE_WRITE));
        assert!(Permission::ALL_LLM.contains(Permission::LLM_EXTERNAL));
        assert!(Permission::ALL.contains(Permission::ALL_EVENTS));
    }

    #[test]
    fn subset_law_over_bit_pairs() {
        // has_permission(P, Q) <=> Q subset of P, for every pair of single
        // bits and a few composites.
        let bits = [
            Permission::IPC_SEND,
            Permission::IPC_RECEIVE,
            Permission::EVENT_EMIT,
            Permission::EVENT_SUBSCRIBE,
            Permission::STORAGE_READ,
            Permission::STORAGE_WRITE,
            Permission::SYSTEM_EVENTS,
            Permission::SECURITY_EVENTS,
            Permission::CALENDAR_READ,
            Permission::LLM_LOCAL,
            Permission::LLM_EXTERNAL,
        ];
        for a in bits {
            for b in bits {
                let set = a | b;
                assert!(set.contains(a));
                assert!(set.contains(b));
                assert_eq!(set.contains(a | b), true);
                if a != b {
                    assert!(!a.contains(a | b));
                }
            }
        }
    }

    #[test]
    fn display_lists_bits() {
        assert_eq!(Permission::NONE.to_string(), "none");
        assert_eq!(Permission::EVENT_EMIT.to_string(), "event-emit");
        assert_eq!(
            (Permission::EVENT_EMIT | Permission::LLM_LOCAL).to_string(),
            "event-emit|llm-local"
        );
    }
}
