//! Outpoint status flags
//!
//! A small closed set of facts about an outpoint, stored as a bitset and
//! combined with OR/AND. An outpoint with no recorded status is `EMPTY`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// A single status fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusFlag {
    /// The owning output pays to one of our scripts
    Ours = 1 << 0,
    /// Plain owned output
    Basic = 1 << 1,
    /// Owned through a cold-stake delegation
    ColdStake = 1 << 2,
    /// Referenced by an input of a known transaction
    Spent = 1 << 3,
    /// Withheld from selection by the user
    Locked = 1 << 4,
}

impl StatusFlag {
    pub const ALL: [StatusFlag; 5] = [
        StatusFlag::Ours,
        StatusFlag::Basic,
        StatusFlag::ColdStake,
        StatusFlag::Spent,
        StatusFlag::Locked,
    ];

    pub const fn bit(self) -> u8 {
        self as u8
    }

    fn name(self) -> &'static str {
        match self {
            StatusFlag::Ours => "OURS",
            StatusFlag::Basic => "BASIC",
            StatusFlag::ColdStake => "COLD_STAKE",
            StatusFlag::Spent => "SPENT",
            StatusFlag::Locked => "LOCKED",
        }
    }
}

/// Set of [`StatusFlag`]s
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutpointStatus(u8);

impl OutpointStatus {
    pub const EMPTY: OutpointStatus = OutpointStatus(0);
    pub const OURS: OutpointStatus = OutpointStatus(StatusFlag::Ours.bit());
    pub const SPENT: OutpointStatus = OutpointStatus(StatusFlag::Spent.bit());
    pub const LOCKED: OutpointStatus = OutpointStatus(StatusFlag::Locked.bit());
    /// Filter matching plainly owned outputs
    pub const SPENDABLE: OutpointStatus = OutpointStatus(StatusFlag::Basic.bit());
    /// Filter matching cold-stake delegated outputs
    pub const COLD_STAKED: OutpointStatus = OutpointStatus(StatusFlag::ColdStake.bit());
    /// Ownership bits, the part of a status the oracle decides
    pub const OWNERSHIP: OutpointStatus = OutpointStatus(
        StatusFlag::Ours.bit() | StatusFlag::Basic.bit() | StatusFlag::ColdStake.bit(),
    );

    pub const fn from_bits(bits: u8) -> Self {
        OutpointStatus(bits & 0b1_1111)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, flag: StatusFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// True when any bit is shared with `other`
    pub const fn intersects(self, other: OutpointStatus) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, flag: StatusFlag) {
        self.0 |= flag.bit();
    }

    pub fn remove(&mut self, flag: StatusFlag) {
        self.0 &= !flag.bit();
    }

    pub fn flags(self) -> impl Iterator<Item = StatusFlag> {
        StatusFlag::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl From<StatusFlag> for OutpointStatus {
    fn from(flag: StatusFlag) -> Self {
        OutpointStatus(flag.bit())
    }
}

impl BitOr for OutpointStatus {
    type Output = OutpointStatus;

    fn bitor(self, rhs: OutpointStatus) -> OutpointStatus {
        OutpointStatus(self.0 | rhs.0)
    }
}

impl BitOr<StatusFlag> for OutpointStatus {
    type Output = OutpointStatus;

    fn bitor(self, rhs: StatusFlag) -> OutpointStatus {
        OutpointStatus(self.0 | rhs.bit())
    }
}

impl BitOr for StatusFlag {
    type Output = OutpointStatus;

    fn bitor(self, rhs: StatusFlag) -> OutpointStatus {
        OutpointStatus(self.bit() | rhs.bit())
    }
}

impl BitOrAssign for OutpointStatus {
    fn bitor_assign(&mut self, rhs: OutpointStatus) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for OutpointStatus {
    type Output = OutpointStatus;

    fn bitand(self, rhs: OutpointStatus) -> OutpointStatus {
        OutpointStatus(self.0 & rhs.0)
    }
}

impl Not for OutpointStatus {
    type Output = OutpointStatus;

    fn not(self) -> OutpointStatus {
        OutpointStatus::from_bits(!self.0)
    }
}

impl fmt::Debug for OutpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "OutpointStatus(EMPTY)");
        }
        let names: Vec<&str> = self.flags().map(StatusFlag::name).collect();
        write!(f, "OutpointStatus({})", names.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine_with_or() {
        let status = StatusFlag::Ours | StatusFlag::Basic;
        assert!(status.contains(StatusFlag::Ours));
        assert!(status.contains(StatusFlag::Basic));
        assert!(!status.contains(StatusFlag::Spent));
        assert!(status.intersects(OutpointStatus::SPENDABLE));
        assert!(!status.intersects(OutpointStatus::COLD_STAKED));
    }

    #[test]
    fn test_insert_is_idempotent_and_remove_clears() {
        let mut status = OutpointStatus::EMPTY;
        status.insert(StatusFlag::Spent);
        let once = status;
        status.insert(StatusFlag::Spent);
        assert_eq!(status, once);

        status.insert(StatusFlag::Locked);
        status.remove(StatusFlag::Locked);
        assert_eq!(status, OutpointStatus::SPENT);
    }

    #[test]
    fn test_not_stays_within_known_bits() {
        let inverted = !OutpointStatus::EMPTY;
        assert_eq!(inverted.bits(), 0b1_1111);
        assert_eq!((inverted & OutpointStatus::OWNERSHIP), OutpointStatus::OWNERSHIP);
    }

    #[test]
    fn test_debug_lists_flag_names() {
        let status = StatusFlag::Ours | StatusFlag::Spent;
        assert_eq!(format!("{:?}", status), "OutpointStatus(OURS | SPENT)");
        assert_eq!(format!("{:?}", OutpointStatus::EMPTY), "OutpointStatus(EMPTY)");
    }
}
