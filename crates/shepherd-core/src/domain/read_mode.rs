//! ReadMode - dynamic strategy のモードビット
//!
//! モードは bitmask で、複数同時に有効にできる（スコアは加算）。

use serde::{Deserialize, Serialize};

/// Closed set of prioritization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReadModeFlag {
    ReadOrder = 0,
    PreferPub = 1,
    PreferSync = 2,
    PreferBig = 4,
    PreferSmall = 8,
    PreferDefaultStore = 16,
    PreferFast = 32,
    PreferSlow = 64,
    OnlyPreferred = 128,
}

impl ReadModeFlag {
    pub const ALL: [ReadModeFlag; 9] = [
        ReadModeFlag::ReadOrder,
        ReadModeFlag::PreferPub,
        ReadModeFlag::PreferSync,
        ReadModeFlag::PreferBig,
        ReadModeFlag::PreferSmall,
        ReadModeFlag::PreferDefaultStore,
        ReadModeFlag::PreferFast,
        ReadModeFlag::PreferSlow,
        ReadModeFlag::OnlyPreferred,
    ];

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            ReadModeFlag::ReadOrder => "default-order",
            ReadModeFlag::PreferPub => "prefer pub",
            ReadModeFlag::PreferSync => "prefer sync",
            ReadModeFlag::PreferBig => "prefer big",
            ReadModeFlag::PreferSmall => "prefer small",
            ReadModeFlag::PreferDefaultStore => "default store",
            ReadModeFlag::PreferFast => "prefer fast",
            ReadModeFlag::PreferSlow => "prefer slow",
            ReadModeFlag::OnlyPreferred => "only-preferred",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadMode(u32);

impl ReadMode {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn with(self, flag: ReadModeFlag) -> Self {
        Self(self.0 | flag.bits())
    }

    /// `ReadOrder` has no bits, so it is always active.
    pub fn is_active(self, flag: ReadModeFlag) -> bool {
        self.0 & flag.bits() == flag.bits()
    }

    pub fn active_names(self) -> Vec<&'static str> {
        ReadModeFlag::ALL
            .iter()
            .filter(|flag| self.is_active(**flag))
            .map(|flag| flag.name())
            .collect()
    }
}

/// Live knobs of the dynamic strategy; updaters may rewrite them before each rescan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicSettings {
    pub mode: ReadMode,
    pub big_queue_threshold_batches: u64,
    pub limit_per_queue: u32,
}
