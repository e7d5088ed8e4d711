//! Network upgrade schedule.
//!
//! Height-activated upgrades apply to every block at or above the activation
//! height. Time-activated upgrades apply to a block once the median-time-past
//! of its parent reaches the activation time.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum UpgradeIndex {
    Bip16 = 0,
    Bip34 = 1,
    Bip66 = 2,
    Bip65 = 3,
    Csv = 4,
    Uahf = 5,
    Daa = 6,
    Monolith = 7,
    MagneticAnomaly = 8,
}

pub const MAX_NETWORK_UPGRADES: usize = 9;

pub const ALL_UPGRADES: [UpgradeIndex; MAX_NETWORK_UPGRADES] = [
    UpgradeIndex::Bip16,
    UpgradeIndex::Bip34,
    UpgradeIndex::Bip66,
    UpgradeIndex::Bip65,
    UpgradeIndex::Csv,
    UpgradeIndex::Uahf,
    UpgradeIndex::Daa,
    UpgradeIndex::Monolith,
    UpgradeIndex::MagneticAnomaly,
];

impl UpgradeIndex {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            UpgradeIndex::Bip16 => "bip16",
            UpgradeIndex::Bip34 => "bip34",
            UpgradeIndex::Bip66 => "bip66",
            UpgradeIndex::Bip65 => "bip65",
            UpgradeIndex::Csv => "csv",
            UpgradeIndex::Uahf => "uahf",
            UpgradeIndex::Daa => "daa",
            UpgradeIndex::Monolith => "monolith",
            UpgradeIndex::MagneticAnomaly => "magnetic-anomaly",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Activation {
    Height(i32),
    MedianTime(i64),
    Never,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeState {
    Disabled,
    Pending,
    Active,
}

pub type UpgradeSchedule = [Activation; MAX_NETWORK_UPGRADES];

/// State of `idx` for a block at `height` whose parent has median-time-past
/// `prev_median_time`.
pub fn network_upgrade_state(
    height: i32,
    prev_median_time: i64,
    upgrades: &UpgradeSchedule,
    idx: UpgradeIndex,
) -> UpgradeState {
    match upgrades[idx.as_usize()] {
        Activation::Never => UpgradeState::Disabled,
        Activation::Height(activation) if height >= activation => UpgradeState::Active,
        Activation::MedianTime(activation) if prev_median_time >= activation => {
            UpgradeState::Active
        }
        _ => UpgradeState::Pending,
    }
}

pub fn network_upgrade_active(
    height: i32,
    prev_median_time: i64,
    upgrades: &UpgradeSchedule,
    idx: UpgradeIndex,
) -> bool {
    network_upgrade_state(height, prev_median_time, upgrades, idx) == UpgradeState::Active
}

pub fn activation_height(upgrades: &UpgradeSchedule, idx: UpgradeIndex) -> Option<i32> {
    match upgrades[idx.as_usize()] {
        Activation::Height(height) => Some(height),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{consensus_params, Network};

    #[test]
    fn mainnet_height_activation_edges() {
        let params = consensus_params(Network::Mainnet);
        let upgrades = &params.upgrades;

        assert!(!network_upgrade_active(227_930, 0, upgrades, UpgradeIndex::Bip34));
        assert!(network_upgrade_active(227_931, 0, upgrades, UpgradeIndex::Bip34));
        assert!(!network_upgrade_active(478_558, 0, upgrades, UpgradeIndex::Uahf));
        assert!(network_upgrade_active(478_559, 0, upgrades, UpgradeIndex::Uahf));
        assert!(network_upgrade_active(504_032, 0, upgrades, UpgradeIndex::Daa));
    }

    #[test]
    fn time_activation_uses_parent_median_time() {
        let params = consensus_params(Network::Mainnet);
        let upgrades = &params.upgrades;

        assert_eq!(
            network_upgrade_state(600_000, 1_526_399_999, upgrades, UpgradeIndex::Monolith),
            UpgradeState::Pending
        );
        assert!(network_upgrade_active(
            600_000,
            1_526_400_000,
            upgrades,
            UpgradeIndex::Monolith
        ));
    }

    #[test]
    fn regtest_disables_bip34_and_reports_heights() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(
            network_upgrade_state(500, 0, &params.upgrades, UpgradeIndex::Bip34),
            UpgradeState::Disabled
        );
        assert_eq!(
            activation_height(&params.upgrades, UpgradeIndex::Bip66),
            Some(1_251)
        );
        assert_eq!(
            activation_height(&params.upgrades, UpgradeIndex::Monolith),
            None
        );
    }
}
