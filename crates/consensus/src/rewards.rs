//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    if height < 0 {
        return 0;
    }
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{consensus_params, Network};

    #[test]
    fn mainnet_halving_boundaries() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 1_250_000_000);
        assert_eq!(block_subsidy(630_000, &params), 625_000_000);
        assert_eq!(block_subsidy(210_000 * 64, &params), 0);
    }

    #[test]
    fn regtest_halves_quickly() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(block_subsidy(149, &params), 50 * COIN);
        assert_eq!(block_subsidy(150, &params), 25 * COIN);
    }

    #[test]
    fn total_supply_stays_below_cap() {
        let params = consensus_params(Network::Mainnet);
        let mut total: Amount = 0;
        let mut height = 0;
        loop {
            let subsidy = block_subsidy(height, &params);
            if subsidy == 0 {
                break;
            }
            total += subsidy * params.subsidy_halving_interval as Amount;
            height += params.subsidy_halving_interval;
        }
        assert!(total <= crate::money::MAX_MONEY);
        assert_eq!(total, 2_099_999_997_690_000);
    }
}
