//! Weighted validator sets with proposer-priority rotation.

use alloy_primitives::Address;
use thiserror::Error;

use crate::Round;

/// Scaling window: priorities are squashed whenever their spread exceeds
/// `PRIORITY_WINDOW_SIZE_FACTOR * total_voting_power`.
const PRIORITY_WINDOW_SIZE_FACTOR: i128 = 2;

#[derive(Debug, Error)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,

    #[error("duplicate validator address {0}")]
    DuplicateAddress(Address),

    #[error("total voting power {0} exceeds the 63-bit budget")]
    TotalPowerOverflow(u128),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Validator {
    pub address: Address,
    pub voting_power: u64,
    proposer_priority: i128,
}

impl Validator {
    pub const fn new(address: Address, voting_power: u64) -> Self {
        Self {
            address,
            voting_power,
            proposer_priority: 0,
        }
    }

    pub const fn proposer_priority(&self) -> i128 {
        self.proposer_priority
    }
}

/// Deterministically ordered validator set.
///
/// Validators are sorted by descending voting power with the address as a
/// tiebreak, and keep a signed priority accumulator that rotates the proposer
/// proportionally to voting power. Priorities stay centered on zero and within
/// a `2 * total_power` window; all arithmetic fits comfortably in `i128`
/// because the total power is capped at 63 bits on construction.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: u64,
    proposer: usize,
}

impl ValidatorSet {
    /// Build a set from unordered validators. Fails on duplicates, an empty
    /// set, or a total voting power above `i64::MAX`.
    pub fn new(validators: impl IntoIterator<Item = Validator>) -> Result<Self, ValidatorSetError> {
        let mut validators: Vec<Validator> = validators.into_iter().collect();
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }

        validators.sort_by(|a, b| {
            b.voting_power
                .cmp(&a.voting_power)
                .then_with(|| a.address.cmp(&b.address))
        });
        for pair in validators.windows(2) {
            if pair[0].address == pair[1].address {
                return Err(ValidatorSetError::DuplicateAddress(pair[0].address));
            }
        }

        let total: u128 = validators.iter().map(|v| u128::from(v.voting_power)).sum();
        if total > i64::MAX as u128 {
            return Err(ValidatorSetError::TotalPowerOverflow(total));
        }

        let mut set = Self {
            validators,
            total_voting_power: total as u64,
            proposer: 0,
        };
        set.proposer = set.highest_priority_index();
        Ok(set)
    }

    /// Advance the proposer rotation by `times` rounds.
    pub fn increment_proposer_priority(&mut self, times: Round) {
        for _ in 0..times {
            self.increment_once();
        }
    }

    fn increment_once(&mut self) {
        let total = i128::from(self.total_voting_power);

        for validator in &mut self.validators {
            validator.proposer_priority += i128::from(validator.voting_power);
        }

        self.center_priorities();
        self.scale_priorities(total);

        let proposer = self.highest_priority_index();
        self.validators[proposer].proposer_priority -= total;
        self.proposer = proposer;
    }

    /// Shift priorities so their mean is zero, keeping the accumulated sum
    /// from drifting over many increments. Floored division keeps the
    /// residual non-negative regardless of the sum's sign.
    fn center_priorities(&mut self) {
        let sum: i128 = self.validators.iter().map(|v| v.proposer_priority).sum();
        let mean = sum.div_euclid(self.validators.len() as i128);
        for validator in &mut self.validators {
            validator.proposer_priority -= mean;
        }
    }

    /// Squash priorities by `ceil(spread / (2 * total))` when the min/max
    /// spread leaves the window.
    fn scale_priorities(&mut self, total: i128) {
        let max = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .max()
            .unwrap_or(0);
        let min = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .min()
            .unwrap_or(0);

        let spread = max - min;
        let window = PRIORITY_WINDOW_SIZE_FACTOR * total;
        if window > 0 && spread > window {
            let divisor = (spread + window - 1) / window;
            for validator in &mut self.validators {
                validator.proposer_priority /= divisor;
            }
        }
    }

    fn highest_priority_index(&self) -> usize {
        let mut best = 0;
        for (i, validator) in self.validators.iter().enumerate().skip(1) {
            let current = &self.validators[best];
            if validator.proposer_priority > current.proposer_priority
                || (validator.proposer_priority == current.proposer_priority
                    && validator.address < current.address)
            {
                best = i;
            }
        }
        best
    }

    /// The validator selected by the last increment, or the seeded proposer
    /// for a fresh set.
    pub fn proposer(&self) -> &Validator {
        &self.validators[self.proposer]
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators.iter().position(|v| v.address == *address)
    }

    pub fn voting_power_of(&self, address: &Address) -> u64 {
        self.index_of(address)
            .map_or(0, |i| self.validators[i].voting_power)
    }

    pub fn get(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub const fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    /// Strictly-greater-than-two-thirds test on accumulated voting power.
    pub fn has_two_thirds(&self, power: u64) -> bool {
        3 * u128::from(power) > 2 * u128::from(self.total_voting_power)
    }
}
