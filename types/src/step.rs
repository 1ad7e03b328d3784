//! Round steps as they appear on the wire and in the state machine.

/// Phase within a consensus round. The numbering is part of the wire format
/// (`NewRoundStep` messages) and must not change.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum RoundStep {
    NewHeight = 1,
    NewRound = 2,
    Propose = 3,
    Prevote = 4,
    PrevoteWait = 5,
    Precommit = 6,
    PrecommitWait = 7,
    Commit = 8,
}

impl RoundStep {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::NewHeight),
            2 => Some(Self::NewRound),
            3 => Some(Self::Propose),
            4 => Some(Self::Prevote),
            5 => Some(Self::PrevoteWait),
            6 => Some(Self::Precommit),
            7 => Some(Self::PrecommitWait),
            8 => Some(Self::Commit),
            _ => None,
        }
    }
}

impl core::fmt::Display for RoundStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::NewHeight => "NewHeight",
            Self::NewRound => "NewRound",
            Self::Propose => "Propose",
            Self::Prevote => "Prevote",
            Self::PrevoteWait => "PrevoteWait",
            Self::Precommit => "Precommit",
            Self::PrecommitWait => "PrecommitWait",
            Self::Commit => "Commit",
        };
        f.write_str(name)
    }
}
