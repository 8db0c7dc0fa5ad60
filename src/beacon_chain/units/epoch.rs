use std::{fmt::Display, ops::Add};

use super::Slot;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialOrd, PartialEq)]
pub struct Epoch(pub i64);

impl Epoch {
    pub fn first_slot(&self) -> Slot {
        Slot(self.0 * Slot::SLOTS_PER_EPOCH)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<i64> for Epoch {
    type Output = Self;

    fn add(self, rhs: i64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_slot_test() {
        assert_eq!(Epoch(0).first_slot(), Slot(0));
        assert_eq!(Epoch(205987).first_slot(), Slot(6591584));
        assert_eq!(Epoch(205987).first_slot().epoch(), Epoch(205987));
    }
}
