//! Hierarchical item identifiers.
//!
//! Every id embeds its parent: `child = parent * 1000 + seq` with `seq` in
//! `1..=999`. An item's list is `oid / 1000` and the list's category is a
//! further division.

pub type CategoryId = u64;
pub type ListId = u64;
pub type ItemId = u64;

pub const FANOUT: u64 = 1000;
pub const MAX_SEQ: u64 = FANOUT - 1;
/// Largest id the stores can hold; sqlite keys are signed 64-bit.
pub const MAX_ID: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdTier {
    Category,
    List,
    Item,
}

pub fn parent_of(id: u64) -> u64 {
    id / FANOUT
}

pub fn seq_of(id: u64) -> u64 {
    id % FANOUT
}

pub fn child_id(parent: u64, seq: u64) -> u64 {
    parent * FANOUT + seq
}

/// Next free child id after `last_child`, or `None` once the parent's
/// sequence space is used up.
pub fn next_child_id(parent: u64, last_child: Option<u64>) -> Option<u64> {
    let seq = last_child.map(|c| seq_of(c) + 1).unwrap_or(1);
    if seq > MAX_SEQ {
        return None;
    }
    Some(child_id(parent, seq))
}

pub fn tier_of(id: u64) -> Option<IdTier> {
    match id {
        0 => None,
        1..=999 => Some(IdTier::Category),
        1_000..=999_999 => Some(IdTier::List),
        _ if id > MAX_ID => None,
        _ => Some(IdTier::Item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_resolves_to_list_and_category() {
        let oid = 1_001_001;
        assert_eq!(parent_of(oid), 1_001);
        assert_eq!(parent_of(parent_of(oid)), 1);
        assert_eq!(tier_of(oid), Some(IdTier::Item));
        assert_eq!(tier_of(1_001), Some(IdTier::List));
        assert_eq!(tier_of(7), Some(IdTier::Category));
        assert_eq!(tier_of(0), None);
        assert_eq!(tier_of(MAX_ID), Some(IdTier::Item));
        assert_eq!(tier_of(MAX_ID + 1), None);
    }

    #[test]
    fn next_child_continues_after_last_sequence() {
        assert_eq!(next_child_id(1_001, None), Some(1_001_001));
        assert_eq!(next_child_id(1_001, Some(1_001_041)), Some(1_001_042));
        assert_eq!(next_child_id(2, Some(2_999)), None);
    }
}
