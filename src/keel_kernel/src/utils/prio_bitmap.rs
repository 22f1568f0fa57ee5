//! Priority-active bitmap with constant-time bit scan.
use super::Init;

/// One bit per priority level; bit `i` set iff ready list `i` is non-empty.
///
/// Priority 0 maps to bit 0, so the highest-priority non-empty level is the
/// lowest set bit, found with a single count-trailing-zeros (the same
/// instruction a CLZ-based search uses under the inverted mapping).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PrioBitmap {
    bits: u64,
}

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl PrioBitmap {
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < u64::BITS as usize);
        self.bits & (1 << i) != 0
    }

    pub fn set(&mut self, i: usize) {
        debug_assert!(i < u64::BITS as usize);
        self.bits |= 1 << i;
    }

    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < u64::BITS as usize);
        self.bits &= !(1 << i);
    }

    /// Position of the lowest set bit, i.e. the highest active priority.
    pub fn find_first_set(&self) -> Option<usize> {
        match self.bits.trailing_zeros() {
            64 => None,
            i => Some(i as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    #[quickcheck]
    fn matches_btreeset_model(ops: Vec<(bool, u8)>) {
        let mut subject = PrioBitmap::INIT;
        let mut model = BTreeSet::new();

        for (insert, bit) in ops {
            let bit = bit as usize % 64;
            if insert {
                subject.set(bit);
                model.insert(bit);
            } else {
                subject.clear(bit);
                model.remove(&bit);
            }
            assert_eq!(subject.find_first_set(), model.iter().next().copied());
        }

        for i in 0..64 {
            assert_eq!(subject.get(i), model.contains(&i));
        }
    }

    #[test]
    fn empty_scan() {
        assert_eq!(PrioBitmap::INIT.find_first_set(), None);
    }
}
