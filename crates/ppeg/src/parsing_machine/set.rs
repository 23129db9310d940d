use std::ops::{BitAnd, BitOr, Not, Sub};

/// Set of byte values, used by charset patterns and set instructions
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Set {
    // 32 * 8 = 256 bits
    inner: [u32; 8],
}

impl Set {
    pub fn any() -> Set {
        Set {
            inner: [u32::MAX; 8],
        }
    }

    pub fn new() -> Set {
        Set { inner: [0u32; 8] }
    }

    pub fn from_bytes(bytes: &[u8]) -> Set {
        let mut set = Set::new();
        for b in bytes {
            set.add(*b);
        }
        set
    }

    /// Inclusive range
    pub fn range(a: u8, b: u8) -> Set {
        let mut set = Set::new();
        for n in a..=b {
            set.add(n);
        }
        set
    }

    pub fn add(&mut self, n: u8) {
        let num = (n / 32) as usize;
        let pos = n % 32;
        let shifted = 1 << pos;
        self.inner[num] |= shifted;
    }

    pub fn has(&self, n: u8) -> bool {
        let num = (n / 32) as usize;
        let pos = n % 32;
        let shifted = 1 << pos;
        self.inner[num] & shifted != 0
    }

    pub fn len(&self) -> usize {
        self.inner.iter().map(|n| n.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.iter().all(|n| *n == 0)
    }

    pub fn is_disjoint(&self, other: &Set) -> bool {
        self.inner
            .iter()
            .zip(other.inner.iter())
            .all(|(a, b)| a & b == 0)
    }

    /// Returns the only member if the set has exactly one
    pub fn single(&self) -> Option<u8> {
        if self.len() != 1 {
            return None;
        }

        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(|n| self.has(*n))
    }

    fn zip_with(&self, other: &Set, f: impl Fn(u32, u32) -> u32) -> Set {
        let mut inner = [0u32; 8];
        for (i, word) in inner.iter_mut().enumerate() {
            *word = f(self.inner[i], other.inner[i]);
        }
        Set { inner }
    }
}

impl BitOr for Set {
    type Output = Set;

    fn bitor(self, rhs: Set) -> Set {
        self.zip_with(&rhs, |a, b| a | b)
    }
}

impl BitAnd for Set {
    type Output = Set;

    fn bitand(self, rhs: Set) -> Set {
        self.zip_with(&rhs, |a, b| a & b)
    }
}

impl Sub for Set {
    type Output = Set;

    fn sub(self, rhs: Set) -> Set {
        self.zip_with(&rhs, |a, b| a & !b)
    }
}

impl Not for Set {
    type Output = Set;

    fn not(self) -> Set {
        Set::any() - self
    }
}

impl std::fmt::Debug for Set {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        let mut first = true;
        let mut i = 0u16;
        while i <= 255 {
            if !self.has(i as u8) {
                i += 1;
                continue;
            }

            // Collapse runs into ranges
            let start = i;
            while i < 255 && self.has(i as u8 + 1) {
                i += 1;
            }

            if !first {
                f.write_str(", ")?;
            }

            if start == i {
                write!(f, "{}", (start as u8).escape_ascii())?;
            } else {
                write!(f, "{}-{}", (start as u8).escape_ascii(), (i as u8).escape_ascii())?;
            }

            first = false;
            i += 1;
        }
        f.write_str("]")
    }
}
