// ThinLisp Types - Cell Locations
//
// Handles naming where an encoded cell lives.

use std::fmt;

/// Address space a cell lives in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Space {
    /// The forward or backward region of the arena.
    Arena,
    /// External memory reached through an `is_ptr` link.
    Store,
}

/// Location of an encoded cell header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CellRef {
    pub space: Space,
    pub offset: u16,
}

impl CellRef {
    pub const fn arena(offset: u16) -> Self {
        Self {
            space: Space::Arena,
            offset,
        }
    }

    pub const fn store(offset: u16) -> Self {
        Self {
            space: Space::Store,
            offset,
        }
    }

    /// Same space, `delta` bytes further on.
    pub fn step(self, delta: u16) -> Option<Self> {
        self.offset.checked_add(delta).map(|offset| Self { offset, ..self })
    }

    /// Packs into three bytes: space tag (0 = none) then offset.
    pub(crate) fn encode(this: Option<Self>) -> [u8; 3] {
        match this {
            None => [0, 0, 0],
            Some(at) => {
                let tag = match at.space {
                    Space::Arena => 1,
                    Space::Store => 2,
                };
                let [lo, hi] = at.offset.to_le_bytes();
                [tag, lo, hi]
            }
        }
    }

    pub(crate) fn decode(bytes: [u8; 3]) -> Option<Option<Self>> {
        let offset = u16::from_le_bytes([bytes[1], bytes[2]]);
        match bytes[0] {
            0 => Some(None),
            1 => Some(Some(Self::arena(offset))),
            2 => Some(Some(Self::store(offset))),
            _ => None,
        }
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space {
            Space::Arena => write!(f, "arena@{:#06x}", self.offset),
            Space::Store => write!(f, "store@{:#06x}", self.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        for at in [None, Some(CellRef::arena(0x1234)), Some(CellRef::store(7))] {
            assert_eq!(CellRef::decode(CellRef::encode(at)), Some(at));
        }
        assert_eq!(CellRef::decode([9, 0, 0]), None);
    }

    #[test]
    fn test_step_overflow() {
        assert_eq!(CellRef::arena(10).step(3), Some(CellRef::arena(13)));
        assert_eq!(CellRef::store(u16::MAX).step(1), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(CellRef::arena(0x20).to_string(), "arena@0x0020");
        assert_eq!(CellRef::store(0x20).to_string(), "store@0x0020");
    }
}
