// ThinLisp Store - Non-Volatile Block Memory
//
// External memory reachable through `is_ptr` cells, plus a best-fit block
// store for persisting flattened trees.

use crate::arena::Bistack;
use crate::cell::{self, CellHeader, ADDRESS_LEN};
use crate::error::Fault;
use crate::types::{CellRef, Space};
use thiserror::Error;
use tracing::debug;

pub const MAGIC: &[u8; 8] = b"slimlisp";
pub const BLOCK_HEADER_LEN: u16 = 2;
pub const MIN_STORE_SIZE: usize = 16;
pub const MAX_STORE_SIZE: usize = 0x8000;
const FREE_BIT: u16 = 0x8000;
const SIZE_MASK: u16 = 0x7fff;
/// Smallest remainder worth splitting off as its own free block.
const MIN_SPLIT: u16 = BLOCK_HEADER_LEN + 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("out of space: {requested} bytes requested, largest free block holds {largest}")]
    OutOfSpace { requested: usize, largest: u16 },
    #[error("no allocated block at {0:#06x}")]
    BadAddress(u16),
    #[error("address {0:#06x} is not mapped")]
    Unmapped(u16),
    #[error("{0} bytes do not fit in any block")]
    TooLarge(usize),
    #[error("store size {0} outside {MIN_STORE_SIZE}..={MAX_STORE_SIZE}")]
    InvalidSize(usize),
    #[error("image has no valid header")]
    Unformatted,
}

/// Read-only view of memory outside the arena.
pub trait ExternalMemory {
    fn read(&self, addr: u16, out: &mut [u8]) -> Result<(), StoreError>;
}

/// No external memory: every address is unmapped.
impl ExternalMemory for () {
    fn read(&self, addr: u16, _out: &mut [u8]) -> Result<(), StoreError> {
        Err(StoreError::Unmapped(addr))
    }
}

/// A block allocator over external memory.
pub trait BlockStore: ExternalMemory {
    /// Copy `bytes` into a fresh block and return the block address.
    fn save(&mut self, bytes: &[u8]) -> Result<u16, StoreError>;
    /// Copy a block's data into `out`; returns the block's data capacity.
    fn load(&self, block: u16, out: &mut [u8]) -> Result<usize, StoreError>;
    fn free(&mut self, block: u16) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub address: u16,
    /// Data capacity, header excluded.
    pub capacity: u16,
    pub free: bool,
}

impl BlockInfo {
    pub fn data(&self) -> u16 {
        self.address + BLOCK_HEADER_LEN
    }

    fn size(&self) -> u16 {
        self.capacity + BLOCK_HEADER_LEN
    }
}

/// In-memory non-volatile image: magic word, then a chain of blocks.
pub struct NvMem {
    image: Box<[u8]>,
}

pub struct Blocks<'a> {
    image: &'a [u8],
    at: usize,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.at + BLOCK_HEADER_LEN as usize > self.image.len() {
            return None;
        }
        let word = u16::from_le_bytes([self.image[self.at], self.image[self.at + 1]]);
        let size = word & SIZE_MASK;
        if size < BLOCK_HEADER_LEN || self.at + size as usize > self.image.len() {
            return None;
        }
        let info = BlockInfo {
            address: self.at as u16,
            capacity: size - BLOCK_HEADER_LEN,
            free: word & FREE_BIT != 0,
        };
        self.at += size as usize;
        Some(info)
    }
}

impl NvMem {
    /// A formatted image of `size` bytes holding one free block.
    pub fn new(size: usize) -> Result<Self, StoreError> {
        if !(MIN_STORE_SIZE..=MAX_STORE_SIZE).contains(&size) {
            return Err(StoreError::InvalidSize(size));
        }
        let mut mem = Self {
            image: vec![0u8; size & !1].into_boxed_slice(),
        };
        mem.format();
        Ok(mem)
    }

    /// Adopt an existing image, checking its magic word.
    pub fn from_image(image: Vec<u8>) -> Result<Self, StoreError> {
        if !(MIN_STORE_SIZE..=MAX_STORE_SIZE).contains(&image.len()) {
            return Err(StoreError::InvalidSize(image.len()));
        }
        if &image[..MAGIC.len()] != MAGIC {
            return Err(StoreError::Unformatted);
        }
        Ok(Self {
            image: image.into_boxed_slice(),
        })
    }

    pub fn format(&mut self) {
        self.image.fill(0);
        self.image[..MAGIC.len()].copy_from_slice(MAGIC);
        let size = (self.image.len() - MAGIC.len()) as u16;
        self.write_header(MAGIC.len() as u16, size, true);
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            image: &self.image,
            at: MAGIC.len(),
        }
    }

    /// Total data capacity of all free blocks.
    pub fn free_space(&self) -> usize {
        self.blocks().filter(|b| b.free).map(|b| b.capacity as usize).sum()
    }

    fn write_header(&mut self, at: u16, size: u16, free: bool) {
        let word = (size & SIZE_MASK) | if free { FREE_BIT } else { 0 };
        let at = at as usize;
        self.image[at..at + 2].copy_from_slice(&word.to_le_bytes());
    }

    fn find(&self, block: u16) -> Result<BlockInfo, StoreError> {
        self.blocks()
            .find(|b| b.address == block && !b.free)
            .ok_or(StoreError::BadAddress(block))
    }
}

impl ExternalMemory for NvMem {
    fn read(&self, addr: u16, out: &mut [u8]) -> Result<(), StoreError> {
        let start = addr as usize;
        let end = start + out.len();
        if start < MAGIC.len() || end > self.image.len() {
            return Err(StoreError::Unmapped(addr));
        }
        out.copy_from_slice(&self.image[start..end]);
        Ok(())
    }
}

impl BlockStore for NvMem {
    fn save(&mut self, bytes: &[u8]) -> Result<u16, StoreError> {
        let padded = bytes.len() + (bytes.len() & 1);
        if padded + BLOCK_HEADER_LEN as usize > SIZE_MASK as usize {
            return Err(StoreError::TooLarge(bytes.len()));
        }
        let need = padded as u16 + BLOCK_HEADER_LEN;
        let best = self
            .blocks()
            .filter(|b| b.free && b.size() >= need)
            .min_by_key(|b| b.size())
            .ok_or_else(|| StoreError::OutOfSpace {
                requested: bytes.len(),
                largest: self.blocks().filter(|b| b.free).map(|b| b.capacity).max().unwrap_or(0),
            })?;
        let remainder = best.size() - need;
        if remainder >= MIN_SPLIT {
            self.write_header(best.address, need, false);
            self.write_header(best.address + need, remainder, true);
        } else {
            self.write_header(best.address, best.size(), false);
        }
        let data = best.data() as usize;
        self.image[data..data + bytes.len()].copy_from_slice(bytes);
        debug!(block = best.address, len = bytes.len(), "saved block");
        Ok(best.address)
    }

    fn load(&self, block: u16, out: &mut [u8]) -> Result<usize, StoreError> {
        let info = self.find(block)?;
        let n = out.len().min(info.capacity as usize);
        let data = info.data() as usize;
        out[..n].copy_from_slice(&self.image[data..data + n]);
        Ok(info.capacity as usize)
    }

    fn free(&mut self, block: u16) -> Result<(), StoreError> {
        let info = self.find(block)?;
        let mut start = info.address;
        let mut size = info.size();
        // join with a free neighbour on either side
        let mut prev: Option<BlockInfo> = None;
        for b in self.blocks() {
            if b.address == info.address {
                break;
            }
            prev = Some(b);
        }
        if let Some(p) = prev.filter(|p| p.free) {
            start = p.address;
            size += p.size();
        }
        if let Some(next) = self.blocks().find(|b| b.address == info.address + info.size()) {
            if next.free {
                size += next.size();
            }
        }
        self.write_header(start, size, true);
        debug!(block, "freed block");
        Ok(())
    }
}

/// Save the flattened subtree at `at` into `store`; returns the block.
pub fn persist<S: BlockStore>(arena: &mut Bistack, store: &mut S, at: CellRef) -> Result<u16, Fault> {
    if at.space != Space::Arena {
        return Err(StoreError::BadAddress(at.offset).into());
    }
    let len = cell::subtree_len(arena, &*store, at)?;
    let bytes = arena.bytes(at.offset, len)?;
    Ok(store.save(bytes)?)
}

/// Write an `is_ptr` cell into the forward region that refers to the
/// value stored in `block`. Integers are copied inline.
pub fn attach(arena: &mut Bistack, store: &dyn ExternalMemory, block: u16) -> Result<CellRef, Fault> {
    let root = CellRef::store(block + BLOCK_HEADER_LEN);
    let header = cell::load(arena, store, root)?;
    let linked = match header {
        CellHeader::Integer { .. } => None,
        CellHeader::Symbol {
            len,
            prefix,
            quoted,
            hash,
            ..
        } => Some(CellHeader::Symbol {
            len,
            prefix,
            quoted,
            is_ptr: true,
            hash,
        }),
        CellHeader::List { count, prefix, .. } => Some(CellHeader::List {
            count,
            prefix,
            is_ptr: true,
        }),
    };
    let Some(linked) = linked else {
        let span = arena.alloc_forward(header.footprint() as usize)?;
        cell::store_header(arena, span.offset, &header)?;
        return Ok(CellRef::arena(span.offset));
    };
    let target = cell::body(arena, store, root, &header)?;
    let span = arena.alloc_forward((linked.header_len() + ADDRESS_LEN) as usize)?;
    cell::store_header(arena, span.offset, &linked)?;
    arena.write_u16(span.offset + linked.header_len(), target.offset)?;
    Ok(CellRef::arena(span.offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        let mem = NvMem::new(64).unwrap();
        assert_eq!(&mem.image()[..8], MAGIC);
        let blocks: Vec<_> = mem.blocks().collect();
        assert_eq!(
            blocks,
            vec![BlockInfo {
                address: 8,
                capacity: 54,
                free: true
            }]
        );
        assert!(NvMem::from_image(vec![0; 64]).is_err());
        assert!(NvMem::from_image(mem.image().to_vec()).is_ok());
    }

    #[test]
    fn test_save_load_free() {
        let mut mem = NvMem::new(64).unwrap();
        let a = mem.save(b"hello").unwrap();
        let b = mem.save(b"world!").unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 16);
        let mut out = [0u8; 6];
        assert_eq!(mem.load(a, &mut out).unwrap(), 6);
        assert_eq!(&out[..5], b"hello");
        mem.free(a).unwrap();
        assert_eq!(mem.load(a, &mut out), Err(StoreError::BadAddress(a)));
        assert_eq!(mem.free(a), Err(StoreError::BadAddress(a)));
        mem.free(b).unwrap();
        // everything coalesces back into one block
        assert_eq!(mem.blocks().count(), 1);
        assert_eq!(mem.free_space(), 54);
    }

    #[test]
    fn test_best_fit() {
        let mut mem = NvMem::new(128).unwrap();
        let big = mem.save(&[1; 20]).unwrap();
        let _keep = mem.save(&[2; 2]).unwrap();
        let small = mem.save(&[3; 4]).unwrap();
        let _keep2 = mem.save(&[4; 2]).unwrap();
        mem.free(big).unwrap();
        mem.free(small).unwrap();
        // the 4-byte hole fits better than the 20-byte one
        assert_eq!(mem.save(&[5; 3]).unwrap(), small);
    }

    #[test]
    fn test_out_of_space() {
        let mut mem = NvMem::new(32).unwrap();
        let err = mem.save(&[0; 40]).unwrap_err();
        assert_eq!(err, StoreError::OutOfSpace { requested: 40, largest: 22 });
    }

    #[test]
    fn test_unit_memory_is_unmapped() {
        let mut out = [0u8; 1];
        assert_eq!(().read(5, &mut out), Err(StoreError::Unmapped(5)));
    }

    #[test]
    fn test_attach_integer_copies() {
        let mut arena = Bistack::new(128).unwrap();
        let mut mem = NvMem::new(64).unwrap();
        let (bytes, len) = CellHeader::Integer { value: -42 }.encode();
        let block = mem.save(&bytes[..len]).unwrap();
        let at = attach(&mut arena, &mem, block).unwrap();
        assert_eq!(cell::load(&arena, &mem, at).unwrap(), CellHeader::Integer { value: -42 });
    }
}
