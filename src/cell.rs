// ThinLisp Cells - Bit-Packed Encoding
//
// Symbols, integers and lists flattened in pre-order: a list header is
// followed directly by its children, so the tree shape lives entirely in
// the per-list child counts.

use crate::arena::{ArenaError, Bistack, Direction, Mark};
use crate::error::Fault;
use crate::store::ExternalMemory;
use crate::types::{CellRef, Space};
use std::cmp::Ordering;

pub const TAG_SYMBOL: u8 = 1;
pub const TAG_INTEGER: u8 = 2;
pub const TAG_LIST: u8 = 3;

pub const SYMBOL_HEADER_LEN: u16 = 3;
pub const INTEGER_LEN: u16 = 4;
pub const LIST_HEADER_LEN: u16 = 2;
/// Size of an external address following an `is_ptr` header.
pub const ADDRESS_LEN: u16 = 2;

pub const MAX_SYMBOL_LEN: usize = 63;
pub const MAX_LIST_LEN: u16 = 511;
pub const MAX_MAGNITUDE: u32 = (1 << 29) - 1;
/// Nesting limit for every counter-stack walk.
pub const MAX_WALK_DEPTH: u8 = 32;

/// Reader-macro decoration carried in a cell header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Prefix {
    #[default]
    None = 0,
    Quote = 1,
    Quasiquote = 2,
    Unquote = 3,
    UnquoteSplicing = 4,
    Sharp = 5,
    SharpQuote = 6,
    At = 7,
    Ampersand = 8,
    /// `+(` only; a sign before a symbol is part of its text.
    Plus = 9,
    Minus = 10,
}

impl Prefix {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Prefix::None,
            1 => Prefix::Quote,
            2 => Prefix::Quasiquote,
            3 => Prefix::Unquote,
            4 => Prefix::UnquoteSplicing,
            5 => Prefix::Sharp,
            6 => Prefix::SharpQuote,
            7 => Prefix::At,
            8 => Prefix::Ampersand,
            9 => Prefix::Plus,
            10 => Prefix::Minus,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Prefix introduced by a single leading character.
    pub fn from_char(c: u8) -> Option<Self> {
        match c {
            b'\'' => Some(Prefix::Quote),
            b'`' => Some(Prefix::Quasiquote),
            b',' => Some(Prefix::Unquote),
            b'#' => Some(Prefix::Sharp),
            b'@' => Some(Prefix::At),
            b'&' => Some(Prefix::Ampersand),
            _ => None,
        }
    }

    /// The two-character prefixes: `,@` and `#'`.
    pub fn combine(self, c: u8) -> Option<Self> {
        match (self, c) {
            (Prefix::None, c) => Prefix::from_char(c),
            (Prefix::Unquote, b'@') => Some(Prefix::UnquoteSplicing),
            (Prefix::Sharp, b'\'') => Some(Prefix::SharpQuote),
            _ => None,
        }
    }

    pub fn text(self) -> &'static [u8] {
        match self {
            Prefix::None => b"",
            Prefix::Quote => b"'",
            Prefix::Quasiquote => b"`",
            Prefix::Unquote => b",",
            Prefix::UnquoteSplicing => b",@",
            Prefix::Sharp => b"#",
            Prefix::SharpQuote => b"#'",
            Prefix::At => b"@",
            Prefix::Ampersand => b"&",
            Prefix::Plus => b"+",
            Prefix::Minus => b"-",
        }
    }

    pub fn is_unquote(self) -> bool {
        matches!(self, Prefix::Unquote | Prefix::UnquoteSplicing)
    }
}

/// Decoded form of a cell header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellHeader {
    Symbol {
        len: u8,
        prefix: Prefix,
        quoted: bool,
        is_ptr: bool,
        hash: u8,
    },
    Integer {
        value: i32,
    },
    List {
        count: u16,
        prefix: Prefix,
        is_ptr: bool,
    },
}

/// Header length implied by the type tag in the first byte.
pub fn header_len_for(first: u8) -> Option<u16> {
    match first & 0b11 {
        TAG_SYMBOL => Some(SYMBOL_HEADER_LEN),
        TAG_INTEGER => Some(INTEGER_LEN),
        TAG_LIST => Some(LIST_HEADER_LEN),
        _ => None,
    }
}

impl CellHeader {
    pub fn tag(&self) -> u8 {
        match self {
            CellHeader::Symbol { .. } => TAG_SYMBOL,
            CellHeader::Integer { .. } => TAG_INTEGER,
            CellHeader::List { .. } => TAG_LIST,
        }
    }

    pub fn header_len(&self) -> u16 {
        match self {
            CellHeader::Symbol { .. } => SYMBOL_HEADER_LEN,
            CellHeader::Integer { .. } => INTEGER_LEN,
            CellHeader::List { .. } => LIST_HEADER_LEN,
        }
    }

    /// Bytes owned by this cell alone. Children of an inline list are not
    /// counted.
    pub fn footprint(&self) -> u16 {
        match *self {
            CellHeader::Symbol { is_ptr: true, .. } => SYMBOL_HEADER_LEN + ADDRESS_LEN,
            CellHeader::Symbol { len, .. } => SYMBOL_HEADER_LEN + len as u16,
            CellHeader::Integer { .. } => INTEGER_LEN,
            CellHeader::List { is_ptr: true, .. } => LIST_HEADER_LEN + ADDRESS_LEN,
            CellHeader::List { .. } => LIST_HEADER_LEN,
        }
    }

    pub fn is_ptr(&self) -> bool {
        matches!(
            self,
            CellHeader::Symbol { is_ptr: true, .. } | CellHeader::List { is_ptr: true, .. }
        )
    }

    pub fn encode(&self) -> ([u8; 4], usize) {
        let mut out = [0u8; 4];
        match *self {
            CellHeader::Symbol {
                len,
                prefix,
                quoted,
                is_ptr,
                hash,
            } => {
                let word = TAG_SYMBOL as u16
                    | ((len as u16 & 0x3f) << 2)
                    | ((prefix.code() as u16) << 8)
                    | ((is_ptr as u16) << 12)
                    | ((quoted as u16) << 13);
                out[..2].copy_from_slice(&word.to_le_bytes());
                out[2] = hash;
                (out, SYMBOL_HEADER_LEN as usize)
            }
            CellHeader::Integer { value } => {
                let magnitude = value.unsigned_abs().min(MAX_MAGNITUDE);
                let high = TAG_INTEGER as u16 | (((value < 0) as u16) << 2) | (((magnitude >> 16) as u16) << 3);
                out[..2].copy_from_slice(&high.to_le_bytes());
                out[2..].copy_from_slice(&(magnitude as u16).to_le_bytes());
                (out, INTEGER_LEN as usize)
            }
            CellHeader::List {
                count,
                prefix,
                is_ptr,
            } => {
                let word = TAG_LIST as u16
                    | ((prefix.code() as u16 & 0xf) << 2)
                    | ((is_ptr as u16) << 6)
                    | ((count & MAX_LIST_LEN) << 7);
                out[..2].copy_from_slice(&word.to_le_bytes());
                (out, LIST_HEADER_LEN as usize)
            }
        }
    }

    /// Decode a header from at least `header_len_for(bytes[0])` bytes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let len = header_len_for(*bytes.first()?)? as usize;
        if bytes.len() < len {
            return None;
        }
        let word = u16::from_le_bytes([bytes[0], bytes[1]]);
        match bytes[0] & 0b11 {
            TAG_SYMBOL => Some(CellHeader::Symbol {
                len: ((word >> 2) & 0x3f) as u8,
                prefix: Prefix::from_code(((word >> 8) & 0xf) as u8)?,
                is_ptr: word & (1 << 12) != 0,
                quoted: word & (1 << 13) != 0,
                hash: bytes[2],
            }),
            TAG_INTEGER => {
                let low = u16::from_le_bytes([bytes[2], bytes[3]]) as u32;
                let magnitude = (((word >> 3) as u32) << 16) | low;
                let value = magnitude as i32;
                Some(CellHeader::Integer {
                    value: if word & 0b100 != 0 { -value } else { value },
                })
            }
            TAG_LIST => Some(CellHeader::List {
                count: word >> 7,
                prefix: Prefix::from_code(((word >> 2) & 0xf) as u8)?,
                is_ptr: word & (1 << 6) != 0,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// Hashing
// ============================================================================

pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |h, &b| (h ^ b as u32).wrapping_mul(0x0100_0193))
}

/// 16-bit fold of the FNV-1a hash, usable as a symbol-table key.
pub fn key16(bytes: &[u8]) -> u16 {
    let h = fnv1a(bytes);
    ((h >> 16) ^ (h & 0xffff)) as u16
}

/// 8-bit hash stored in symbol headers.
pub fn symbol_hash(bytes: &[u8]) -> u8 {
    let k = key16(bytes);
    ((k >> 8) ^ (k & 0xff)) as u8
}

// ============================================================================
// Access across spaces
// ============================================================================

fn dangling(at: CellRef, len: u16) -> Fault {
    Fault::Arena(ArenaError::Dangling {
        offset: at.offset,
        len,
    })
}

pub(crate) fn step(at: CellRef, n: u16) -> Result<CellRef, Fault> {
    at.step(n).ok_or_else(|| dangling(at, n))
}

/// Copy `out.len()` bytes starting at `at`.
pub fn fetch(arena: &Bistack, external: &dyn ExternalMemory, at: CellRef, out: &mut [u8]) -> Result<(), Fault> {
    match at.space {
        Space::Arena => {
            out.copy_from_slice(arena.bytes(at.offset, out.len() as u16)?);
            Ok(())
        }
        Space::Store => Ok(external.read(at.offset, out)?),
    }
}

pub fn load(arena: &Bistack, external: &dyn ExternalMemory, at: CellRef) -> Result<CellHeader, Fault> {
    let mut buf = [0u8; 4];
    fetch(arena, external, at, &mut buf[..1])?;
    let len = header_len_for(buf[0]).ok_or(Fault::CorruptCell { at, byte: buf[0] })?;
    fetch(arena, external, at, &mut buf[..len as usize])?;
    CellHeader::decode(&buf[..len as usize]).ok_or(Fault::CorruptCell { at, byte: buf[0] })
}

/// Write `header` into the arena at `offset`.
pub fn store_header(arena: &mut Bistack, offset: u16, header: &CellHeader) -> Result<(), ArenaError> {
    let (bytes, len) = header.encode();
    arena.bytes_mut(offset, len as u16)?.copy_from_slice(&bytes[..len]);
    Ok(())
}

/// Where the body of a cell lives: right after its header, or behind
/// its external address.
pub fn body(arena: &Bistack, external: &dyn ExternalMemory, at: CellRef, header: &CellHeader) -> Result<CellRef, Fault> {
    let after = step(at, header.header_len())?;
    if header.is_ptr() {
        let mut addr = [0u8; 2];
        fetch(arena, external, after, &mut addr)?;
        Ok(CellRef::store(u16::from_le_bytes(addr)))
    } else {
        Ok(after)
    }
}

/// Characters of the symbol at `at`, copied into `buf`.
pub fn symbol_text<'b>(
    arena: &Bistack,
    external: &dyn ExternalMemory,
    at: CellRef,
    buf: &'b mut [u8; MAX_SYMBOL_LEN],
) -> Result<&'b [u8], Fault> {
    let header = load(arena, external, at)?;
    let CellHeader::Symbol { len, .. } = header else {
        return Err(Fault::CorruptCell { at, byte: header.tag() });
    };
    let chars = body(arena, external, at, &header)?;
    let out = &mut buf[..len as usize];
    fetch(arena, external, chars, out)?;
    Ok(out)
}

// ============================================================================
// Counter stack
// ============================================================================

const FRAME_LEN: u16 = 14;

/// One open list per frame. The second counter and resume slot are used
/// only by lockstep walks over two trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Frame {
    remaining: [u16; 2],
    mark: u16,
    below: u16,
    resume: [Option<CellRef>; 2],
}

impl Frame {
    fn encode(&self) -> [u8; FRAME_LEN as usize] {
        let mut out = [0u8; FRAME_LEN as usize];
        out[0..2].copy_from_slice(&self.remaining[0].to_le_bytes());
        out[2..4].copy_from_slice(&self.remaining[1].to_le_bytes());
        out[4..6].copy_from_slice(&self.mark.to_le_bytes());
        out[6..8].copy_from_slice(&self.below.to_le_bytes());
        out[8..11].copy_from_slice(&CellRef::encode(self.resume[0]));
        out[11..14].copy_from_slice(&CellRef::encode(self.resume[1]));
        out
    }

    fn decode(b: &[u8], at: u16) -> Result<Self, Fault> {
        let word = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let slot = |i: usize| CellRef::decode([b[i], b[i + 1], b[i + 2]]).ok_or(Fault::CorruptContext(at));
        Ok(Self {
            remaining: [word(0), word(2)],
            mark: word(4),
            below: word(6),
            resume: [slot(8)?, slot(11)?],
        })
    }
}

/// Explicit stack of open-list counters kept in the backward region.
pub(crate) struct CounterStack {
    top: u16,
    depth: u8,
    limit: u8,
}

impl CounterStack {
    pub(crate) fn new(limit: u8) -> Self {
        Self { top: 0, depth: 0, limit }
    }

    fn push(&mut self, arena: &mut Bistack, remaining: [u16; 2], resume: [Option<CellRef>; 2]) -> Result<(), Fault> {
        if self.depth >= self.limit {
            return Err(Fault::DepthExceeded(self.limit));
        }
        let mark = arena.mark_backward()?.into_raw();
        let span = arena.alloc_backward(FRAME_LEN as usize)?;
        let frame = Frame {
            remaining,
            mark,
            below: self.top,
            resume,
        };
        arena.bytes_mut(span.offset, FRAME_LEN)?.copy_from_slice(&frame.encode());
        self.top = span.offset;
        self.depth += 1;
        Ok(())
    }

    fn peek(&self, arena: &Bistack) -> Result<Option<Frame>, Fault> {
        if self.top == 0 {
            return Ok(None);
        }
        Frame::decode(arena.bytes(self.top, FRAME_LEN)?, self.top).map(Some)
    }

    fn put(&self, arena: &mut Bistack, frame: &Frame) -> Result<(), Fault> {
        arena.bytes_mut(self.top, FRAME_LEN)?.copy_from_slice(&frame.encode());
        Ok(())
    }

    fn pop(&mut self, arena: &mut Bistack, frame: &Frame) -> Result<(), Fault> {
        arena.rewind(Mark::from_raw(Direction::Backward, frame.mark))?;
        self.top = frame.below;
        self.depth -= 1;
        Ok(())
    }
}

// ============================================================================
// Walks
// ============================================================================

/// Visit every cell of the subtree at `at` in pre-order and return the
/// position just past it. `is_ptr` cells are visited but not entered.
pub fn walk<F>(arena: &mut Bistack, external: &dyn ExternalMemory, at: CellRef, mut visit: F) -> Result<CellRef, Fault>
where
    F: FnMut(CellRef, &CellHeader, u8) -> Result<(), Fault>,
{
    arena.scope_backward(|arena| -> Result<CellRef, Fault> {
        let mut stack = CounterStack::new(MAX_WALK_DEPTH);
        let mut pos = at;
        loop {
            let header = load(arena, external, pos)?;
            visit(pos, &header, stack.depth)?;
            pos = step(pos, header.footprint())?;
            if let CellHeader::List {
                count,
                is_ptr: false,
                ..
            } = header
            {
                if count > 0 {
                    stack.push(arena, [count, 0], [None, None])?;
                    continue;
                }
            }
            loop {
                let Some(mut frame) = stack.peek(arena)? else {
                    return Ok(pos);
                };
                frame.remaining[0] -= 1;
                if frame.remaining[0] > 0 {
                    stack.put(arena, &frame)?;
                    break;
                }
                stack.pop(arena, &frame)?;
            }
        }
    })
}

/// Position immediately after the complete value at `at`.
pub fn advance(arena: &mut Bistack, external: &dyn ExternalMemory, at: CellRef) -> Result<CellRef, Fault> {
    walk(arena, external, at, |_, _, _| Ok(()))
}

/// Encoded byte length of the subtree at `at`.
pub fn subtree_len(arena: &mut Bistack, external: &dyn ExternalMemory, at: CellRef) -> Result<u16, Fault> {
    Ok(advance(arena, external, at)?.offset - at.offset)
}

/// Number of cells in the subtree at `at`, the root included.
pub fn count_cells(arena: &mut Bistack, external: &dyn ExternalMemory, at: CellRef) -> Result<usize, Fault> {
    let mut n = 0;
    walk(arena, external, at, |_, _, _| {
        n += 1;
        Ok(())
    })?;
    Ok(n)
}

fn compare_symbols(
    arena: &Bistack,
    external: &dyn ExternalMemory,
    a: CellRef,
    b: CellRef,
) -> Result<Ordering, Fault> {
    let (ha, hb) = (load(arena, external, a)?, load(arena, external, b)?);
    let (
        CellHeader::Symbol {
            prefix: pa,
            quoted: qa,
            ..
        },
        CellHeader::Symbol {
            prefix: pb,
            quoted: qb,
            ..
        },
    ) = (ha, hb)
    else {
        return Err(Fault::CorruptCell { at: a, byte: ha.tag() });
    };
    let mut buf_a = [0u8; MAX_SYMBOL_LEN];
    let mut buf_b = [0u8; MAX_SYMBOL_LEN];
    let ta = symbol_text(arena, external, a, &mut buf_a)?;
    let tb = symbol_text(arena, external, b, &mut buf_b)?;
    Ok(ta.cmp(tb).then(pa.cmp(&pb)).then(qa.cmp(&qb)))
}

/// Total order over values. Symbols < integers < lists; symbols by
/// characters, then length, prefix and quoting; integers by value; lists
/// by prefix and then element-wise with the shorter list first.
pub fn compare(arena: &mut Bistack, external: &dyn ExternalMemory, a: CellRef, b: CellRef) -> Result<Ordering, Fault> {
    arena.scope_backward(|arena| -> Result<Ordering, Fault> {
        let mut stack = CounterStack::new(MAX_WALK_DEPTH);
        let mut pos = [a, b];
        loop {
            let ha = load(arena, external, pos[0])?;
            let hb = load(arena, external, pos[1])?;
            let by_tag = ha.tag().cmp(&hb.tag());
            if by_tag != Ordering::Equal {
                return Ok(by_tag);
            }
            let next = [step(pos[0], ha.footprint())?, step(pos[1], hb.footprint())?];
            match (ha, hb) {
                (CellHeader::Symbol { .. }, CellHeader::Symbol { .. }) => {
                    let ord = compare_symbols(arena, external, pos[0], pos[1])?;
                    if ord != Ordering::Equal {
                        return Ok(ord);
                    }
                }
                (CellHeader::Integer { value: x }, CellHeader::Integer { value: y }) => {
                    if x != y {
                        return Ok(x.cmp(&y));
                    }
                }
                (
                    CellHeader::List {
                        count: ca,
                        prefix: pa,
                        ..
                    },
                    CellHeader::List {
                        count: cb,
                        prefix: pb,
                        ..
                    },
                ) => {
                    let ord = pa.cmp(&pb);
                    if ord != Ordering::Equal {
                        return Ok(ord);
                    }
                    if ca == 0 || cb == 0 {
                        if ca != cb {
                            return Ok(ca.cmp(&cb));
                        }
                    } else {
                        let resume = [
                            ha.is_ptr().then_some(next[0]),
                            hb.is_ptr().then_some(next[1]),
                        ];
                        stack.push(arena, [ca, cb], resume)?;
                        pos = [
                            body(arena, external, pos[0], &ha)?,
                            body(arena, external, pos[1], &hb)?,
                        ];
                        continue;
                    }
                }
                _ => return Err(Fault::CorruptCell { at: pos[0], byte: ha.tag() }),
            }
            pos = next;
            loop {
                let Some(mut frame) = stack.peek(arena)? else {
                    return Ok(Ordering::Equal);
                };
                frame.remaining[0] -= 1;
                frame.remaining[1] -= 1;
                match (frame.remaining[0] == 0, frame.remaining[1] == 0) {
                    (true, true) => {
                        stack.pop(arena, &frame)?;
                        for (p, resume) in pos.iter_mut().zip(frame.resume) {
                            if let Some(r) = resume {
                                *p = r;
                            }
                        }
                    }
                    (true, false) => return Ok(Ordering::Less),
                    (false, true) => return Ok(Ordering::Greater),
                    (false, false) => {
                        stack.put(arena, &frame)?;
                        break;
                    }
                }
            }
        }
    })
}

pub fn equal(arena: &mut Bistack, external: &dyn ExternalMemory, a: CellRef, b: CellRef) -> Result<bool, Fault> {
    Ok(compare(arena, external, a, b)? == Ordering::Equal)
}
