// ThinLisp Reader - Incremental S-Expression Parser
//
// Builds flattened cells in the forward region while keeping one packed
// context frame per unfinished value in the backward region, so a read
// can stop whenever input runs dry and pick up again on the next call.

use crate::arena::{ArenaError, Bistack, Direction, Lock, Mark};
use crate::cell::{self, CellHeader, Prefix, INTEGER_LEN, LIST_HEADER_LEN, MAX_LIST_LEN, MAX_MAGNITUDE};
use crate::cell::{MAX_SYMBOL_LEN, MAX_WALK_DEPTH, SYMBOL_HEADER_LEN};
use crate::error::Fault;
use crate::streams::{CharSource, StrSource};
use crate::types::CellRef;
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

/// Characters that can be pushed back at once.
pub const UNGET_CAPACITY: usize = 4;
pub const DEFAULT_MAX_DEPTH: u8 = 16;
const CONTEXT_LEN: u16 = 10;

const QUOTED: u8 = 0b01;
const ESCAPED: u8 = 0b10;
const NEGATIVE: u8 = 0b01;
const DIGITS: u8 = 0b10;

/// Why the input was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxErrorKind {
    SpuriousClose,
    DanglingPrefix,
    UnhandledPrefix,
    CommaOutsideQuasiquote,
    PrefixedInteger,
    SymbolTooLong,
    ListTooLong,
    IntegerOverflow,
    TooDeep,
}

impl fmt::Display for SyntaxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpuriousClose => write!(f, "unexpected ')'"),
            Self::DanglingPrefix => write!(f, "prefix not followed by a value"),
            Self::UnhandledPrefix => write!(f, "unsupported prefix combination"),
            Self::CommaOutsideQuasiquote => write!(f, "comma outside quasiquote"),
            Self::PrefixedInteger => write!(f, "prefix on an integer"),
            Self::SymbolTooLong => write!(f, "symbol longer than {} characters", MAX_SYMBOL_LEN),
            Self::ListTooLong => write!(f, "list longer than {} elements", MAX_LIST_LEN),
            Self::IntegerOverflow => write!(f, "integer magnitude above {}", MAX_MAGNITUDE),
            Self::TooDeep => write!(f, "lists nested too deeply"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at byte {position}")]
pub struct SyntaxError {
    pub kind: SyntaxErrorKind,
    /// Offset of the offending character in the consumed input.
    pub position: u32,
    pub found: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl From<ArenaError> for ReadError {
    fn from(e: ArenaError) -> Self {
        ReadError::Fault(e.into())
    }
}

/// Result of one `read` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A complete top-level value.
    Done(CellRef),
    /// Input ran dry; call again once more is available.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Deepest list nesting accepted.
    pub max_depth: u8,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Public view of an unfinished value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenContext {
    List { prefix: Prefix },
    Symbol { quoted: bool, escaped: bool },
    Integer { negative: bool, digits: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    List = 1,
    Symbol = 2,
    Integer = 3,
}

/// Packed frame: `[kind][flags][cell][mark][parent][child]`. For lists
/// the flags byte holds the prefix code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Context {
    kind: Kind,
    flags: u8,
    cell: u16,
    mark: u16,
    parent: u16,
    child: u16,
}

impl Context {
    fn new(kind: Kind, flags: u8, cell: u16, parent: u16) -> Self {
        Self {
            kind,
            flags,
            cell,
            mark: 0,
            parent,
            child: 0,
        }
    }

    fn load(arena: &Bistack, at: u16) -> Result<Self, Fault> {
        let b = arena.bytes(at, CONTEXT_LEN)?;
        let word = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let kind = match b[0] {
            1 => Kind::List,
            2 => Kind::Symbol,
            3 => Kind::Integer,
            _ => return Err(Fault::CorruptContext(at)),
        };
        Ok(Self {
            kind,
            flags: b[1],
            cell: word(2),
            mark: word(4),
            parent: word(6),
            child: word(8),
        })
    }

    fn store(&self, arena: &mut Bistack, at: u16) -> Result<(), Fault> {
        let b = arena.bytes_mut(at, CONTEXT_LEN)?;
        b[0] = self.kind as u8;
        b[1] = self.flags;
        b[2..4].copy_from_slice(&self.cell.to_le_bytes());
        b[4..6].copy_from_slice(&self.mark.to_le_bytes());
        b[6..8].copy_from_slice(&self.parent.to_le_bytes());
        b[8..10].copy_from_slice(&self.child.to_le_bytes());
        Ok(())
    }

    fn prefix(&self) -> Prefix {
        Prefix::from_code(self.flags).unwrap_or_default()
    }

    fn view(&self) -> OpenContext {
        match self.kind {
            Kind::List => OpenContext::List {
                prefix: self.prefix(),
            },
            Kind::Symbol => OpenContext::Symbol {
                quoted: self.flags & QUOTED != 0,
                escaped: self.flags & ESCAPED != 0,
            },
            Kind::Integer => OpenContext::Integer {
                negative: self.flags & NEGATIVE != 0,
                digits: self.flags & DIGITS != 0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Open(Prefix),
    Close,
    Symbol { prefix: Prefix, quoted: bool },
    Integer,
    Comment,
}

enum Step {
    Continue,
    Pending,
    Done(CellRef),
}

/// Innermost open context plus the quasiquote level and list depth above it.
struct Innermost {
    leaf: Option<(u16, Context)>,
    level: i16,
    depth: u8,
}

fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r')
}

fn ends_plain_symbol(c: u8) -> bool {
    is_whitespace(c) || c == b')' || c == b';'
}

#[derive(Debug)]
pub struct Reader {
    /// Outermost context frame (0 = between expressions).
    root: u16,
    lock: Option<Lock>,
    in_comment: bool,
    unget: SmallVec<[u8; UNGET_CAPACITY]>,
    position: u32,
    options: ReaderOptions,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new(ReaderOptions::default())
    }
}

impl Reader {
    /// Nesting is capped at the walk limit so every value read can also
    /// be walked and printed.
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            root: 0,
            lock: None,
            in_comment: false,
            unget: SmallVec::new(),
            position: 0,
            options: ReaderOptions {
                max_depth: options.max_depth.min(MAX_WALK_DEPTH),
            },
        }
    }

    /// No expression in progress.
    pub fn is_idle(&self) -> bool {
        self.root == 0 && self.lock.is_none()
    }

    /// A reader-macro prefix was read but the value it applies to has not
    /// started yet.
    pub fn pending_prefix(&self) -> bool {
        self.unget.first().is_some_and(|&c| Prefix::from_char(c).is_some())
    }

    /// Characters consumed so far.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Forget the expression in progress. Only meaningful together with
    /// restoring the arena to a point before that expression began.
    pub fn reset(&mut self) {
        self.root = 0;
        self.lock = None;
        self.in_comment = false;
        self.unget.clear();
    }

    /// The `outward`-th open context counting from the innermost (0).
    pub fn open_context(&self, arena: &Bistack, outward: usize) -> Result<Option<OpenContext>, Fault> {
        let Some((_, mut ctx)) = self.innermost(arena)?.leaf else {
            return Ok(None);
        };
        for _ in 0..outward {
            if ctx.parent == 0 {
                return Ok(None);
            }
            ctx = Context::load(arena, ctx.parent)?;
        }
        Ok(Some(ctx.view()))
    }

    /// Continue reading. Returns the root cell once a whole top-level
    /// value has been consumed, or `Pending` when `src` has nothing more.
    pub fn read<S: CharSource + ?Sized>(&mut self, arena: &mut Bistack, src: &mut S) -> Result<ReadStatus, ReadError> {
        loop {
            if self.in_comment {
                loop {
                    match self.next_char(src) {
                        None => return Ok(ReadStatus::Pending),
                        Some(b'\n') => break,
                        Some(_) => {}
                    }
                }
                self.in_comment = false;
            }
            let innermost = self.innermost(arena)?;
            let step = match innermost.leaf {
                Some((at, ctx)) if ctx.kind == Kind::Symbol => self.step_symbol(arena, src, at, ctx)?,
                Some((at, ctx)) if ctx.kind == Kind::Integer => self.step_integer(arena, src, at, ctx)?,
                _ => self.step_token(arena, src, &innermost)?,
            };
            match step {
                Step::Continue => {}
                Step::Pending => return Ok(ReadStatus::Pending),
                Step::Done(cell) => return Ok(ReadStatus::Done(cell)),
            }
        }
    }

    fn innermost(&self, arena: &Bistack) -> Result<Innermost, Fault> {
        let mut found = Innermost {
            leaf: None,
            level: 0,
            depth: 0,
        };
        let mut at = self.root;
        while at != 0 {
            let ctx = Context::load(arena, at)?;
            found.leaf = Some((at, ctx));
            if ctx.kind != Kind::List {
                break;
            }
            found.depth += 1;
            match ctx.prefix() {
                Prefix::Quasiquote => found.level += 1,
                p if p.is_unquote() => found.level -= 1,
                _ => {}
            }
            at = ctx.child;
        }
        Ok(found)
    }

    fn next_char<S: CharSource + ?Sized>(&mut self, src: &mut S) -> Option<u8> {
        let c = match self.unget.pop() {
            Some(c) => c,
            None => src.get_char()?,
        };
        self.position += 1;
        Some(c)
    }

    fn unget(&mut self, c: u8) -> Result<(), Fault> {
        if self.unget.len() >= UNGET_CAPACITY {
            return Err(Fault::UngetOverflow);
        }
        self.unget.push(c);
        self.position -= 1;
        Ok(())
    }

    /// Error at the most recently consumed character.
    fn syntax(&self, kind: SyntaxErrorKind, found: Option<u8>) -> ReadError {
        ReadError::Syntax(SyntaxError {
            kind,
            position: self.position.saturating_sub(1),
            found,
        })
    }

    fn check_prefix(&self, prefix: Prefix, level: i16, c: u8) -> Result<(), ReadError> {
        if prefix.is_unquote() && level <= 0 {
            return Err(self.syntax(SyntaxErrorKind::CommaOutsideQuasiquote, Some(c)));
        }
        Ok(())
    }

    /// Decide what the next value is. Consumes whitespace and the prefix
    /// run; on running dry, pushes the whole run back.
    fn classify<S: CharSource + ?Sized>(&mut self, src: &mut S, level: i16) -> Result<Option<Token>, ReadError> {
        let mut run: SmallVec<[u8; UNGET_CAPACITY]> = SmallVec::new();
        let mut prefix = Prefix::None;
        let mut sign: Option<u8> = None;
        loop {
            let Some(c) = self.next_char(src) else {
                for &c in run.iter().rev() {
                    self.unget(c)?;
                }
                return Ok(None);
            };
            if run.is_empty() && is_whitespace(c) {
                continue;
            }
            if let Some(s) = sign {
                return match c {
                    b'0'..=b'9' if prefix != Prefix::None => Err(self.syntax(SyntaxErrorKind::PrefixedInteger, Some(c))),
                    b'0'..=b'9' => {
                        self.unget(c)?;
                        self.unget(s)?;
                        Ok(Some(Token::Integer))
                    }
                    b'(' if prefix != Prefix::None => Err(self.syntax(SyntaxErrorKind::UnhandledPrefix, Some(c))),
                    b'(' => Ok(Some(Token::Open(if s == b'+' { Prefix::Plus } else { Prefix::Minus }))),
                    _ => {
                        self.check_prefix(prefix, level, c)?;
                        self.unget(c)?;
                        self.unget(s)?;
                        Ok(Some(Token::Symbol { prefix, quoted: false }))
                    }
                };
            }
            match c {
                b'+' | b'-' => {
                    sign = Some(c);
                    run.push(c);
                }
                b';' if prefix == Prefix::None => return Ok(Some(Token::Comment)),
                b'(' => {
                    self.check_prefix(prefix, level, c)?;
                    return Ok(Some(Token::Open(prefix)));
                }
                b')' if prefix == Prefix::None => return Ok(Some(Token::Close)),
                b';' | b')' => return Err(self.syntax(SyntaxErrorKind::DanglingPrefix, Some(c))),
                b'"' => {
                    self.check_prefix(prefix, level, c)?;
                    return Ok(Some(Token::Symbol { prefix, quoted: true }));
                }
                b'0'..=b'9' if prefix != Prefix::None => {
                    return Err(self.syntax(SyntaxErrorKind::PrefixedInteger, Some(c)))
                }
                b'0'..=b'9' => {
                    self.unget(c)?;
                    return Ok(Some(Token::Integer));
                }
                c if is_whitespace(c) => return Err(self.syntax(SyntaxErrorKind::DanglingPrefix, Some(c))),
                c => {
                    if let Some(p) = prefix.combine(c) {
                        prefix = p;
                        run.push(c);
                        continue;
                    }
                    if Prefix::from_char(c).is_some() {
                        return Err(self.syntax(SyntaxErrorKind::UnhandledPrefix, Some(c)));
                    }
                    self.check_prefix(prefix, level, c)?;
                    self.unget(c)?;
                    return Ok(Some(Token::Symbol { prefix, quoted: false }));
                }
            }
        }
    }

    fn push_context(&mut self, arena: &mut Bistack, parent: Option<u16>, mut ctx: Context) -> Result<(), ReadError> {
        ctx.mark = arena.mark_backward()?.into_raw();
        let span = arena.alloc_backward(CONTEXT_LEN as usize)?;
        ctx.store(arena, span.offset)?;
        match parent {
            None => self.root = span.offset,
            Some(p) => {
                let mut up = Context::load(arena, p)?;
                up.child = span.offset;
                up.store(arena, p)?;
            }
        }
        Ok(())
    }

    fn step_token<S: CharSource + ?Sized>(
        &mut self,
        arena: &mut Bistack,
        src: &mut S,
        innermost: &Innermost,
    ) -> Result<Step, ReadError> {
        let Some(token) = self.classify(src, innermost.level)? else {
            return Ok(Step::Pending);
        };
        trace!(?token, position = self.position, "token");
        let parent_at = innermost.leaf.map(|(at, _)| at);
        let parent = parent_at.unwrap_or(0);
        match token {
            Token::Comment => {
                self.in_comment = true;
                Ok(Step::Continue)
            }
            Token::Close => match innermost.leaf {
                Some((at, ctx)) => self.complete(arena, at, ctx),
                None => Err(self.syntax(SyntaxErrorKind::SpuriousClose, Some(b')'))),
            },
            Token::Open(prefix) => {
                if innermost.depth >= self.options.max_depth {
                    return Err(self.syntax(SyntaxErrorKind::TooDeep, Some(b'(')));
                }
                let span = arena.alloc_forward(LIST_HEADER_LEN as usize)?;
                let header = CellHeader::List {
                    count: 0,
                    prefix,
                    is_ptr: false,
                };
                cell::store_header(arena, span.offset, &header)?;
                let ctx = Context::new(Kind::List, prefix.code(), span.offset, parent);
                self.push_context(arena, parent_at, ctx)?;
                Ok(Step::Continue)
            }
            Token::Symbol { prefix, quoted } => {
                let span = arena.alloc_forward(SYMBOL_HEADER_LEN as usize)?;
                let header = CellHeader::Symbol {
                    len: 0,
                    prefix,
                    quoted,
                    is_ptr: false,
                    hash: 0,
                };
                cell::store_header(arena, span.offset, &header)?;
                let flags = if quoted { QUOTED } else { 0 };
                self.push_context(arena, parent_at, Context::new(Kind::Symbol, flags, span.offset, parent))?;
                let lock = arena.lock()?;
                let room = MAX_SYMBOL_LEN.min(arena.free() as usize);
                arena.reserve(&lock, room)?;
                self.lock = Some(lock);
                Ok(Step::Continue)
            }
            Token::Integer => {
                let span = arena.alloc_forward(INTEGER_LEN as usize)?;
                cell::store_header(arena, span.offset, &CellHeader::Integer { value: 0 })?;
                self.push_context(arena, parent_at, Context::new(Kind::Integer, 0, span.offset, parent))?;
                Ok(Step::Continue)
            }
        }
    }

    fn step_symbol<S: CharSource + ?Sized>(
        &mut self,
        arena: &mut Bistack,
        src: &mut S,
        at: u16,
        mut ctx: Context,
    ) -> Result<Step, ReadError> {
        let header = cell::load(arena, &(), CellRef::arena(ctx.cell))?;
        let CellHeader::Symbol {
            mut len,
            prefix,
            quoted,
            ..
        } = header
        else {
            return Err(Fault::CorruptContext(at).into());
        };
        let text = ctx.cell + SYMBOL_HEADER_LEN;
        loop {
            let Some(c) = self.next_char(src) else {
                let header = CellHeader::Symbol {
                    len,
                    prefix,
                    quoted,
                    is_ptr: false,
                    hash: 0,
                };
                cell::store_header(arena, ctx.cell, &header)?;
                ctx.store(arena, at)?;
                return Ok(Step::Pending);
            };
            let literal = if !quoted {
                if ends_plain_symbol(c) {
                    self.unget(c)?;
                    false
                } else {
                    true
                }
            } else if ctx.flags & ESCAPED != 0 {
                ctx.flags &= !ESCAPED;
                true
            } else if c == b'\\' {
                ctx.flags |= ESCAPED;
                continue;
            } else {
                c != b'"'
            };
            if !literal {
                break;
            }
            if len as usize == MAX_SYMBOL_LEN {
                return Err(self.syntax(SyntaxErrorKind::SymbolTooLong, Some(c)));
            }
            let dst = text + len as u16;
            if dst >= arena.forward() {
                return Err(Fault::from(ArenaError::OutOfMemory {
                    requested: 1,
                    free: arena.free(),
                })
                .into());
            }
            arena.write_u8(dst, c)?;
            len += 1;
        }
        let lock = self.lock.take().ok_or(Fault::CorruptContext(at))?;
        arena.claim(&lock, len as usize)?;
        arena.unlock(lock)?;
        let hash = cell::symbol_hash(arena.bytes(text, len as u16)?);
        let header = CellHeader::Symbol {
            len,
            prefix,
            quoted,
            is_ptr: false,
            hash,
        };
        cell::store_header(arena, ctx.cell, &header)?;
        self.complete(arena, at, ctx)
    }

    fn step_integer<S: CharSource + ?Sized>(
        &mut self,
        arena: &mut Bistack,
        src: &mut S,
        at: u16,
        mut ctx: Context,
    ) -> Result<Step, ReadError> {
        let CellHeader::Integer { value } = cell::load(arena, &(), CellRef::arena(ctx.cell))? else {
            return Err(Fault::CorruptContext(at).into());
        };
        let mut magnitude = value.unsigned_abs();
        let finished = loop {
            let Some(c) = self.next_char(src) else {
                break false;
            };
            match c {
                b'+' | b'-' if magnitude == 0 => {
                    if c == b'-' {
                        ctx.flags |= NEGATIVE;
                    } else {
                        ctx.flags &= !NEGATIVE;
                    }
                }
                b'0'..=b'9' => {
                    magnitude = magnitude
                        .checked_mul(10)
                        .and_then(|m| m.checked_add((c - b'0') as u32))
                        .filter(|&m| m <= MAX_MAGNITUDE)
                        .ok_or_else(|| self.syntax(SyntaxErrorKind::IntegerOverflow, Some(c)))?;
                    ctx.flags |= DIGITS;
                }
                _ => {
                    self.unget(c)?;
                    break true;
                }
            }
        };
        let value = if ctx.flags & NEGATIVE != 0 {
            -(magnitude as i32)
        } else {
            magnitude as i32
        };
        cell::store_header(arena, ctx.cell, &CellHeader::Integer { value })?;
        if !finished {
            ctx.store(arena, at)?;
            return Ok(Step::Pending);
        }
        self.complete(arena, at, ctx)
    }

    /// Pop a finished context and count it in its parent list.
    fn complete(&mut self, arena: &mut Bistack, at: u16, ctx: Context) -> Result<Step, ReadError> {
        arena.rewind(Mark::from_raw(Direction::Backward, ctx.mark))?;
        if ctx.parent == 0 {
            self.root = 0;
            debug!(cell = ctx.cell, position = self.position, "expression complete");
            return Ok(Step::Done(CellRef::arena(ctx.cell)));
        }
        let mut parent = Context::load(arena, ctx.parent)?;
        if parent.child != at {
            return Err(Fault::CorruptContext(ctx.parent).into());
        }
        parent.child = 0;
        parent.store(arena, ctx.parent)?;
        let list = CellRef::arena(parent.cell);
        let CellHeader::List { count, prefix, .. } = cell::load(arena, &(), list)? else {
            return Err(Fault::CorruptContext(ctx.parent).into());
        };
        if count == MAX_LIST_LEN {
            return Err(self.syntax(SyntaxErrorKind::ListTooLong, None));
        }
        let header = CellHeader::List {
            count: count + 1,
            prefix,
            is_ptr: false,
        };
        cell::store_header(arena, parent.cell, &header)?;
        Ok(Step::Continue)
    }
}

/// Read one value from `text`, treating its end as a delimiter.
pub fn read_from_str(arena: &mut Bistack, text: &str) -> Result<ReadStatus, ReadError> {
    let mut reader = Reader::default();
    match reader.read(arena, &mut StrSource::new(text))? {
        ReadStatus::Pending => reader.read(arena, &mut StrSource::new("\n")),
        done => Ok(done),
    }
}
