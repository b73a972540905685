// ThinLisp Arena - Bidirectional Stack Allocator
//
// One fixed byte buffer shared by a forward cursor growing up from the
// start and a backward cursor growing down from the end.

use thiserror::Error;
use tracing::trace;

/// Bytes at the start of the buffer holding the capacity. Offset 0 is
/// therefore never handed out and doubles as the null link.
pub const HEADER_LEN: u16 = 2;
/// Size of an in-buffer mark record: saved cursor, previous record.
pub const MARK_LEN: u16 = 4;
pub const MIN_CAPACITY: usize = 64;
pub const MAX_CAPACITY: usize = u16::MAX as usize;
/// Pushes allowed on the direction stack above its base entry.
pub const MAX_DIRECTION_DEPTH: u8 = 7;

/// Growth direction of a cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("out of memory: {requested} bytes requested, {free} free")]
    OutOfMemory { requested: usize, free: u16 },
    #[error("rewind with no outstanding mark")]
    RewindTooFar,
    #[error("mark is not the most recent on its cursor")]
    MarkMismatch,
    #[error("direction stack overflow")]
    DirectionOverflow,
    #[error("direction stack underflow")]
    DirectionUnderflow,
    #[error("forward cursor is locked")]
    Locked,
    #[error("lock is not the one held")]
    LockNotHeld,
    #[error("reservation still open")]
    ReservationOpen,
    #[error("no reservation to claim from")]
    NoReservation,
    #[error("claim of {claimed} bytes exceeds reservation of {reserved}")]
    ClaimTooLarge { claimed: u16, reserved: u16 },
    #[error("{len} bytes at {offset:#06x} are outside the live regions")]
    Dangling { offset: u16, len: u16 },
    #[error("arena size {0} outside {MIN_CAPACITY}..={MAX_CAPACITY}")]
    InvalidSize(usize),
    #[error("checkpoint is no longer reachable")]
    StaleCheckpoint,
}

pub type ArenaResult<T> = Result<T, ArenaError>;

/// A contiguous allocation inside the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub offset: u16,
    pub len: u16,
}

impl Span {
    pub fn end(&self) -> u16 {
        self.offset + self.len
    }
}

/// Token for one outstanding mark. Must be handed back to the matching
/// rewind; rewinding anything but the most recent mark of its cursor is
/// an error.
#[must_use = "an unrewound mark pins its cursor"]
#[derive(Debug, PartialEq, Eq)]
pub struct Mark {
    direction: Direction,
    record: u16,
}

impl Mark {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Offset of the in-buffer mark record, for storing inside frames.
    pub(crate) fn into_raw(self) -> u16 {
        self.record
    }

    pub(crate) fn from_raw(direction: Direction, record: u16) -> Self {
        Self { direction, record }
    }
}

/// Capability for the forward cursor while a reservation is in use.
#[must_use = "a held lock blocks forward allocation"]
#[derive(Debug, PartialEq, Eq)]
pub struct Lock {
    id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LockState {
    id: u16,
    /// Forward cursor where the open reservation begins.
    start: u16,
    reserved: Option<u16>,
}

/// Snapshot of both cursors, taken by the recovery boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    forward: u16,
    backward: u16,
    forward_marks: u16,
    backward_marks: u16,
    directions: u8,
    direction_depth: u8,
}

/// Arena memory usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaStats {
    pub capacity: u16,
    pub forward_used: u16,
    pub backward_used: u16,
    pub free: u16,
    pub forward_marks: usize,
    pub backward_marks: usize,
    pub locked: bool,
}

pub struct Bistack {
    memory: Box<[u8]>,
    forward: u16,
    backward: u16,
    /// Head of the forward mark chain (0 = none).
    forward_marks: u16,
    /// Head of the backward mark chain (0 = none).
    backward_marks: u16,
    directions: u8,
    direction_depth: u8,
    lock: Option<LockState>,
    next_lock_id: u16,
}

impl std::fmt::Debug for Bistack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bistack")
            .field("capacity", &self.capacity())
            .field("forward", &self.forward)
            .field("backward", &self.backward)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

impl Bistack {
    /// A fresh arena of `size` bytes, both regions empty.
    pub fn new(size: usize) -> ArenaResult<Self> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&size) {
            return Err(ArenaError::InvalidSize(size));
        }
        let mut memory = vec![0u8; size].into_boxed_slice();
        memory[..2].copy_from_slice(&(size as u16).to_le_bytes());
        Ok(Self {
            memory,
            forward: HEADER_LEN,
            backward: size as u16,
            forward_marks: 0,
            backward_marks: 0,
            directions: 0,
            direction_depth: 0,
            lock: None,
            next_lock_id: 1,
        })
    }

    pub fn capacity(&self) -> u16 {
        self.memory.len() as u16
    }

    /// Current forward cursor (first free byte above the forward region).
    pub fn forward(&self) -> u16 {
        self.forward
    }

    /// Current backward cursor (first used byte of the backward region).
    pub fn backward(&self) -> u16 {
        self.backward
    }

    pub fn free(&self) -> u16 {
        self.backward - self.forward
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            capacity: self.capacity(),
            forward_used: self.forward - HEADER_LEN,
            backward_used: self.capacity() - self.backward,
            free: self.free(),
            forward_marks: self.chain_len(self.forward_marks),
            backward_marks: self.chain_len(self.backward_marks),
            locked: self.is_locked(),
        }
    }

    /// Whole buffer, header included.
    pub fn raw(&self) -> &[u8] {
        &self.memory
    }

    /// Zero the free gap between the cursors.
    pub fn zero(&mut self) {
        self.memory[self.forward as usize..self.backward as usize].fill(0);
    }

    fn out_of_memory(&self, requested: usize) -> ArenaError {
        ArenaError::OutOfMemory {
            requested,
            free: self.free(),
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    pub fn alloc_forward(&mut self, n: usize) -> ArenaResult<Span> {
        if self.lock.is_some() {
            return Err(ArenaError::Locked);
        }
        self.bump_forward(n)
    }

    fn bump_forward(&mut self, n: usize) -> ArenaResult<Span> {
        if n > self.free() as usize {
            return Err(self.out_of_memory(n));
        }
        let span = Span {
            offset: self.forward,
            len: n as u16,
        };
        self.forward += n as u16;
        Ok(span)
    }

    pub fn alloc_backward(&mut self, n: usize) -> ArenaResult<Span> {
        if n > self.free() as usize {
            return Err(self.out_of_memory(n));
        }
        self.backward -= n as u16;
        Ok(Span {
            offset: self.backward,
            len: n as u16,
        })
    }

    /// Allocate in the current default direction.
    pub fn alloc(&mut self, n: usize) -> ArenaResult<Span> {
        match self.direction() {
            Direction::Forward => self.alloc_forward(n),
            Direction::Backward => self.alloc_backward(n),
        }
    }

    // ========================================================================
    // Marks
    // ========================================================================

    pub fn mark_forward(&mut self) -> ArenaResult<Mark> {
        if self.lock.is_some() {
            return Err(ArenaError::Locked);
        }
        let saved = self.forward;
        let span = self.bump_forward(MARK_LEN as usize)?;
        self.write_record(span.offset, saved, self.forward_marks);
        self.forward_marks = span.offset;
        trace!(record = span.offset, "mark forward");
        Ok(Mark::from_raw(Direction::Forward, span.offset))
    }

    pub fn mark_backward(&mut self) -> ArenaResult<Mark> {
        let saved = self.backward;
        let span = self.alloc_backward(MARK_LEN as usize)?;
        self.write_record(span.offset, saved, self.backward_marks);
        self.backward_marks = span.offset;
        trace!(record = span.offset, "mark backward");
        Ok(Mark::from_raw(Direction::Backward, span.offset))
    }

    pub fn mark(&mut self) -> ArenaResult<Mark> {
        match self.direction() {
            Direction::Forward => self.mark_forward(),
            Direction::Backward => self.mark_backward(),
        }
    }

    /// Release everything allocated on the mark's cursor since the mark.
    pub fn rewind(&mut self, mark: Mark) -> ArenaResult<()> {
        match mark.direction {
            Direction::Forward => {
                if self.lock.is_some() {
                    return Err(ArenaError::Locked);
                }
                let (saved, prev) = self.pop_record(self.forward_marks, mark.record)?;
                self.forward = saved;
                self.forward_marks = prev;
                trace!(record = mark.record, cursor = saved, "rewind forward");
            }
            Direction::Backward => {
                let (saved, prev) = self.pop_record(self.backward_marks, mark.record)?;
                self.backward = saved;
                self.backward_marks = prev;
                trace!(record = mark.record, cursor = saved, "rewind backward");
            }
        }
        Ok(())
    }

    /// Forget the most recent mark without moving its cursor.
    pub fn dropmark(&mut self, mark: Mark) -> ArenaResult<()> {
        match mark.direction {
            Direction::Forward => {
                let (_, prev) = self.pop_record(self.forward_marks, mark.record)?;
                self.forward_marks = prev;
            }
            Direction::Backward => {
                let (_, prev) = self.pop_record(self.backward_marks, mark.record)?;
                self.backward_marks = prev;
            }
        }
        Ok(())
    }

    /// Rewind a backward mark, first discarding any newer backward marks.
    /// Used on error paths where inner frames were abandoned.
    pub(crate) fn unwind_backward(&mut self, mark: Mark) -> ArenaResult<()> {
        if !self.chain_contains(self.backward_marks, mark.record) {
            return Err(ArenaError::MarkMismatch);
        }
        while self.backward_marks != mark.record {
            let (_, prev) = self.read_record(self.backward_marks)?;
            self.backward_marks = prev;
        }
        self.rewind(mark)
    }

    /// Run `f` with the backward cursor restored afterwards, whatever `f`
    /// returns.
    pub fn scope_backward<T, E>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<ArenaError>,
    {
        let mark = self.mark_backward()?;
        let out = f(self);
        self.unwind_backward(mark)?;
        out
    }

    fn write_record(&mut self, at: u16, saved: u16, prev: u16) {
        let at = at as usize;
        self.memory[at..at + 2].copy_from_slice(&saved.to_le_bytes());
        self.memory[at + 2..at + 4].copy_from_slice(&prev.to_le_bytes());
    }

    fn read_record(&self, at: u16) -> ArenaResult<(u16, u16)> {
        let bytes = self.bytes(at, MARK_LEN)?;
        Ok((
            u16::from_le_bytes([bytes[0], bytes[1]]),
            u16::from_le_bytes([bytes[2], bytes[3]]),
        ))
    }

    fn pop_record(&self, head: u16, record: u16) -> ArenaResult<(u16, u16)> {
        if head == 0 {
            return Err(ArenaError::RewindTooFar);
        }
        if head != record {
            return Err(ArenaError::MarkMismatch);
        }
        self.read_record(record)
    }

    fn chain_len(&self, mut at: u16) -> usize {
        let mut n = 0;
        while at != 0 {
            n += 1;
            match self.read_record(at) {
                Ok((_, prev)) => at = prev,
                Err(_) => break,
            }
        }
        n
    }

    fn chain_contains(&self, mut at: u16, record: u16) -> bool {
        loop {
            if at == record {
                return true;
            }
            if at == 0 {
                return false;
            }
            match self.read_record(at) {
                Ok((_, prev)) => at = prev,
                Err(_) => return false,
            }
        }
    }

    // ========================================================================
    // Direction stack
    // ========================================================================

    pub fn direction(&self) -> Direction {
        if self.direction_depth > 0 && self.directions & 1 == 1 {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    pub fn push_direction(&mut self, direction: Direction) -> ArenaResult<()> {
        if self.direction_depth >= MAX_DIRECTION_DEPTH {
            return Err(ArenaError::DirectionOverflow);
        }
        self.directions = (self.directions << 1) | (direction == Direction::Backward) as u8;
        self.direction_depth += 1;
        Ok(())
    }

    pub fn pop_direction(&mut self) -> ArenaResult<Direction> {
        if self.direction_depth == 0 {
            return Err(ArenaError::DirectionUnderflow);
        }
        let popped = self.direction();
        self.directions >>= 1;
        self.direction_depth -= 1;
        Ok(popped)
    }

    // ========================================================================
    // Reservation lock
    // ========================================================================

    pub fn lock(&mut self) -> ArenaResult<Lock> {
        if self.lock.is_some() {
            return Err(ArenaError::Locked);
        }
        let id = self.next_lock_id;
        self.next_lock_id = self.next_lock_id.checked_add(1).unwrap_or(1);
        self.lock = Some(LockState {
            id,
            start: self.forward,
            reserved: None,
        });
        Ok(Lock { id })
    }

    fn held(&self, lock: &Lock) -> ArenaResult<LockState> {
        match self.lock {
            Some(state) if state.id == lock.id => Ok(state),
            _ => Err(ArenaError::LockNotHeld),
        }
    }

    /// Set aside up to `n` bytes on the forward cursor. Reserving again
    /// resizes the open reservation in place.
    pub fn reserve(&mut self, lock: &Lock, n: usize) -> ArenaResult<Span> {
        let mut state = self.held(lock)?;
        let start = if state.reserved.is_some() { state.start } else { self.forward };
        let available = (self.backward - start) as usize;
        if n > available {
            return Err(ArenaError::OutOfMemory {
                requested: n,
                free: self.backward - self.forward,
            });
        }
        state.start = start;
        state.reserved = Some(n as u16);
        self.forward = start + n as u16;
        self.lock = Some(state);
        Ok(Span {
            offset: start,
            len: n as u16,
        })
    }

    /// Commit `k` bytes of the open reservation and return the rest.
    pub fn claim(&mut self, lock: &Lock, k: usize) -> ArenaResult<Span> {
        let mut state = self.held(lock)?;
        let reserved = state.reserved.ok_or(ArenaError::NoReservation)?;
        if k > reserved as usize {
            return Err(ArenaError::ClaimTooLarge {
                claimed: k.min(u16::MAX as usize) as u16,
                reserved,
            });
        }
        self.forward = state.start + k as u16;
        state.reserved = None;
        self.lock = Some(state);
        Ok(Span {
            offset: state.start,
            len: k as u16,
        })
    }

    /// Allocate permanently on the forward cursor under the lock.
    pub fn push(&mut self, lock: &Lock, n: usize) -> ArenaResult<Span> {
        let state = self.held(lock)?;
        if state.reserved.is_some() {
            return Err(ArenaError::ReservationOpen);
        }
        self.bump_forward(n)
    }

    /// Release the lock. An unclaimed reservation is given back.
    pub fn unlock(&mut self, lock: Lock) -> ArenaResult<()> {
        let state = self.held(&lock)?;
        if state.reserved.is_some() {
            self.forward = state.start;
        }
        self.lock = None;
        Ok(())
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            forward: self.forward,
            backward: self.backward,
            forward_marks: self.forward_marks,
            backward_marks: self.backward_marks,
            directions: self.directions,
            direction_depth: self.direction_depth,
        }
    }

    /// Roll both cursors back to `checkpoint`, dropping any lock.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> ArenaResult<()> {
        let reachable = self.forward >= checkpoint.forward
            && self.backward <= checkpoint.backward
            && self.chain_contains(self.forward_marks, checkpoint.forward_marks)
            && self.chain_contains(self.backward_marks, checkpoint.backward_marks);
        if !reachable {
            return Err(ArenaError::StaleCheckpoint);
        }
        self.forward = checkpoint.forward;
        self.backward = checkpoint.backward;
        self.forward_marks = checkpoint.forward_marks;
        self.backward_marks = checkpoint.backward_marks;
        self.directions = checkpoint.directions;
        self.direction_depth = checkpoint.direction_depth;
        self.lock = None;
        trace!(forward = self.forward, backward = self.backward, "restore checkpoint");
        Ok(())
    }

    // ========================================================================
    // Checked access
    // ========================================================================

    fn live(&self, offset: u16, len: u16) -> ArenaResult<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start + len as usize;
        let in_forward = start >= HEADER_LEN as usize && end <= self.forward as usize;
        let in_backward = start >= self.backward as usize && end <= self.memory.len();
        if in_forward || in_backward {
            Ok(start..end)
        } else {
            Err(ArenaError::Dangling { offset, len })
        }
    }

    pub fn bytes(&self, offset: u16, len: u16) -> ArenaResult<&[u8]> {
        let range = self.live(offset, len)?;
        Ok(&self.memory[range])
    }

    pub fn bytes_mut(&mut self, offset: u16, len: u16) -> ArenaResult<&mut [u8]> {
        let range = self.live(offset, len)?;
        Ok(&mut self.memory[range])
    }

    pub fn span(&self, span: Span) -> ArenaResult<&[u8]> {
        self.bytes(span.offset, span.len)
    }

    pub fn read_u8(&self, offset: u16) -> ArenaResult<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn write_u8(&mut self, offset: u16, value: u8) -> ArenaResult<()> {
        self.bytes_mut(offset, 1)?[0] = value;
        Ok(())
    }

    pub fn read_u16(&self, offset: u16) -> ArenaResult<u16> {
        let b = self.bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn write_u16(&mut self, offset: u16, value: u16) -> ArenaResult<()> {
        self.bytes_mut(offset, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}
