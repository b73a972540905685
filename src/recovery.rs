// ThinLisp Recovery - Top-Level Error Boundary
//
// Every failure inside a read aborts back to the arena state captured
// before the expression began.

use crate::arena::{ArenaError, Bistack, Checkpoint};
use crate::error::Fault;
use crate::reader::{ReadError, ReadStatus, Reader, SyntaxError};
use crate::streams::CharSource;
use crate::types::CellRef;
use tracing::{error, warn};

/// What happened to one guarded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Value(CellRef),
    Pending,
    /// Bad input. Arena and reader are back at the checkpoint.
    Rejected(SyntaxError),
    /// Exhaustion or an internal fault. Arena and reader are back at the
    /// checkpoint.
    Aborted(Fault),
}

/// Recovery point for top-level reads.
#[derive(Debug, Clone)]
pub struct Recovery {
    checkpoint: Checkpoint,
    rejected: u32,
    aborted: u32,
}

impl Recovery {
    /// Capture the arena as it is now; call between expressions.
    pub fn establish(arena: &Bistack) -> Self {
        Self {
            checkpoint: arena.checkpoint(),
            rejected: 0,
            aborted: 0,
        }
    }

    /// Continue reading under the guard.
    pub fn read<S: CharSource + ?Sized>(&mut self, arena: &mut Bistack, reader: &mut Reader, src: &mut S) -> Outcome {
        let err = match reader.read(arena, src) {
            Ok(ReadStatus::Done(cell)) => return Outcome::Value(cell),
            Ok(ReadStatus::Pending) => return Outcome::Pending,
            Err(err) => err,
        };
        reader.reset();
        if let Err(stale) = arena.restore(&self.checkpoint) {
            error!(%stale, "recovery point lost");
            self.aborted += 1;
            return Outcome::Aborted(stale.into());
        }
        match err {
            ReadError::Syntax(e) => {
                warn!(%e, "input rejected");
                self.rejected += 1;
                Outcome::Rejected(e)
            }
            ReadError::Fault(f) => {
                error!(%f, exhaustion = f.is_exhaustion(), "read aborted");
                self.aborted += 1;
                Outcome::Aborted(f)
            }
        }
    }

    /// Drop everything allocated since the checkpoint.
    pub fn release(&self, arena: &mut Bistack) -> Result<(), ArenaError> {
        arena.restore(&self.checkpoint)
    }

    /// Keep everything allocated so far; later failures roll back to here.
    pub fn keep(&mut self, arena: &Bistack) {
        self.checkpoint = arena.checkpoint();
    }

    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    pub fn aborted(&self) -> u32 {
        self.aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::SyntaxErrorKind;
    use crate::streams::StrSource;

    #[test]
    fn test_syntax_error_restores() {
        let mut arena = Bistack::new(256).unwrap();
        let mut reader = Reader::default();
        let mut guard = Recovery::establish(&arena);
        let before = (arena.forward(), arena.backward());
        let outcome = guard.read(&mut arena, &mut reader, &mut StrSource::new("(a (b ')"));
        assert!(matches!(
            outcome,
            Outcome::Rejected(SyntaxError {
                kind: SyntaxErrorKind::DanglingPrefix,
                ..
            })
        ));
        assert_eq!((arena.forward(), arena.backward()), before);
        assert!(reader.is_idle());
        assert_eq!(guard.rejected(), 1);

        let outcome = guard.read(&mut arena, &mut reader, &mut StrSource::new("(ok)"));
        assert!(matches!(outcome, Outcome::Value(_)));
    }

    #[test]
    fn test_exhaustion_aborts() {
        let mut arena = Bistack::new(64).unwrap();
        let mut reader = Reader::default();
        let mut guard = Recovery::establish(&arena);
        let text = "(aaaaaaaa bbbbbbbb cccccccc dddddddd eeeeeeee ffffffff)";
        let outcome = guard.read(&mut arena, &mut reader, &mut StrSource::new(text));
        match outcome {
            Outcome::Aborted(f) => assert!(f.is_exhaustion()),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(arena.free(), 62);
        assert!(!arena.is_locked());
        assert_eq!(guard.aborted(), 1);
    }

    #[test]
    fn test_keep_and_release() {
        let mut arena = Bistack::new(256).unwrap();
        let mut reader = Reader::default();
        let mut guard = Recovery::establish(&arena);
        let Outcome::Value(first) = guard.read(&mut arena, &mut reader, &mut StrSource::new("(x) ")) else {
            panic!("expected a value");
        };
        guard.keep(&arena);
        let kept = arena.forward();
        let Outcome::Value(_) = guard.read(&mut arena, &mut reader, &mut StrSource::new("(y z) ")) else {
            panic!("expected a value");
        };
        guard.release(&mut arena).unwrap();
        assert_eq!(arena.forward(), kept);
        assert!(first.offset < kept);
    }

    #[test]
    fn test_pending_keeps_state() {
        let mut arena = Bistack::new(256).unwrap();
        let mut reader = Reader::default();
        let mut guard = Recovery::establish(&arena);
        assert_eq!(
            guard.read(&mut arena, &mut reader, &mut StrSource::new("(a")),
            Outcome::Pending
        );
        assert!(!reader.is_idle());
        assert_ne!(arena.backward(), arena.capacity());
        assert_eq!(guard.release(&mut arena), Ok(()));
        reader.reset();
        assert_eq!(arena.backward(), arena.capacity());
    }
}
