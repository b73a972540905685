// ThinLisp Errors - Faults
//
// Exhaustion and discipline failures shared by every layer.

use crate::arena::ArenaError;
use crate::store::StoreError;
use crate::types::CellRef;
use thiserror::Error;

/// A failure that is not the input's fault.
///
/// Exhaustion (`Arena(OutOfMemory)`, `Store(OutOfSpace)`) and discipline
/// violations both abort the current top-level read; only the recovery
/// boundary is expected to handle them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("arena: {0}")]
    Arena(#[from] ArenaError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("corrupt cell header {byte:#04x} at {at}")]
    CorruptCell { at: CellRef, byte: u8 },
    #[error("corrupt reader context at {0:#06x}")]
    CorruptContext(u16),
    #[error("tree deeper than {0} levels")]
    DepthExceeded(u8),
    #[error("unget buffer overflow")]
    UngetOverflow,
    #[error("printer already has a job in progress")]
    PrinterBusy,
}

impl Fault {
    /// True for the out-of-memory family.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Fault::Arena(ArenaError::OutOfMemory { .. }) | Fault::Store(StoreError::OutOfSpace { .. })
        )
    }
}
