// ThinLisp: Incremental Lisp Reader for Small Targets
// This module exports the arena, cell, reader, printer and store layers.
// Everything allocates from one fixed Bistack; no heap use per expression.

pub mod types;
pub mod error;
pub mod arena;
pub mod cell;
pub mod streams;
pub mod reader;
pub mod printer;
pub mod store;
pub mod recovery;
pub mod config;

pub use arena::{ArenaError, Bistack, Checkpoint, Direction, Lock, Mark, Span};
pub use config::{Config, ConfigError};
pub use error::Fault;
pub use printer::{print_to_string, PrintOptions, PrintStatus, Printer};
pub use reader::{read_from_str, ReadError, ReadStatus, Reader, ReaderOptions, SyntaxError, SyntaxErrorKind};
pub use recovery::{Outcome, Recovery};
pub use store::{BlockStore, ExternalMemory, NvMem, StoreError};
pub use streams::{CharSink, CharSource};
pub use types::{CellRef, Space};
