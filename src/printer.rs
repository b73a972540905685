// ThinLisp Printer - Resumable Serializer
//
// Walks flattened cells and writes their textual form one character at a
// time. A refusing sink suspends the job; calling again resumes it.

use crate::arena::{Bistack, Direction, Mark};
use crate::cell::{self, CellHeader, Prefix, MAX_WALK_DEPTH};
use crate::error::Fault;
use crate::reader::{OpenContext, Reader};
use crate::store::ExternalMemory;
use crate::streams::{CharSink, StringSink};
use crate::types::CellRef;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Print options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintOptions {
    /// Spaces per nesting level when a list is wrapped.
    pub indent: u8,
    /// Lists with more children than this put each child on its own line
    /// (0 = never wrap).
    pub wrap_after: u16,
    /// Write `+` before non-negative integers.
    pub explicit_sign: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            indent: 2,
            wrap_after: 0,
            explicit_sign: true,
        }
    }
}

impl PrintOptions {
    /// Single line, no redundant signs.
    pub fn compact() -> Self {
        Self {
            wrap_after: 0,
            explicit_sign: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStatus {
    Done,
    /// The sink refused a character; call again to continue.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Prefix = 0,
    Open = 1,
    Body = 2,
    Escaped = 3,
    Separator = 4,
    Close = 5,
}

impl Stage {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Stage::Prefix,
            1 => Stage::Open,
            2 => Stage::Body,
            3 => Stage::Escaped,
            4 => Stage::Separator,
            5 => Stage::Close,
            _ => return None,
        })
    }
}

const FRAME_LEN: u16 = 13;

/// One cell being printed: `[at][next][stage][counter][mark][below]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    at: CellRef,
    /// Next child of a list, or where its children ended.
    next: CellRef,
    stage: Stage,
    counter: u16,
    mark: u16,
    below: u16,
}

impl Frame {
    fn load(arena: &Bistack, offset: u16) -> Result<Self, Fault> {
        let b = arena.bytes(offset, FRAME_LEN)?;
        let corrupt = || Fault::CorruptContext(offset);
        let slot = |i: usize| CellRef::decode([b[i], b[i + 1], b[i + 2]]).flatten().ok_or_else(corrupt);
        let word = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        Ok(Self {
            at: slot(0)?,
            next: slot(3)?,
            stage: Stage::from_u8(b[6]).ok_or_else(corrupt)?,
            counter: word(7),
            mark: word(9),
            below: word(11),
        })
    }

    fn store(&self, arena: &mut Bistack, offset: u16) -> Result<(), Fault> {
        let b = arena.bytes_mut(offset, FRAME_LEN)?;
        b[0..3].copy_from_slice(&CellRef::encode(Some(self.at)));
        b[3..6].copy_from_slice(&CellRef::encode(Some(self.next)));
        b[6] = self.stage as u8;
        b[7..9].copy_from_slice(&self.counter.to_le_bytes());
        b[9..11].copy_from_slice(&self.mark.to_le_bytes());
        b[11..13].copy_from_slice(&self.below.to_le_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Job {
    root: CellRef,
    /// Backward mark taken before the first frame.
    mark: u16,
    top: u16,
    depth: u8,
    newline: bool,
    spaces: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct MissingJob {
    /// Placeholder for a dangling prefix written.
    placed: bool,
    closed: usize,
    emitted: usize,
}

/// Value written after a prefix that has nothing to apply to; an empty
/// quoted symbol is accepted after every prefix.
const PLACEHOLDER: &[u8] = b"\"\"";

enum Emit {
    Progress,
    Blocked,
    Descend(CellRef),
    Finished(CellRef),
}

fn prefix_of(header: &CellHeader) -> Prefix {
    match *header {
        CellHeader::Symbol { prefix, .. } | CellHeader::List { prefix, .. } => prefix,
        CellHeader::Integer { .. } => Prefix::None,
    }
}

fn decimal_digits(mut m: u32) -> u16 {
    let mut n = 1;
    while m >= 10 {
        m /= 10;
        n += 1;
    }
    n
}

fn digit_at(m: u32, n: u16, k: u16) -> u8 {
    let scale = 10u32.pow((n - 1 - k) as u32);
    b'0' + ((m / scale) % 10) as u8
}

#[derive(Debug, Default)]
pub struct Printer {
    options: PrintOptions,
    job: Option<Job>,
    missing: Option<MissingJob>,
}

impl Printer {
    pub fn new(options: PrintOptions) -> Self {
        Self {
            options,
            job: None,
            missing: None,
        }
    }

    pub fn options(&self) -> &PrintOptions {
        &self.options
    }

    /// A job is suspended waiting for the sink.
    pub fn is_busy(&self) -> bool {
        self.job.is_some() || self.missing.is_some()
    }

    /// Drop a suspended job and release its frames.
    pub fn abandon(&mut self, arena: &mut Bistack) -> Result<(), Fault> {
        self.missing = None;
        if let Some(job) = self.job.take() {
            arena.unwind_backward(Mark::from_raw(Direction::Backward, job.mark))?;
        }
        Ok(())
    }

    /// Forget a suspended job without touching the arena, for use after
    /// the arena has been restored past it.
    pub fn reset(&mut self) {
        self.job = None;
        self.missing = None;
    }

    /// Print the value at `root`, or continue a suspended print of it.
    pub fn pprint<K: CharSink + ?Sized>(
        &mut self,
        arena: &mut Bistack,
        external: &dyn ExternalMemory,
        root: CellRef,
        sink: &mut K,
    ) -> Result<PrintStatus, Fault> {
        if self.missing.is_some() {
            return Err(Fault::PrinterBusy);
        }
        let mut job = match self.job.take() {
            Some(job) if job.root == root => job,
            Some(job) => {
                self.job = Some(job);
                return Err(Fault::PrinterBusy);
            }
            None => self.start(arena, external, root)?,
        };
        match self.run(arena, external, &mut job, sink) {
            Ok(PrintStatus::Blocked) => {
                self.job = Some(job);
                Ok(PrintStatus::Blocked)
            }
            Ok(PrintStatus::Done) => {
                arena.rewind(Mark::from_raw(Direction::Backward, job.mark))?;
                debug!(%root, "print complete");
                Ok(PrintStatus::Done)
            }
            Err(e) => {
                arena.unwind_backward(Mark::from_raw(Direction::Backward, job.mark))?;
                Err(e)
            }
        }
    }

    fn start(&self, arena: &mut Bistack, external: &dyn ExternalMemory, root: CellRef) -> Result<Job, Fault> {
        let mut job = Job {
            root,
            mark: arena.mark_backward()?.into_raw(),
            top: 0,
            depth: 0,
            newline: false,
            spaces: 0,
        };
        if let Err(e) = self.push(arena, external, &mut job, root) {
            arena.unwind_backward(Mark::from_raw(Direction::Backward, job.mark))?;
            return Err(e);
        }
        Ok(job)
    }

    fn push(&self, arena: &mut Bistack, external: &dyn ExternalMemory, job: &mut Job, at: CellRef) -> Result<(), Fault> {
        let header = cell::load(arena, external, at)?;
        // frames below the top are always lists with children; only those
        // count towards the walk limit
        let nested = matches!(header, CellHeader::List { count, .. } if count > 0);
        if job.depth + nested as u8 > MAX_WALK_DEPTH {
            return Err(Fault::DepthExceeded(MAX_WALK_DEPTH));
        }
        let next = match header {
            CellHeader::List { .. } => cell::body(arena, external, at, &header)?,
            _ => at,
        };
        let mark = arena.mark_backward()?.into_raw();
        let span = arena.alloc_backward(FRAME_LEN as usize)?;
        let frame = Frame {
            at,
            next,
            stage: Stage::Prefix,
            counter: 0,
            mark,
            below: job.top,
        };
        frame.store(arena, span.offset)?;
        job.top = span.offset;
        job.depth += 1;
        Ok(())
    }

    fn run<K: CharSink + ?Sized>(
        &self,
        arena: &mut Bistack,
        external: &dyn ExternalMemory,
        job: &mut Job,
        sink: &mut K,
    ) -> Result<PrintStatus, Fault> {
        loop {
            if job.newline {
                if !sink.put_char(b'\n') {
                    return Ok(PrintStatus::Blocked);
                }
                job.newline = false;
            }
            while job.spaces > 0 {
                if !sink.put_char(b' ') {
                    return Ok(PrintStatus::Blocked);
                }
                job.spaces -= 1;
            }
            let mut frame = Frame::load(arena, job.top)?;
            let header = cell::load(arena, external, frame.at)?;
            match self.step(arena, external, job, &mut frame, &header, sink)? {
                Emit::Blocked => return Ok(PrintStatus::Blocked),
                Emit::Progress => frame.store(arena, job.top)?,
                Emit::Descend(child) => {
                    frame.store(arena, job.top)?;
                    self.push(arena, external, job, child)?;
                }
                Emit::Finished(end) => {
                    arena.rewind(Mark::from_raw(Direction::Backward, frame.mark))?;
                    job.top = frame.below;
                    job.depth -= 1;
                    if job.top == 0 {
                        return Ok(PrintStatus::Done);
                    }
                    let mut parent = Frame::load(arena, job.top)?;
                    let CellHeader::List { count, .. } = cell::load(arena, external, parent.at)? else {
                        return Err(Fault::CorruptContext(job.top));
                    };
                    parent.counter += 1;
                    parent.stage = if parent.counter < count {
                        Stage::Separator
                    } else {
                        Stage::Close
                    };
                    parent.next = end;
                    parent.store(arena, job.top)?;
                }
            }
        }
    }

    /// Emit at most one character for the frame on top.
    fn step<K: CharSink + ?Sized>(
        &self,
        arena: &Bistack,
        external: &dyn ExternalMemory,
        job: &mut Job,
        frame: &mut Frame,
        header: &CellHeader,
        sink: &mut K,
    ) -> Result<Emit, Fault> {
        match frame.stage {
            Stage::Prefix => {
                let text = prefix_of(header).text();
                match text.get(frame.counter as usize) {
                    Some(&c) => {
                        if !sink.put_char(c) {
                            return Ok(Emit::Blocked);
                        }
                        frame.counter += 1;
                    }
                    None => {
                        frame.stage = Stage::Open;
                        frame.counter = 0;
                    }
                }
                Ok(Emit::Progress)
            }
            Stage::Open => {
                let opener = match *header {
                    CellHeader::Symbol { quoted, .. } => quoted.then_some(b'"'),
                    CellHeader::Integer { value } if value < 0 => Some(b'-'),
                    CellHeader::Integer { .. } => self.options.explicit_sign.then_some(b'+'),
                    CellHeader::List { .. } => Some(b'('),
                };
                if let Some(c) = opener {
                    if !sink.put_char(c) {
                        return Ok(Emit::Blocked);
                    }
                }
                frame.stage = Stage::Body;
                Ok(Emit::Progress)
            }
            Stage::Body => match *header {
                CellHeader::Symbol { len, quoted, .. } => {
                    if frame.counter >= len as u16 {
                        frame.stage = Stage::Close;
                        return Ok(Emit::Progress);
                    }
                    let c = self.symbol_char(arena, external, frame, header)?;
                    if quoted && (c == b'"' || c == b'\\') {
                        if !sink.put_char(b'\\') {
                            return Ok(Emit::Blocked);
                        }
                        frame.stage = Stage::Escaped;
                        return Ok(Emit::Progress);
                    }
                    if !sink.put_char(c) {
                        return Ok(Emit::Blocked);
                    }
                    frame.counter += 1;
                    Ok(Emit::Progress)
                }
                CellHeader::Integer { value } => {
                    let m = value.unsigned_abs();
                    let n = decimal_digits(m);
                    if frame.counter >= n {
                        frame.stage = Stage::Close;
                        return Ok(Emit::Progress);
                    }
                    if !sink.put_char(digit_at(m, n, frame.counter)) {
                        return Ok(Emit::Blocked);
                    }
                    frame.counter += 1;
                    Ok(Emit::Progress)
                }
                CellHeader::List { count, .. } => {
                    if frame.counter >= count {
                        frame.stage = Stage::Close;
                        return Ok(Emit::Progress);
                    }
                    Ok(Emit::Descend(frame.next))
                }
            },
            Stage::Escaped => {
                let c = self.symbol_char(arena, external, frame, header)?;
                if !sink.put_char(c) {
                    return Ok(Emit::Blocked);
                }
                frame.counter += 1;
                frame.stage = Stage::Body;
                Ok(Emit::Progress)
            }
            Stage::Separator => {
                let CellHeader::List { count, .. } = *header else {
                    return Err(Fault::CorruptContext(job.top));
                };
                let wrap = self.options.wrap_after;
                if wrap > 0 && count > wrap {
                    job.newline = true;
                    job.spaces = self.options.indent as u16 * job.depth as u16;
                } else if !sink.put_char(b' ') {
                    return Ok(Emit::Blocked);
                }
                frame.stage = Stage::Body;
                Ok(Emit::Progress)
            }
            Stage::Close => {
                let closer = match *header {
                    CellHeader::Symbol { quoted: true, .. } => Some(b'"'),
                    CellHeader::List { .. } => Some(b')'),
                    _ => None,
                };
                if let Some(c) = closer {
                    if !sink.put_char(c) {
                        return Ok(Emit::Blocked);
                    }
                }
                let end = match header {
                    CellHeader::List { is_ptr: false, .. } => frame.next,
                    _ => cell::step(frame.at, header.footprint())?,
                };
                Ok(Emit::Finished(end))
            }
        }
    }

    fn symbol_char(
        &self,
        arena: &Bistack,
        external: &dyn ExternalMemory,
        frame: &Frame,
        header: &CellHeader,
    ) -> Result<u8, Fault> {
        let chars = cell::body(arena, external, frame.at, header)?;
        let mut c = [0u8; 1];
        cell::fetch(arena, external, cell::step(chars, frame.counter)?, &mut c)?;
        Ok(c[0])
    }

    /// Write the closing syntax that would complete the reader's open
    /// expression: `""` after a dangling prefix, a closing quote for a
    /// quoted symbol, a placeholder digit for a bare sign, `)` for every
    /// open list.
    pub fn put_missing<K: CharSink + ?Sized>(
        &mut self,
        arena: &Bistack,
        reader: &Reader,
        sink: &mut K,
    ) -> Result<PrintStatus, Fault> {
        if self.job.is_some() {
            return Err(Fault::PrinterBusy);
        }
        let mut job = self.missing.take().unwrap_or_default();
        if !job.placed && reader.pending_prefix() {
            while let Some(&c) = PLACEHOLDER.get(job.emitted) {
                if !sink.put_char(c) {
                    self.missing = Some(job);
                    return Ok(PrintStatus::Blocked);
                }
                job.emitted += 1;
            }
            job.emitted = 0;
        }
        job.placed = true;
        while let Some(ctx) = reader.open_context(arena, job.closed)? {
            let text: &[u8] = match ctx {
                OpenContext::Symbol {
                    quoted: true,
                    escaped: true,
                } => b"\"\"",
                OpenContext::Symbol { quoted: true, .. } => b"\"",
                OpenContext::Integer { digits: false, .. } => b"0",
                OpenContext::List { .. } => b")",
                _ => b"",
            };
            while let Some(&c) = text.get(job.emitted) {
                if !sink.put_char(c) {
                    self.missing = Some(job);
                    return Ok(PrintStatus::Blocked);
                }
                job.emitted += 1;
            }
            job.closed += 1;
            job.emitted = 0;
        }
        Ok(PrintStatus::Done)
    }
}

/// Print `root` in full into a new string.
pub fn print_to_string(
    arena: &mut Bistack,
    external: &dyn ExternalMemory,
    root: CellRef,
    options: PrintOptions,
) -> Result<String, Fault> {
    let mut printer = Printer::new(options);
    let mut sink = StringSink::new();
    printer.pprint(arena, external, root, &mut sink)?;
    Ok(sink.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{read_from_str, ReadStatus};
    use crate::streams::{Backpressure, StrSource};

    fn read_one(arena: &mut Bistack, text: &str) -> CellRef {
        match read_from_str(arena, text).unwrap() {
            ReadStatus::Done(cell) => cell,
            ReadStatus::Pending => panic!("incomplete: {:?}", text),
        }
    }

    fn show(text: &str, options: PrintOptions) -> String {
        let mut arena = Bistack::new(1024).unwrap();
        let at = read_one(&mut arena, text);
        print_to_string(&mut arena, &(), at, options).unwrap()
    }

    #[test]
    fn test_print_atoms() {
        assert_eq!(show("foo", PrintOptions::default()), "foo");
        assert_eq!(show("42", PrintOptions::default()), "+42");
        assert_eq!(show("42", PrintOptions::compact()), "42");
        assert_eq!(show("-7", PrintOptions::compact()), "-7");
        assert_eq!(show("0", PrintOptions::compact()), "0");
        assert_eq!(show("-foo", PrintOptions::default()), "-foo");
    }

    #[test]
    fn test_print_lists() {
        let compact = PrintOptions::compact();
        assert_eq!(show("( a   (b c)\n () )", compact), "(a (b c) ())");
        assert_eq!(show("(1 -20 300)", PrintOptions::default()), "(+1 -20 +300)");
        assert_eq!(show("-(x)", compact), "-(x)");
    }

    #[test]
    fn test_print_prefixes() {
        let compact = PrintOptions::compact();
        assert_eq!(show("`(a ,b ,@c #'d)", compact), "`(a ,b ,@c #'d)");
        assert_eq!(show("'(&rest @x #(1))", compact), "'(&rest @x #(1))");
    }

    #[test]
    fn test_print_quoted_symbol() {
        let compact = PrintOptions::compact();
        assert_eq!(show(r#""a b""#, compact), r#""a b""#);
        assert_eq!(show(r#""q\"x\\y""#, compact), r#""q\"x\\y""#);
        assert_eq!(show(r#"'"""#, compact), r#"'"""#);
    }

    #[test]
    fn test_print_wrapped() {
        let options = PrintOptions {
            indent: 2,
            wrap_after: 2,
            explicit_sign: false,
        };
        assert_eq!(
            show("(define (move n) (cond (a 1) (b 2) (c 3)))", options),
            "(define\n  (move n)\n  (cond\n    (a 1)\n    (b 2)\n    (c 3)))"
        );
    }

    fn nest(arena: &mut Bistack, lists: usize) -> CellRef {
        let root = CellRef::arena(arena.forward());
        for _ in 0..lists {
            let span = arena.alloc_forward(2).unwrap();
            let header = CellHeader::List {
                count: 1,
                prefix: Prefix::None,
                is_ptr: false,
            };
            cell::store_header(arena, span.offset, &header).unwrap();
        }
        let span = arena.alloc_forward(4).unwrap();
        cell::store_header(arena, span.offset, &CellHeader::Integer { value: 7 }).unwrap();
        root
    }

    #[test]
    fn test_depth_matches_walk() {
        let depth = MAX_WALK_DEPTH as usize;
        let mut arena = Bistack::new(2048).unwrap();
        let at = nest(&mut arena, depth);
        assert!(cell::advance(&mut arena, &(), at).is_ok());
        let printed = print_to_string(&mut arena, &(), at, PrintOptions::compact()).unwrap();
        assert_eq!(printed, format!("{}7{}", "(".repeat(depth), ")".repeat(depth)));

        let mut arena = Bistack::new(2048).unwrap();
        let at = nest(&mut arena, depth + 1);
        let before = arena.backward();
        assert_eq!(
            cell::advance(&mut arena, &(), at),
            Err(Fault::DepthExceeded(MAX_WALK_DEPTH))
        );
        assert_eq!(
            print_to_string(&mut arena, &(), at, PrintOptions::compact()),
            Err(Fault::DepthExceeded(MAX_WALK_DEPTH))
        );
        assert_eq!(arena.backward(), before);
    }

    #[test]
    fn test_backpressure_resumes() {
        let mut arena = Bistack::new(1024).unwrap();
        let at = read_one(&mut arena, "(alpha \"b\\\"c\" (-12 (x)) 'y)");
        let expected = print_to_string(&mut arena, &(), at, PrintOptions::default()).unwrap();
        let before = arena.backward();

        let mut printer = Printer::default();
        let mut sink = Backpressure::new(StringSink::new(), 1);
        let mut rounds = 0;
        while printer.pprint(&mut arena, &(), at, &mut sink).unwrap() == PrintStatus::Blocked {
            assert!(printer.is_busy());
            sink.drain();
            rounds += 1;
        }
        assert_eq!(sink.inner().as_str(), expected);
        // one character per round; the last round finishes the job
        assert_eq!(rounds, expected.len() - 1);
        assert_eq!(arena.backward(), before);
        assert!(!printer.is_busy());
    }

    #[test]
    fn test_one_job_at_a_time() {
        let mut arena = Bistack::new(512).unwrap();
        let a = read_one(&mut arena, "(a b)");
        let b = read_one(&mut arena, "c");
        let mut printer = Printer::default();
        let mut sink = Backpressure::new(StringSink::new(), 2);
        assert_eq!(printer.pprint(&mut arena, &(), a, &mut sink).unwrap(), PrintStatus::Blocked);
        assert_eq!(printer.pprint(&mut arena, &(), b, &mut sink), Err(Fault::PrinterBusy));
        printer.abandon(&mut arena).unwrap();
        assert_eq!(arena.backward(), arena.capacity());
        sink.drain();
        assert_eq!(printer.pprint(&mut arena, &(), b, &mut sink).unwrap(), PrintStatus::Done);
    }

    fn missing_after(input: &str) -> String {
        let mut arena = Bistack::new(512).unwrap();
        let mut reader = Reader::default();
        let status = reader.read(&mut arena, &mut StrSource::new(input)).unwrap();
        assert_eq!(status, ReadStatus::Pending);
        let mut printer = Printer::default();
        let mut sink = StringSink::new();
        assert_eq!(printer.put_missing(&arena, &reader, &mut sink).unwrap(), PrintStatus::Done);
        sink.take()
    }

    #[test]
    fn test_put_missing() {
        assert_eq!(missing_after("\"ab"), "\"");
        assert_eq!(missing_after("(a (b \"c"), "\"))");
        assert_eq!(missing_after("(a (b c"), "))");
        assert_eq!(missing_after("\"a\\"), "\"\"");
        assert_eq!(missing_after("(1 2"), ")");
        assert_eq!(missing_after("   "), "");
    }

    #[test]
    fn test_put_missing_after_prefix() {
        for input in ["(a '", "(a #", "(x `", "(y #'", "`(z ,@", "'"] {
            let closing = missing_after(input);
            assert!(closing.starts_with("\"\""), "{:?} -> {:?}", input, closing);
            let mut arena = Bistack::new(512).unwrap();
            let full = format!("{}{}", input, closing);
            assert!(
                matches!(read_from_str(&mut arena, &full), Ok(ReadStatus::Done(_))),
                "{:?} does not read",
                full
            );
        }
        assert_eq!(missing_after("(a '"), "\"\")");
        // a bare sign already reads as a symbol
        assert_eq!(missing_after("(a -"), ")");
    }

    #[test]
    fn test_put_missing_completes_input() {
        let input = "(define (f x) \"open";
        let closing = missing_after(input);
        let mut arena = Bistack::new(512).unwrap();
        let full = format!("{}{}", input, closing);
        assert!(matches!(read_from_str(&mut arena, &full), Ok(ReadStatus::Done(_))));
    }

    #[test]
    fn test_put_missing_backpressure() {
        let mut arena = Bistack::new(512).unwrap();
        let mut reader = Reader::default();
        reader.read(&mut arena, &mut StrSource::new("((\"x")).unwrap();
        let mut printer = Printer::default();
        let mut sink = Backpressure::new(StringSink::new(), 1);
        let mut blocked = 0;
        while printer.put_missing(&arena, &reader, &mut sink).unwrap() == PrintStatus::Blocked {
            sink.drain();
            blocked += 1;
        }
        assert_eq!(blocked, 2);
        assert_eq!(sink.inner().as_str(), "\"))");
    }
}
