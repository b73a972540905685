// ThinLisp Streams - Character Sources and Sinks
//
// Non-blocking single-character input and output used by the reader and
// the printer.

use std::collections::VecDeque;

/// Non-blocking character input. `None` means no character is available
/// right now, not end of input.
pub trait CharSource {
    fn get_char(&mut self) -> Option<u8>;
}

/// Non-blocking character output. `false` means the character was not
/// accepted and must be offered again later.
pub trait CharSink {
    fn put_char(&mut self, c: u8) -> bool;
}

impl<F: FnMut() -> Option<u8>> CharSource for F {
    fn get_char(&mut self) -> Option<u8> {
        self()
    }
}

/// Reads from a borrowed string.
#[derive(Debug, Clone)]
pub struct StrSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> StrSource<'a> {
    pub fn new(text: &'a str) -> Self {
        Self::from_bytes(text.as_bytes())
    }

    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl CharSource for StrSource<'_> {
    fn get_char(&mut self) -> Option<u8> {
        let c = self.bytes.get(self.pos).copied()?;
        self.pos += 1;
        Some(c)
    }
}

/// Queue fed line by line, e.g. from an interactive editor.
#[derive(Debug, Default, Clone)]
pub struct LineFeed {
    pending: VecDeque<u8>,
}

impl LineFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `line` followed by a newline.
    pub fn push_line(&mut self, line: &str) {
        self.pending.extend(line.bytes());
        self.pending.push_back(b'\n');
    }

    pub fn push_str(&mut self, text: &str) {
        self.pending.extend(text.bytes());
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl CharSource for LineFeed {
    fn get_char(&mut self) -> Option<u8> {
        self.pending.pop_front()
    }
}

/// Hands out at most `burst` characters of the inner source between
/// reported stalls.
#[derive(Debug, Clone)]
pub struct Stutter<S> {
    inner: S,
    burst: usize,
    served: usize,
}

impl<S: CharSource> Stutter<S> {
    pub fn new(inner: S, burst: usize) -> Self {
        Self {
            inner,
            burst: burst.max(1),
            served: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: CharSource> CharSource for Stutter<S> {
    fn get_char(&mut self) -> Option<u8> {
        if self.served == self.burst {
            self.served = 0;
            return None;
        }
        let c = self.inner.get_char()?;
        self.served += 1;
        Some(c)
    }
}

/// Unbounded sink collecting output in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StringSink {
    bytes: Vec<u8>,
}

impl StringSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }

    /// Take the collected text, leaving the sink empty.
    pub fn take(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.bytes)).into_owned()
    }
}

impl CharSink for StringSink {
    fn put_char(&mut self, c: u8) -> bool {
        self.bytes.push(c);
        true
    }
}

/// Accepts `capacity` characters per `drain`, then refuses.
#[derive(Debug, Clone)]
pub struct Backpressure<K> {
    inner: K,
    capacity: usize,
    budget: usize,
}

impl<K: CharSink> Backpressure<K> {
    pub fn new(inner: K, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            budget: capacity,
        }
    }

    /// Make room for another `capacity` characters.
    pub fn drain(&mut self) {
        self.budget = self.capacity;
    }

    pub fn inner(&self) -> &K {
        &self.inner
    }

    pub fn into_inner(self) -> K {
        self.inner
    }
}

impl<K: CharSink> CharSink for Backpressure<K> {
    fn put_char(&mut self, c: u8) -> bool {
        if self.budget == 0 || !self.inner.put_char(c) {
            return false;
        }
        self.budget -= 1;
        true
    }
}

impl<K: CharSink + ?Sized> CharSink for &mut K {
    fn put_char(&mut self, c: u8) -> bool {
        (**self).put_char(c)
    }
}
