// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Per-thread transfer buffer (UTCB) and string parameter codec
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests + proptest (host)
//!
//! PUBLIC API:
//!   - Utcb: fixed-capacity message registers owned by one thread
//!   - MsgWriter / MsgReader: word and string marshalling
//!   - InStr: caller-side input string, OutStr: callee-side output capacity
//!   - Limits: decode limits (max string length)
//!
//! WIRE FORMAT (all words little-endian u64):
//!   - input string:  `[length][ceil(length / 8) words of bytes]`, last byte is 0
//!   - output request: `[capacity]`
//!   - output reply:  `[true length][ceil(min(length, capacity) / 8) words of bytes]`
//!   - optional:      `[valid 0|1]` followed by the payload only when valid
//!
//! INVARIANTS:
//!   - Decoded strings are views into the receiving buffer; their lifetime ends with the borrow
//!     of the buffer, so a handler cannot keep them past the call
//!   - Writers never emit a partial parameter: capacity is checked before the first byte
//!   - Readers never touch words beyond the transferred word count
//!   - Every output string written by `put_out_str` ends in a zero byte, truncated or not

use nexus_abi::{Error, Result};
use static_assertions::const_assert_eq;

/// Bytes per message word.
pub const WORD_BYTES: usize = 8;
/// Number of message words in a transfer buffer.
pub const MSG_WORDS: usize = 63;
/// Total capacity of a transfer buffer in bytes.
pub const UTCB_BYTES: usize = MSG_WORDS * WORD_BYTES;
/// Default upper bound for decoded string lengths (terminator included).
pub const DEFAULT_MAX_STRING_LEN: usize = 0xFFFF;

const_assert_eq!(UTCB_BYTES, 504);

/// Rounds `len` up to the next word boundary, `None` on overflow.
const fn padded(len: usize) -> Option<usize> {
    match len.checked_add(WORD_BYTES - 1) {
        Some(v) => Some(v / WORD_BYTES * WORD_BYTES),
        None => None,
    }
}

/// Checks that a reply of `header_words` words plus `capacity` string bytes fits a buffer.
fn reply_fits(capacity: usize, header_words: usize) -> Result<()> {
    match padded(capacity).and_then(|p| p.checked_add(header_words * WORD_BYTES)) {
        Some(need) if need <= UTCB_BYTES => Ok(()),
        _ => Err(Error::MessageTooShort),
    }
}

/// Limits applied while decoding strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted input string length, terminator included.
    pub max_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_string_len: DEFAULT_MAX_STRING_LEN }
    }
}

/// Fixed-capacity message registers of one thread.
#[derive(Clone, PartialEq, Eq)]
pub struct Utcb {
    bytes: [u8; UTCB_BYTES],
}

impl Default for Utcb {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Utcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Utcb").field("word0", &self.word(0)).finish_non_exhaustive()
    }
}

impl Utcb {
    /// Creates a zeroed buffer.
    pub const fn new() -> Self {
        Self { bytes: [0u8; UTCB_BYTES] }
    }

    /// Reads message word `idx`; `None` past the end of the buffer.
    pub fn word(&self, idx: usize) -> Option<u64> {
        let start = idx.checked_mul(WORD_BYTES)?;
        let raw = self.bytes.get(start..start.checked_add(WORD_BYTES)?)?;
        let mut word = [0u8; WORD_BYTES];
        word.copy_from_slice(raw);
        Some(u64::from_le_bytes(word))
    }

    /// Writes message word `idx`.
    pub fn set_word(&mut self, idx: usize, value: u64) -> Result<()> {
        let end = idx
            .checked_mul(WORD_BYTES)
            .and_then(|start| start.checked_add(WORD_BYTES))
            .ok_or(Error::MessageTooShort)?;
        let raw = self
            .bytes
            .get_mut(end - WORD_BYTES..end)
            .ok_or(Error::MessageTooShort)?;
        raw.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Writes message word 0, which every buffer has.
    pub fn set_head(&mut self, value: u64) {
        self.bytes[..WORD_BYTES].copy_from_slice(&value.to_le_bytes());
    }

    /// Raw view of the whole buffer.
    pub fn as_bytes(&self) -> &[u8; UTCB_BYTES] {
        &self.bytes
    }

    /// Copies the first `words` message words of `src`, like the kernel does on transfer.
    pub fn copy_words_from(&mut self, src: &Utcb, words: usize) {
        let len = words.min(MSG_WORDS) * WORD_BYTES;
        self.bytes[..len].copy_from_slice(&src.bytes[..len]);
    }

    /// Returns `true` when `view` lies entirely inside this buffer.
    ///
    /// Handlers use this to assert that a decoded parameter was not smuggled in from elsewhere.
    pub fn contains(&self, view: &[u8]) -> bool {
        let base = self.bytes.as_ptr() as usize;
        let start = view.as_ptr() as usize;
        match start.checked_add(view.len()) {
            Some(end) => start >= base && end <= base + UTCB_BYTES,
            None => false,
        }
    }

    /// Starts writing a message at word 0.
    pub fn writer(&mut self) -> MsgWriter<'_> {
        MsgWriter { bytes: &mut self.bytes, pos: 0 }
    }

    /// Reads a message of `words` transferred words.
    pub fn reader(&self, words: usize, limits: Limits) -> MsgReader<'_> {
        let len = words.min(MSG_WORDS) * WORD_BYTES;
        MsgReader { bytes: &self.bytes[..len], pos: 0, limits }
    }
}

/// Input string as supplied by a caller: `length` bytes, the last of which is sent as `0`.
///
/// Bytes between the end of `data` and `length` are sent as zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InStr<'a> {
    length: usize,
    data: &'a [u8],
}

impl<'a> InStr<'a> {
    /// Raw parameter with an explicit declared length.
    pub const fn new(length: usize, data: &'a [u8]) -> Self {
        Self { length, data }
    }

    /// Parameter carrying `value` plus a terminator (`length = value.len() + 1`).
    pub const fn bytes(value: &'a [u8]) -> Self {
        Self { length: value.len() + 1, data: value }
    }

    /// Declared length, terminator included.
    pub const fn length(&self) -> usize {
        self.length
    }
}

impl<'a> From<&'a str> for InStr<'a> {
    fn from(value: &'a str) -> Self {
        Self::bytes(value.as_bytes())
    }
}

/// Output capacity announced by the caller, as seen by the callee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutStr {
    capacity: usize,
}

impl OutStr {
    /// Wraps a caller-declared capacity.
    pub const fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Bytes the caller can accept, terminator included.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Sequential message writer.
pub struct MsgWriter<'a> {
    bytes: &'a mut [u8; UTCB_BYTES],
    pos: usize,
}

impl<'a> MsgWriter<'a> {
    /// Number of words written so far.
    pub fn words(&self) -> usize {
        self.pos / WORD_BYTES
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        UTCB_BYTES - self.pos
    }

    fn reserve(&self, need: Option<usize>) -> Result<usize> {
        match need {
            Some(need) if need <= self.remaining() => Ok(need),
            _ => Err(Error::MessageTooShort),
        }
    }

    fn raw_word(&mut self, value: u64) {
        self.bytes[self.pos..self.pos + WORD_BYTES].copy_from_slice(&value.to_le_bytes());
        self.pos += WORD_BYTES;
    }

    /// Copies `len` bytes (zero-filled past `src`) and pads to a word boundary.
    fn raw_bytes(&mut self, src: &[u8], len: usize) {
        let take = src.len().min(len);
        let end = self.pos + len;
        self.bytes[self.pos..self.pos + take].copy_from_slice(&src[..take]);
        self.bytes[self.pos + take..end].fill(0);
        let aligned = self.pos + padded(len).unwrap_or(len);
        self.bytes[end..aligned].fill(0);
        self.pos = aligned;
    }

    /// Appends one word.
    pub fn put_word(&mut self, value: u64) -> Result<()> {
        self.reserve(Some(WORD_BYTES))?;
        self.raw_word(value);
        Ok(())
    }

    /// Appends an input string. The final byte is always sent as `0`.
    pub fn put_in_str(&mut self, s: InStr<'_>) -> Result<()> {
        if s.length == 0 {
            return Err(Error::MessageTooShort);
        }
        self.reserve(padded(s.length).and_then(|p| p.checked_add(WORD_BYTES)))?;
        self.raw_word(s.length as u64);
        let start = self.pos;
        self.raw_bytes(s.data, s.length);
        self.bytes[start + s.length - 1] = 0;
        Ok(())
    }

    /// Appends an optional input string.
    pub fn put_opt_in_str(&mut self, s: Option<InStr<'_>>) -> Result<()> {
        match s {
            None => self.put_word(0),
            Some(s) => {
                if s.length == 0 {
                    return Err(Error::MessageTooShort);
                }
                self.reserve(padded(s.length).and_then(|p| p.checked_add(2 * WORD_BYTES)))?;
                self.raw_word(1);
                self.put_in_str(s)
            }
        }
    }

    /// Announces an output buffer of `capacity` bytes.
    ///
    /// Fails when a reply carrying `capacity` bytes (plus status and length words) could never
    /// fit in a transfer buffer.
    pub fn put_out_request(&mut self, capacity: usize) -> Result<()> {
        reply_fits(capacity, 2)?;
        self.put_word(capacity as u64)
    }

    /// Announces an optional output buffer.
    ///
    /// The reply then also carries the validity flag, so the budget is one word tighter than
    /// for [`MsgWriter::put_out_request`].
    pub fn put_opt_out_request(&mut self, capacity: Option<usize>) -> Result<()> {
        match capacity {
            None => self.put_word(0),
            Some(capacity) => {
                reply_fits(capacity, 3)?;
                self.reserve(Some(2 * WORD_BYTES))?;
                self.raw_word(1);
                self.raw_word(capacity as u64);
                Ok(())
            }
        }
    }

    /// Writes `value` into the caller's output buffer.
    ///
    /// Copies `min(value.len(), capacity)` bytes, forces the last copied byte to `0` and reports
    /// the untruncated `value.len()` so the caller can detect truncation. Returns the number of
    /// bytes copied.
    pub fn put_out_str(&mut self, out: OutStr, value: &[u8]) -> Result<usize> {
        if out.capacity == 0 || value.is_empty() {
            return Err(Error::MessageTooShort);
        }
        let copied = value.len().min(out.capacity);
        self.reserve(padded(copied).and_then(|p| p.checked_add(WORD_BYTES)))?;
        self.raw_word(value.len() as u64);
        let start = self.pos;
        self.raw_bytes(value, copied);
        self.bytes[start + copied - 1] = 0;
        Ok(copied)
    }

    /// Writes an optional output string; `None` only sends the cleared validity flag.
    pub fn put_opt_out_str(&mut self, out: OutStr, value: Option<&[u8]>) -> Result<usize> {
        match value {
            None => self.put_word(0).map(|()| 0),
            Some(value) => {
                if out.capacity == 0 || value.is_empty() {
                    return Err(Error::MessageTooShort);
                }
                let copied = value.len().min(out.capacity);
                self.reserve(padded(copied).and_then(|p| p.checked_add(2 * WORD_BYTES)))?;
                self.raw_word(1);
                self.put_out_str(out, value)
            }
        }
    }
}

/// Sequential message reader bounded by the transferred word count.
pub struct MsgReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    limits: Limits,
}

impl<'a> MsgReader<'a> {
    /// Bytes left in the transferred message.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Limits in force for this reader.
    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Reads one word.
    pub fn get_word(&mut self) -> Result<u64> {
        let raw = self
            .bytes
            .get(self.pos..self.pos + WORD_BYTES)
            .ok_or(Error::MessageTooShort)?;
        let mut word = [0u8; WORD_BYTES];
        word.copy_from_slice(raw);
        self.pos += WORD_BYTES;
        Ok(u64::from_le_bytes(word))
    }

    fn get_flag(&mut self) -> Result<bool> {
        match self.get_word()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Reads an input string and returns its value without the terminator.
    ///
    /// Checks, in order: non-zero length (`InvalidLength`), payload present in the transferred
    /// words (`MessageTooShort`), length within `max_string_len` (`InvalidLength`), final zero
    /// byte (`NotTerminated`). Nothing is consumed when a check fails.
    pub fn get_in_str(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let result = self.in_str_body();
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    fn in_str_body(&mut self) -> Result<&'a [u8]> {
        let declared = self.get_word()?;
        if declared == 0 {
            return Err(Error::InvalidLength);
        }
        if declared > self.remaining() as u64 {
            return Err(Error::MessageTooShort);
        }
        let length = declared as usize;
        if length > self.limits.max_string_len {
            return Err(Error::InvalidLength);
        }
        let bytes: &'a [u8] = self.bytes;
        let raw = &bytes[self.pos..self.pos + length];
        if raw[length - 1] != 0 {
            return Err(Error::NotTerminated);
        }
        self.pos += padded(length).unwrap_or(length).min(self.remaining());
        Ok(&raw[..length - 1])
    }

    /// Reads an optional input string.
    pub fn get_opt_in_str(&mut self) -> Result<Option<&'a [u8]>> {
        if self.get_flag()? {
            self.get_in_str().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reads the caller's output capacity.
    pub fn get_out_request(&mut self) -> Result<OutStr> {
        let capacity = usize::try_from(self.get_word()?).map_err(|_| Error::MessageTooShort)?;
        Ok(OutStr::new(capacity))
    }

    /// Reads an optional output capacity.
    pub fn get_opt_out_request(&mut self) -> Result<Option<OutStr>> {
        if self.get_flag()? {
            self.get_out_request().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Copies a returned output string into `dst` and returns the reported length.
    ///
    /// A reported length greater than `dst.len()` means the value was truncated.
    pub fn get_out_str(&mut self, dst: &mut [u8]) -> Result<usize> {
        let reported = usize::try_from(self.get_word()?).map_err(|_| Error::MessageTooShort)?;
        let copied = reported.min(dst.len());
        let raw = self
            .bytes
            .get(self.pos..self.pos + copied)
            .ok_or(Error::MessageTooShort)?;
        dst[..copied].copy_from_slice(raw);
        self.pos += padded(copied).unwrap_or(copied).min(self.remaining());
        Ok(reported)
    }

    /// Reads an optional output string; `dst` is left untouched when absent.
    pub fn get_opt_out_str(&mut self, dst: &mut [u8]) -> Result<Option<usize>> {
        if self.get_flag()? {
            self.get_out_str(dst).map(Some)
        } else {
            Ok(None)
        }
    }
}
