//! Rebuilds logical CSV records from physical lines.
//!
//! Subscriber dumps routinely contain free-text fields (addresses, memos)
//! with raw newlines inside them, which splits one record over several
//! physical lines. A line is taken as the start of a new record only when its
//! first two fields look like `<positive id><delim><phone number>`; anything
//! else following a record is glued onto it with a single space.
//!
//! The record-start test is a heuristic. It lives behind the `RecordStart`
//! trait so a different rule can be plugged in without touching the loop.

use crate::import::encoding::TextEncoding;
use rayon::prelude::*;
use regex::Regex;
use std::io::{self, BufRead};
use std::sync::Arc;

/// Decides whether a physical line opens a new logical record.
pub trait RecordStart: Send + Sync {
    fn is_record_start(&self, line: &str, delimiter: char) -> bool;
}

/// Default rule: first field is a positive integer id, second field is a
/// phone number of 10 to 15 digits once spaces, dashes, dots, plus signs and
/// parentheses are removed.
pub struct PhoneRecordStart {
    id_re: Regex,
    phone_re: Regex,
}

impl PhoneRecordStart {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            id_re: Regex::new(r"^\d+$")?,
            phone_re: Regex::new(r"^\d{10,15}$")?,
        })
    }
}

fn unquote(field: &str) -> &str {
    let f = field.trim();
    f.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(f)
        .trim()
}

impl RecordStart for PhoneRecordStart {
    fn is_record_start(&self, line: &str, delimiter: char) -> bool {
        let mut fields = line.split(delimiter);
        let (Some(id), Some(phone)) = (fields.next(), fields.next()) else {
            return false;
        };

        let id = unquote(id);
        if !self.id_re.is_match(id) || id.trim_start_matches('0').is_empty() {
            return false;
        }

        let phone: String = unquote(phone)
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '+' | '(' | ')'))
            .collect();
        self.phone_re.is_match(&phone)
    }
}

/// One physical line with its byte span in the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalLine {
    pub text: String,
    pub start: u64,
    pub end: u64,
}

impl PhysicalLine {
    fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Splits a byte stream into decoded lines, tracking absolute byte offsets.
pub struct PhysicalLines<R> {
    reader: R,
    encoding: TextEncoding,
    offset: u64,
    buf: Vec<u8>,
}

impl<R: BufRead> PhysicalLines<R> {
    /// `offset` is the absolute position the reader is already at.
    pub fn new(reader: R, encoding: TextEncoding, offset: u64) -> Self {
        Self {
            reader,
            encoding,
            offset,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for PhysicalLines<R> {
    type Item = io::Result<PhysicalLine>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        let read = match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => return None,
            Ok(n) => n as u64,
            Err(e) => return Some(Err(e)),
        };

        let start = self.offset;
        self.offset += read;

        let mut bytes = self.buf.as_slice();
        if let Some(rest) = bytes.strip_suffix(b"\n") {
            bytes = rest;
        }
        if let Some(rest) = bytes.strip_suffix(b"\r") {
            bytes = rest;
        }

        Some(Ok(PhysicalLine {
            text: self.encoding.decode(bytes),
            start,
            end: self.offset,
        }))
    }
}

/// A reconstructed record, possibly assembled from several physical lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalLine {
    pub text: String,
    /// Byte offset of the first physical line.
    pub start: u64,
    /// Byte offset just past the last physical line that belongs to it.
    pub end: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconstructed {
    Record(LogicalLine),
    /// A non-blank line seen while no record was open. Reported, not dropped.
    Orphan(LogicalLine),
}

impl Reconstructed {
    pub fn line(&self) -> &LogicalLine {
        match self {
            Reconstructed::Record(line) | Reconstructed::Orphan(line) => line,
        }
    }
}

/// Lazy, single-pass sequence of logical lines. It cannot be rewound;
/// resuming means building a new one over a reader positioned at a
/// checkpoint offset.
pub struct LineReconstructor<R> {
    lines: PhysicalLines<R>,
    predicate: Arc<dyn RecordStart>,
    delimiter: char,
    skip_header: bool,
    lookahead: Option<PhysicalLine>,
}

impl<R: BufRead> LineReconstructor<R> {
    pub fn new(
        lines: PhysicalLines<R>,
        predicate: Arc<dyn RecordStart>,
        delimiter: char,
        skip_header: bool,
    ) -> Self {
        Self {
            lines,
            predicate,
            delimiter,
            skip_header,
            lookahead: None,
        }
    }

    fn next_non_blank(&mut self) -> Option<io::Result<PhysicalLine>> {
        if let Some(line) = self.lookahead.take() {
            return Some(Ok(line));
        }
        loop {
            match self.lines.next()? {
                Ok(line) if line.is_blank() => continue,
                other => return Some(other),
            }
        }
    }
}

impl<R: BufRead> Iterator for LineReconstructor<R> {
    type Item = io::Result<Reconstructed>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.next_non_blank()? {
            Ok(line) => line,
            Err(e) => return Some(Err(e)),
        };

        let first = if self.skip_header {
            self.skip_header = false;
            match self.next_non_blank()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            }
        } else {
            first
        };

        if !self.predicate.is_record_start(&first.text, self.delimiter) {
            return Some(Ok(Reconstructed::Orphan(LogicalLine {
                text: first.text,
                start: first.start,
                end: first.end,
            })));
        }

        let mut record = LogicalLine {
            text: first.text,
            start: first.start,
            end: first.end,
        };

        loop {
            match self.lines.next() {
                None => break,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(line)) if line.is_blank() => continue,
                Some(Ok(line)) => {
                    if self.predicate.is_record_start(&line.text, self.delimiter) {
                        self.lookahead = Some(line);
                        break;
                    }
                    join_continuation(&mut record.text, &line.text, self.delimiter);
                    record.end = line.end;
                }
            }
        }

        Some(Ok(Reconstructed::Record(record)))
    }
}

fn is_padding(c: char, delimiter: char) -> bool {
    c.is_whitespace() && c != delimiter
}

/// Appends a wrapped continuation with exactly one space at the seam and
/// internal whitespace runs collapsed. The delimiter is never touched, even
/// when it is itself whitespace.
fn join_continuation(acc: &mut String, continuation: &str, delimiter: char) {
    let piece = continuation.trim_matches(|c| is_padding(c, delimiter));
    if piece.is_empty() {
        return;
    }
    let kept = acc.trim_end_matches(|c| is_padding(c, delimiter)).len();
    acc.truncate(kept);
    acc.push(' ');

    let mut in_run = false;
    for c in piece.chars() {
        if is_padding(c, delimiter) {
            if !in_run {
                acc.push(' ');
            }
            in_run = true;
        } else {
            acc.push(c);
            in_run = false;
        }
    }
}

const COUNT_CHUNK: usize = 50_000;

/// Counts logical records in a source for the progress denominator.
///
/// Record starts are tested in parallel per chunk of lines. Orphan lines are
/// only possible before the first record start, so they are counted
/// sequentially until one is seen.
pub fn count_logical_records<R: BufRead>(
    lines: PhysicalLines<R>,
    predicate: &dyn RecordStart,
    delimiter: char,
    skip_header: bool,
) -> io::Result<u64> {
    let mut total = 0u64;
    let mut header_pending = skip_header;
    let mut seen_start = false;
    let mut chunk: Vec<String> = Vec::with_capacity(COUNT_CHUNK);

    let flush = |chunk: &mut Vec<String>, seen_start: &mut bool| -> u64 {
        let mut orphans = 0u64;
        let mut first_start = chunk.len();
        if !*seen_start {
            for (i, line) in chunk.iter().enumerate() {
                if predicate.is_record_start(line, delimiter) {
                    *seen_start = true;
                    first_start = i;
                    break;
                }
                orphans += 1;
            }
        } else {
            first_start = 0;
        }
        let starts = chunk[first_start.min(chunk.len())..]
            .par_iter()
            .filter(|line| predicate.is_record_start(line, delimiter))
            .count() as u64;
        chunk.clear();
        orphans + starts
    };

    for line in lines {
        let line = line?;
        if line.is_blank() {
            continue;
        }
        if header_pending {
            header_pending = false;
            continue;
        }
        chunk.push(line.text);
        if chunk.len() == COUNT_CHUNK {
            total += flush(&mut chunk, &mut seen_start);
        }
    }
    if !chunk.is_empty() {
        total += flush(&mut chunk, &mut seen_start);
    }
    Ok(total)
}
