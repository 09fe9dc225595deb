use std::collections::VecDeque;

use crate::impl_default;

/// Start character of an annotation.
pub const ANNOTATION_START: char = '<';
/// End character of an annotation.
pub const ANNOTATION_END: char = '>';
/// Terminator of a data frame.
pub const DATA_END: char = '\n';
/// Marker distinguishing controller events from log annotations.
pub const EVENT_MARKER: char = '!';

/// Splits the inbound byte stream into event annotations and data frames.
///
/// The controller interleaves `<...>` annotations with newline-terminated data
/// on the same stream, and annotations may appear in the middle of a forming
/// data line. Annotations can nest; inner annotations complete before outer
/// ones, so extraction repeatedly pulls the innermost well-formed annotation
/// until none remains, then pulls every complete data line.
///
/// An annotation whose body starts with `!` is a controller event and is
/// queued for the state machine. Any other annotation is a controller log
/// line, logged here and dropped.
///
/// The parser is a pure transducer: it owns no I/O and never blocks. Feed it
/// chunks with [push](Self::push), then drain [events](Self::events) and
/// [data](Self::data). Incomplete trailing input is retained for the next
/// chunk. Output is identical for any chunking of the same stream.
#[derive(Clone, Debug)]
pub struct FrameParser {
    buffer: String,
    events: VecDeque<String>,
    data: VecDeque<String>,
}

impl FrameParser {
    /// Creates an empty [FrameParser].
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            events: VecDeque::new(),
            data: VecDeque::new(),
        }
    }

    /// Consumes a chunk of stream input, queueing completed messages.
    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);

        while let Some((start, end)) = self.innermost_annotation() {
            let body = self.buffer[start + 1..end].trim_end().to_string();
            self.buffer.replace_range(start..=end, "");

            match body.strip_prefix(EVENT_MARKER) {
                Some(event) => self.events.push_back(event.to_string()),
                None => log::info!("controller log: {body}"),
            }
        }

        while let Some(pos) = self.buffer.find(DATA_END) {
            let line = self.buffer[..pos].trim_end().to_string();
            self.buffer.replace_range(..=pos, "");
            self.data.push_back(line);
        }
    }

    /// Drains queued controller events, in completion order.
    pub fn events(&mut self) -> impl Iterator<Item = String> + '_ {
        self.events.drain(..)
    }

    /// Drains queued data frames, in arrival order.
    pub fn data(&mut self) -> impl Iterator<Item = String> + '_ {
        self.data.drain(..)
    }

    /// Finds the first annotation that closes without containing another start
    /// character: byte range from its `<` to its `>`.
    ///
    /// Scanning for the earliest `>` preceded by a `<` yields annotations
    /// ordered by end position, which is how nested annotations complete on
    /// the wire. A `>` without a pending `<` is skipped, so malformed input
    /// can never make extraction loop without shrinking the buffer.
    fn innermost_annotation(&self) -> Option<(usize, usize)> {
        let mut start = None;

        for (idx, ch) in self.buffer.char_indices() {
            match ch {
                ANNOTATION_START => start = Some(idx),
                ANNOTATION_END => {
                    if let Some(start) = start {
                        return Some((start, idx));
                    }
                }
                _ => (),
            }
        }

        None
    }
}

impl_default!(FrameParser);
