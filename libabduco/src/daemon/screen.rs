// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A bounded, line oriented buffer of recent pty output.
//!
//! The server feeds every chunk it reads from the pty through here
//! and replays the retained lines to a freshly attached client, so a
//! late attacher sees the output it missed. The buffer lives and dies
//! with the server process.

use std::collections::VecDeque;

use abduco_protocol::PAYLOAD_MAX;

#[derive(Debug)]
struct Line {
    data: Vec<u8>,
    complete: bool,
}

#[derive(Debug)]
pub struct ScreenBuffer {
    lines: VecDeque<Line>,
    max_lines: usize,
}

impl ScreenBuffer {
    pub fn new(max_lines: usize) -> ScreenBuffer {
        ScreenBuffer { lines: VecDeque::new(), max_lines }
    }

    /// Append a chunk of pty output, splitting it at newlines. A
    /// trailing partial line is extended in place by the next chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.max_lines == 0 || chunk.is_empty() {
            return;
        }

        let mut rest = chunk;
        while !rest.is_empty() {
            let (piece, complete) = match rest.iter().position(|&b| b == b'\n') {
                Some(idx) => (&rest[..=idx], true),
                None => (rest, false),
            };
            rest = &rest[piece.len()..];

            // a replayed line has to fit in one packet, so an
            // over-long line gets cut where the payload ends
            let extend = match self.lines.back() {
                Some(last) => !last.complete && last.data.len() + piece.len() <= PAYLOAD_MAX,
                None => false,
            };
            if extend {
                if let Some(last) = self.lines.back_mut() {
                    last.data.extend_from_slice(piece);
                    last.complete = complete;
                }
            } else {
                self.lines.push_back(Line { data: piece.to_vec(), complete });
                if self.lines.len() > self.max_lines {
                    self.lines.pop_front();
                }
            }
        }
    }

    /// The retained lines, oldest first, each at most one packet
    /// payload long.
    pub fn replay(&self) -> impl Iterator<Item = &[u8]> {
        self.lines.iter().map(|line| line.data.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collected(buf: &ScreenBuffer) -> Vec<Vec<u8>> {
        buf.replay().map(|l| l.to_vec()).collect()
    }

    #[test]
    fn chunks_split_at_newlines() {
        let mut buf = ScreenBuffer::new(10);
        buf.push(b"one\ntwo\nthr");
        assert_eq!(collected(&buf), vec![b"one\n".to_vec(), b"two\n".to_vec(), b"thr".to_vec()]);
    }

    #[test]
    fn partial_lines_are_extended() {
        let mut buf = ScreenBuffer::new(10);
        buf.push(b"hel");
        buf.push(b"lo\nwor");
        buf.push(b"ld");
        assert_eq!(collected(&buf), vec![b"hello\n".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn old_lines_fall_off_the_back() {
        let mut buf = ScreenBuffer::new(2);
        buf.push(b"a\nb\nc\nd\n");
        assert_eq!(collected(&buf), vec![b"c\n".to_vec(), b"d\n".to_vec()]);
    }

    #[test]
    fn zero_capacity_disables_the_buffer() {
        let mut buf = ScreenBuffer::new(0);
        buf.push(b"whatever\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn lines_never_outgrow_a_packet() {
        let mut buf = ScreenBuffer::new(4);
        buf.push(&vec![b'x'; PAYLOAD_MAX]);
        buf.push(&vec![b'y'; 10]);
        let lines = collected(&buf);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.len() <= PAYLOAD_MAX));
    }
}
