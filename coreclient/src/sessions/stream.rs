// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Receiver-side assembly of streamed messages.
//!
//! A stream arrives as a sequence of `stream_chunk` blocks with strictly
//! increasing chunk indices, terminated by a chunk with index -1. One
//! assembler lives inside every session's delivery task, keyed by sender.

use std::collections::HashMap;

use acpcommon::{
    identifiers::AgentId,
    messages::signalling::{Envelope, STREAM_TERMINATOR_INDEX},
};

/// Progress of a stream after observing one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamProgress {
    /// The envelope carried no stream chunks.
    NotAStream,
    /// A chunk was appended in order.
    Chunk,
    /// The terminator arrived; the payload is complete.
    Complete(String),
    /// A chunk arrived out of order. The stream is abandoned.
    Gap { expected: i64, got: i64 },
}

#[derive(Default)]
pub(crate) struct StreamAssembler {
    streams: HashMap<AgentId, PartialStream>,
}

struct PartialStream {
    next_index: i64,
    buffer: String,
}

impl StreamAssembler {
    /// Feed one envelope. Envelopes without stream chunks pass through
    /// untouched.
    pub(crate) fn observe(&mut self, envelope: &Envelope) -> StreamProgress {
        let chunks: Vec<_> = envelope
            .blocks
            .iter()
            .filter_map(|block| block.chunk_index().map(|index| (index, block)))
            .collect();
        if chunks.is_empty() {
            return StreamProgress::NotAStream;
        }

        let sender = envelope.sender().clone();
        let mut progress = StreamProgress::Chunk;
        for (index, block) in chunks {
            if index == STREAM_TERMINATOR_INDEX {
                let complete = self
                    .streams
                    .remove(&sender)
                    .map(|partial| partial.buffer)
                    .unwrap_or_default();
                progress = StreamProgress::Complete(complete);
                continue;
            }
            let partial = self.streams.entry(sender.clone()).or_insert(PartialStream {
                next_index: 0,
                buffer: String::new(),
            });
            if index == partial.next_index {
                partial.buffer.push_str(&block.content);
                partial.next_index += 1;
                progress = StreamProgress::Chunk;
            } else {
                let expected = partial.next_index;
                self.streams.remove(&sender);
                return StreamProgress::Gap {
                    expected,
                    got: index,
                };
            }
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use acpcommon::{
        identifiers::SessionId,
        messages::signalling::{Block, FrameType},
    };

    use super::*;

    fn chunk_envelope(index: i64, content: &str) -> Envelope {
        let alice: AgentId = "alice.example.com".parse().unwrap();
        let bob: AgentId = "bob.example.com".parse().unwrap();
        Envelope::new(
            FrameType::Msg,
            alice,
            vec![bob],
            vec![Block::stream_chunk(index, content)],
        )
        .with_session(SessionId::new("s".into()))
    }

    #[test]
    fn ten_chunks_then_terminator_reassemble() {
        let mut assembler = StreamAssembler::default();
        let mut expected = String::new();
        for i in 0..10 {
            let part = format!("part{i}-");
            expected.push_str(&part);
            assert_eq!(
                assembler.observe(&chunk_envelope(i, &part)),
                StreamProgress::Chunk
            );
        }
        let done = assembler.observe(&chunk_envelope(STREAM_TERMINATOR_INDEX, ""));
        assert_eq!(done, StreamProgress::Complete(expected));
    }

    #[test]
    fn gaps_abandon_the_stream() {
        let mut assembler = StreamAssembler::default();
        assert_eq!(
            assembler.observe(&chunk_envelope(0, "a")),
            StreamProgress::Chunk
        );
        assert_eq!(
            assembler.observe(&chunk_envelope(2, "c")),
            StreamProgress::Gap {
                expected: 1,
                got: 2
            }
        );
        // A fresh stream from the same sender starts over at zero.
        assert_eq!(
            assembler.observe(&chunk_envelope(0, "a")),
            StreamProgress::Chunk
        );
    }

    #[test]
    fn plain_envelopes_pass_through() {
        let mut assembler = StreamAssembler::default();
        let alice: AgentId = "alice.example.com".parse().unwrap();
        let bob: AgentId = "bob.example.com".parse().unwrap();
        let envelope =
            Envelope::new(FrameType::Msg, alice, vec![bob], vec![Block::content("x")]);
        assert_eq!(assembler.observe(&envelope), StreamProgress::NotAStream);
    }
}
