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

//! The wire protocol spoken between an abduco client and a session
//! server. Every message in either direction is a single packet: a
//! fixed 8 byte header (kind and payload length, both little endian
//! u32) followed by at most [`PAYLOAD_MAX`] payload bytes.
//!
//! Both endpoints are the same binary on the same host, so there is no
//! versioning or negotiation, just framing.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of the fixed packet header: two little endian u32s.
pub const HEADER_SIZE: usize = 8;

/// A whole packet never exceeds 4 KiB, matching typical pipe
/// atomicity, so the payload gets whatever the header leaves over.
pub const PAYLOAD_MAX: usize = 4096 - HEADER_SIZE;

const KIND_CONTENT: u32 = 0;
const KIND_ATTACH: u32 = 1;
const KIND_DETACH: u32 = 2;
const KIND_RESIZE: u32 = 3;
const KIND_EXIT: u32 = 4;
const KIND_PID: u32 = 5;

const FLAG_READ_ONLY: u32 = 1 << 0;
const FLAG_LOW_PRIORITY: u32 = 1 << 1;

/// The flag word carried by an ATTACH packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttachFlags {
    /// Input from this client is dropped by the server.
    pub read_only: bool,
    /// This client never drives the pty window size and sinks to the
    /// tail of the server's client list on attach.
    pub low_priority: bool,
}

impl AttachFlags {
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.read_only {
            bits |= FLAG_READ_ONLY;
        }
        if self.low_priority {
            bits |= FLAG_LOW_PRIORITY;
        }
        bits
    }

    /// Unknown bits are ignored rather than rejected so that an older
    /// server keeps working against a newer client.
    pub fn from_bits(bits: u32) -> AttachFlags {
        AttachFlags {
            read_only: bits & FLAG_READ_ONLY != 0,
            low_priority: bits & FLAG_LOW_PRIORITY != 0,
        }
    }
}

/// The size of a client's terminal, as carried by a RESIZE packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Opaque terminal bytes. An empty CONTENT packet serves as the
    /// server's attach acknowledgement.
    Content(Vec<u8>),
    /// The first packet a client sends after connecting.
    Attach(AttachFlags),
    /// Graceful disconnect request from a client.
    Detach,
    /// A window size announcement. The server sends an empty RESIZE
    /// (`None`) to ask the new primary client to re-announce its size.
    Resize(Option<WinSize>),
    /// The child's exit status. Sent by the server once the child is
    /// gone, echoed back by the client as a delivery acknowledgement.
    Exit(i32),
    /// The server's greeting, sent on every accepted connection.
    Pid(u64),
    /// A kind this build does not know about. The payload was consumed
    /// and discarded; dispatchers ignore the packet.
    Unknown { kind: u32 },
}

impl Packet {
    fn kind(&self) -> u32 {
        match self {
            Packet::Content(_) => KIND_CONTENT,
            Packet::Attach(_) => KIND_ATTACH,
            Packet::Detach => KIND_DETACH,
            Packet::Resize(_) => KIND_RESIZE,
            Packet::Exit(_) => KIND_EXIT,
            Packet::Pid(_) => KIND_PID,
            Packet::Unknown { kind } => *kind,
        }
    }

    /// Serialize to header + payload bytes.
    ///
    /// Panics if a CONTENT payload exceeds [`PAYLOAD_MAX`]; callers
    /// chunk their reads to at most that size.
    pub fn encode(&self) -> Vec<u8> {
        let payload: Vec<u8> = match self {
            Packet::Content(buf) => {
                assert!(buf.len() <= PAYLOAD_MAX, "oversized content packet");
                buf.clone()
            }
            Packet::Attach(flags) => {
                let mut b = [0; 4];
                LittleEndian::write_u32(&mut b, flags.bits());
                b.to_vec()
            }
            Packet::Detach | Packet::Unknown { .. } => vec![],
            Packet::Resize(None) => vec![],
            Packet::Resize(Some(ws)) => {
                let mut b = [0; 4];
                LittleEndian::write_u16(&mut b[..2], ws.rows);
                LittleEndian::write_u16(&mut b[2..], ws.cols);
                b.to_vec()
            }
            Packet::Exit(status) => {
                let mut b = [0; 4];
                LittleEndian::write_i32(&mut b, *status);
                b.to_vec()
            }
            Packet::Pid(pid) => {
                let mut b = [0; 8];
                LittleEndian::write_u64(&mut b, *pid);
                b.to_vec()
            }
        };

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        let mut hdr = [0; HEADER_SIZE];
        LittleEndian::write_u32(&mut hdr[..4], self.kind());
        LittleEndian::write_u32(&mut hdr[4..], payload.len() as u32);
        out.extend_from_slice(&hdr);
        out.extend_from_slice(&payload);
        out
    }

    /// Write the whole packet, retrying transient errors. Transient
    /// means EINTR and EAGAIN; on a non-blocking socket this spins
    /// until the kernel buffer drains, which is bounded by the packet
    /// size.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let bytes = self.encode();
        let mut written = 0;
        while written < bytes.len() {
            match w.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting packet bytes",
                    ));
                }
                Ok(n) => written += n,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read one packet from `r`.
    ///
    /// Returns `Ok(None)` when the stream is non-blocking and not even
    /// the first header byte is available; the caller retries on the
    /// next readiness event. Once any header byte has arrived the rest
    /// of the packet is read to completion (the sender writes packets
    /// as a unit, so the remainder is already in flight). Any EOF,
    /// short read, or a length field above [`PAYLOAD_MAX`] is an error
    /// and the caller must treat the peer as disconnected.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Packet>> {
        let mut hdr = [0u8; HEADER_SIZE];
        match read_exact_retrying(r, &mut hdr) {
            ReadOutcome::Done => {}
            ReadOutcome::NotReady => return Ok(None),
            ReadOutcome::Failed(e) => return Err(e),
        }

        let kind = LittleEndian::read_u32(&hdr[..4]);
        let len = LittleEndian::read_u32(&hdr[4..]) as usize;
        if len > PAYLOAD_MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet length {len} exceeds limit of {PAYLOAD_MAX} bytes"),
            ));
        }

        let mut payload = vec![0u8; len];
        if len > 0 {
            match read_exact_retrying(r, &mut payload) {
                // NotReady after a complete header still means the
                // peer went quiet mid packet.
                ReadOutcome::Done => {}
                ReadOutcome::NotReady | ReadOutcome::Failed(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "packet truncated after header",
                    ));
                }
            }
        }

        Ok(Some(Packet::from_parts(kind, payload)?))
    }

    fn from_parts(kind: u32, payload: Vec<u8>) -> io::Result<Packet> {
        Ok(match kind {
            KIND_CONTENT => Packet::Content(payload),
            KIND_ATTACH => {
                expect_len(kind, &payload, 4)?;
                Packet::Attach(AttachFlags::from_bits(LittleEndian::read_u32(&payload)))
            }
            KIND_DETACH => Packet::Detach,
            KIND_RESIZE if payload.is_empty() => Packet::Resize(None),
            KIND_RESIZE => {
                expect_len(kind, &payload, 4)?;
                Packet::Resize(Some(WinSize {
                    rows: LittleEndian::read_u16(&payload[..2]),
                    cols: LittleEndian::read_u16(&payload[2..]),
                }))
            }
            KIND_EXIT => {
                expect_len(kind, &payload, 4)?;
                Packet::Exit(LittleEndian::read_i32(&payload))
            }
            KIND_PID => {
                expect_len(kind, &payload, 8)?;
                Packet::Pid(LittleEndian::read_u64(&payload))
            }
            _ => Packet::Unknown { kind },
        })
    }
}

fn expect_len(kind: u32, payload: &[u8], want: usize) -> io::Result<()> {
    if payload.len() == want {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad payload length {} for packet kind {kind}", payload.len()),
        ))
    }
}

enum ReadOutcome {
    Done,
    NotReady,
    Failed(io::Error),
}

fn read_exact_retrying<R: Read>(r: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut nread = 0;
    while nread < buf.len() {
        match r.read(&mut buf[nread..]) {
            Ok(0) => {
                return ReadOutcome::Failed(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                ));
            }
            Ok(n) => nread += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && nread == 0 => {
                return ReadOutcome::NotReady;
            }
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
    ReadOutcome::Done
}
