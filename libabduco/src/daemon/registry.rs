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

//! The server's ordered set of connected clients.
//!
//! Order is meaningful: the client at the head of the list is the
//! primary client, the only one whose window size reaches the pty.
//! New clients are inserted at the head; low priority clients sink
//! themselves to the tail when they attach.

use std::os::unix::net::UnixStream;

use abduco_protocol::AttachFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Socket accepted, no ATTACH seen yet.
    Connected,
    /// The client has announced its window size and receives output.
    Attached,
    /// DETACH received, the record is reaped this tick.
    Detached,
    /// The socket failed or the client acknowledged an EXIT; the
    /// record is reaped this tick.
    Disconnected,
}

#[derive(Debug)]
pub struct Client {
    /// Stable identity, so dispatch can survive list reordering.
    pub id: u64,
    pub stream: UnixStream,
    pub state: ClientState,
    pub flags: AttachFlags,
    /// Bytes of already framed packets awaiting an unblocked socket.
    pub outbuf: Vec<u8>,
    /// The ATTACH handshake has been processed. Only such clients get
    /// the final EXIT packet, which also keeps it ordered after the
    /// attach-time replay; a liveness probe never sees an EXIT.
    pub has_attached: bool,
    /// The final EXIT packet only goes out once per client.
    pub exit_sent: bool,
}

impl Client {
    pub fn reapable(&self) -> bool {
        matches!(self.state, ClientState::Detached | ClientState::Disconnected)
    }
}

#[derive(Debug, Default)]
pub struct Reaped {
    /// Anything was removed at all.
    pub any: bool,
    /// The primary client left and another client took its place.
    pub head_replaced: bool,
    /// The list transitioned to empty.
    pub now_empty: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    clients: Vec<Client>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Insert a freshly accepted client at the head of the list,
    /// where it becomes the primary client.
    pub fn push_front(&mut self, stream: UnixStream) -> &mut Client {
        let id = self.next_id;
        self.next_id += 1;
        self.clients.insert(
            0,
            Client {
                id,
                stream,
                state: ClientState::Connected,
                flags: AttachFlags::default(),
                outbuf: Vec::new(),
                has_attached: false,
                exit_sent: false,
            },
        );
        &mut self.clients[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.clients.iter_mut()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.clients.iter().map(|c| c.id).collect()
    }

    pub fn by_id(&mut self, id: u64) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.id == id)
    }

    pub fn head_mut(&mut self) -> Option<&mut Client> {
        self.clients.first_mut()
    }

    pub fn is_head(&self, id: u64) -> bool {
        self.clients.first().map(|c| c.id == id).unwrap_or(false)
    }

    /// Move the given client to the tail of the list, handing primary
    /// duty to the next client up.
    pub fn sink_to_tail(&mut self, id: u64) {
        if let Some(idx) = self.clients.iter().position(|c| c.id == id) {
            let client = self.clients.remove(idx);
            self.clients.push(client);
        }
    }

    /// True when no client has pending output, which is the
    /// precondition for reading another chunk from the pty: a stuck
    /// client never causes more than one packet of buffering.
    pub fn all_drained(&self) -> bool {
        self.clients.iter().all(|c| c.outbuf.is_empty())
    }

    /// Drop every client whose state reached Detached or
    /// Disconnected, closing their sockets.
    pub fn reap(&mut self) -> Reaped {
        let mut reaped = Reaped::default();
        if self.clients.is_empty() {
            return reaped;
        }

        let head_id = self.clients[0].id;
        let before = self.clients.len();
        self.clients.retain(|c| !c.reapable());

        reaped.any = self.clients.len() != before;
        reaped.now_empty = reaped.any && self.clients.is_empty();
        reaped.head_replaced =
            reaped.any && !self.clients.is_empty() && self.clients[0].id != head_id;
        reaped
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sock() -> UnixStream {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        // _b drops, but the registry never reads in these tests
        a
    }

    fn registry_with(n: usize) -> Registry {
        let mut reg = Registry::new();
        for _ in 0..n {
            reg.push_front(sock());
        }
        reg
    }

    #[test]
    fn newest_client_is_primary() {
        let mut reg = registry_with(3);
        let ids = reg.ids();
        // ids count up as clients connect, so the head must be the
        // most recent connection
        assert_eq!(ids[0], 2);
        assert!(reg.is_head(2));
        assert!(!reg.is_head(0));
    }

    #[test]
    fn low_priority_clients_sink() {
        let mut reg = registry_with(3);
        reg.sink_to_tail(2);
        assert_eq!(reg.ids(), vec![1, 0, 2]);
        // sinking the only client is a no-op shuffle
        let mut reg = registry_with(1);
        reg.sink_to_tail(0);
        assert_eq!(reg.ids(), vec![0]);
    }

    #[test]
    fn reaping_the_head_promotes_the_next_client() {
        let mut reg = registry_with(3);
        reg.head_mut().unwrap().state = ClientState::Detached;
        let reaped = reg.reap();
        assert!(reaped.any);
        assert!(reaped.head_replaced);
        assert!(!reaped.now_empty);
        assert_eq!(reg.ids(), vec![1, 0]);
    }

    #[test]
    fn reaping_a_tail_client_keeps_the_head() {
        let mut reg = registry_with(3);
        reg.by_id(0).unwrap().state = ClientState::Disconnected;
        let reaped = reg.reap();
        assert!(reaped.any);
        assert!(!reaped.head_replaced);
        assert_eq!(reg.ids(), vec![2, 1]);
    }

    #[test]
    fn reaping_everyone_reports_empty() {
        let mut reg = registry_with(2);
        for c in reg.iter_mut() {
            c.state = ClientState::Disconnected;
        }
        let reaped = reg.reap();
        assert!(reaped.any);
        assert!(reaped.now_empty);
        assert!(!reaped.head_replaced);
        assert!(reg.is_empty());
    }

    #[test]
    fn reap_with_nothing_to_do_is_quiet() {
        let mut reg = registry_with(2);
        let reaped = reg.reap();
        assert!(!reaped.any);
        assert!(!reaped.head_replaced);
        assert!(!reaped.now_empty);
        assert_eq!(reg.len(), 2);
    }
}
