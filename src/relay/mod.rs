// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The processing logic of the filtering relay.
//!
//! The [`Relay`] structure is the heart of this module; see its
//! documentation for details.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::message::{Header, Rcode};
use crate::policy::DomainList;

pub mod pending;

use pending::{PendingRequest, PendingTable};

/// The default time after which an unanswered forwarded query is
/// forgotten.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

////////////////////////////////////////////////////////////////////////
// RELAY PUBLIC API AND CORE DATAGRAM-HANDLING LOGIC                  //
////////////////////////////////////////////////////////////////////////

/// A filtering DNS relay, abstracted from any underlying network I/O
/// provider.
///
/// Queries received from clients are checked against a [`DomainList`].
/// Accepted queries are forwarded to the upstream resolver under a fresh
/// transaction ID, and the resolver's responses are relayed back to the
/// clients that asked, with their own IDs restored. Denied queries are
/// answered immediately with a REFUSED response.
///
/// The [`Relay`] does no I/O itself. An I/O provider hands it each
/// received datagram through [`Relay::handle_datagram`], which rewrites
/// the datagram in place and returns an [`Action`] saying where (if
/// anywhere) to send it.
pub struct Relay {
    upstream: SocketAddr,
    domains: RwLock<Arc<DomainList>>,
    pending: Mutex<PendingTable>,
}

impl Relay {
    /// Creates a new `Relay` that forwards accepted queries to
    /// `upstream`. The first outbound ID is chosen at random, and
    /// unanswered queries are forgotten after
    /// [`DEFAULT_PENDING_TIMEOUT`].
    pub fn new(upstream: SocketAddr, domains: Arc<DomainList>) -> Self {
        Self {
            upstream,
            domains: RwLock::new(domains),
            pending: Mutex::new(PendingTable::new(
                rand::random(),
                Some(DEFAULT_PENDING_TIMEOUT),
            )),
        }
    }

    /// Sets how long a forwarded query may go unanswered before it is
    /// forgotten. `None` keeps queries pending until answered.
    pub fn set_pending_timeout(&self, timeout: Option<Duration>) {
        self.pending.lock().unwrap().set_timeout(timeout);
    }

    /// Returns how long a forwarded query may go unanswered before it
    /// is forgotten.
    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending.lock().unwrap().timeout()
    }

    /// Returns the upstream resolver's address.
    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Returns the current domain list of the relay.
    pub fn domains(&self) -> Arc<DomainList> {
        self.domains.read().unwrap().clone()
    }

    /// Sets the domain list of the `Relay`. A datagram already being
    /// handled may still be checked against the old list, but handling
    /// started after this call completes will see the new one.
    pub fn set_domains(&self, domains: Arc<DomainList>) {
        *self.domains.write().unwrap() = domains;
    }

    /// Returns the number of forwarded queries awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Handles a received datagram. This is the API through which I/O
    /// providers submit datagrams.
    ///
    /// `octets` holds the datagram as received, and is rewritten in
    /// place into the datagram to send (if any). `received_info` says
    /// where it came from. The returned [`Action`] says whether to send
    /// `octets` and, if so, from which endpoint and to what address.
    pub fn handle_datagram(&self, octets: &mut [u8], received_info: ReceivedInfo) -> Action {
        let mut header = match Header::parse(octets) {
            Ok(h) => h,
            Err(e) => {
                debug!(
                    "{} on {}: dropping {}-octet datagram: {e}",
                    received_info.source,
                    received_info.endpoint,
                    octets.len(),
                );
                return Action::Drop;
            }
        };

        if header.qr {
            self.handle_response(octets, &mut header, received_info)
        } else {
            self.handle_query(octets, &mut header, received_info)
        }
    }

    /// Handles a datagram with the QR bit clear.
    fn handle_query(
        &self,
        octets: &mut [u8],
        header: &mut Header,
        received_info: ReceivedInfo,
    ) -> Action {
        let accepted = match self.domains().accepts_query(header, octets) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(
                    "{} on {}: dropping query {:#06x}: malformed question: {e}",
                    received_info.source, received_info.endpoint, header.id,
                );
                return Action::Drop;
            }
        };

        if !accepted {
            info!(
                "{} query {:#06x} from {} ({} octets, {}): refused [{}]",
                received_info.endpoint,
                header.id,
                received_info.source,
                octets.len(),
                header.opcode,
                DisplayNames(header, octets),
            );
            header.qr = true;
            header.rcode = Rcode::Refused;
            return self.send(
                octets,
                header,
                received_info.endpoint,
                received_info.source,
            );
        }

        let original_id = header.id;
        let outbound_id = {
            let now = Instant::now();
            let mut pending = self.pending.lock().unwrap();
            let evicted = pending.evict_expired(now);
            if evicted > 0 {
                debug!("forgot {evicted} unanswered queries");
            }
            let id = pending.allocate_id();
            let request = PendingRequest {
                origin: received_info.endpoint,
                client: received_info.source,
                original_id,
                tracked_at: now,
            };
            if let Err(e) = pending.track(id, request) {
                warn!(
                    "{} on {}: dropping query {original_id:#06x}: {e}",
                    received_info.source, received_info.endpoint,
                );
                return Action::Drop;
            }
            id
        };

        info!(
            "{} query {original_id:#06x} from {} ({} octets, {}): forwarded as {outbound_id:#06x} [{}]",
            received_info.endpoint,
            received_info.source,
            octets.len(),
            header.opcode,
            DisplayNames(header, octets),
        );
        header.id = outbound_id;
        self.send(octets, header, Endpoint::Upstream, self.upstream)
    }

    /// Handles a datagram with the QR bit set.
    fn handle_response(
        &self,
        octets: &mut [u8],
        header: &mut Header,
        received_info: ReceivedInfo,
    ) -> Action {
        let request = self.pending.lock().unwrap().resolve(header.id);
        match request {
            Some(request) => {
                info!(
                    "{} response {:#06x} from {} ({} octets, {}): relayed to {} as {:#06x}",
                    received_info.endpoint,
                    header.id,
                    received_info.source,
                    octets.len(),
                    header.rcode,
                    request.client,
                    request.original_id,
                );
                header.id = request.original_id;
                self.send(octets, header, request.origin, request.client)
            }
            None => {
                info!(
                    "{} response {:#06x} from {} ({} octets, {}): no pending query, dropped",
                    received_info.endpoint,
                    header.id,
                    received_info.source,
                    octets.len(),
                    header.rcode,
                );
                Action::Drop
            }
        }
    }

    /// Writes `header` back into `octets` and produces the send action.
    fn send(
        &self,
        octets: &mut [u8],
        header: &Header,
        endpoint: Endpoint,
        dest: SocketAddr,
    ) -> Action {
        // The header was parsed from this buffer, so it is long enough.
        match header.write(octets) {
            Ok(()) => Action::Send { endpoint, dest },
            Err(_) => Action::Drop,
        }
    }

    /// Tells the relay that a datagram it asked to be sent could not
    /// be. If the datagram was a forwarded query, its pending entry is
    /// removed, since no response will arrive for it.
    pub fn send_failed(&self, octets: &[u8]) {
        if let Ok(header) = Header::parse(octets) {
            if !header.qr && self.pending.lock().unwrap().forget(header.id).is_some() {
                debug!("forgot query {:#06x} after failing to forward it", header.id);
            }
        }
    }
}

/// Formats the question names of a message for the log.
struct DisplayNames<'a>(&'a Header, &'a [u8]);

impl fmt::Display for DisplayNames<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, name) in self.0.question_names(self.1).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match name {
                Ok(name) => write!(f, "{name}")?,
                Err(e) => write!(f, "<{e}>")?,
            }
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// SUPPORTING TYPES                                                   //
////////////////////////////////////////////////////////////////////////

/// One of the sockets a [`Relay`] sends and receives on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Endpoint {
    /// A socket on which client queries are received, identified by its
    /// index among the I/O provider's listeners.
    Listener(usize),

    /// The socket used to talk to the upstream resolver.
    Upstream,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Listener(index) => write!(f, "listener {index}"),
            Self::Upstream => f.write_str("upstream"),
        }
    }
}

/// Information about a received datagram, which I/O providers pass to
/// [`Relay::handle_datagram`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReceivedInfo {
    pub endpoint: Endpoint,
    pub source: SocketAddr,
}

impl ReceivedInfo {
    /// Creates a new `ReceivedInfo`.
    pub fn new(endpoint: Endpoint, source: SocketAddr) -> Self {
        Self { endpoint, source }
    }
}

/// What an I/O provider should do with a datagram after
/// [`Relay::handle_datagram`] returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Send the (rewritten) datagram from `endpoint` to `dest`.
    Send { endpoint: Endpoint, dest: SocketAddr },

    /// Send nothing.
    Drop,
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const ADS_EXAMPLE_COM_QUERY: &[u8] =
        b"\xab\xcd\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\
          \x03ads\x07example\x03com\x00\x00\x01\x00\x01";

    const TRACKER_NET_QUERY: &[u8] =
        b"\x55\xaa\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\
          \x07tracker\x03net\x00\x00\x01\x00\x01";

    fn upstream() -> SocketAddr {
        (Ipv4Addr::new(192, 0, 2, 53), 53).into()
    }

    fn client() -> SocketAddr {
        (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 40000).into()
    }

    fn relay() -> Relay {
        Relay::new(
            upstream(),
            Arc::new(DomainList::from_masks(["example.com"])),
        )
    }

    fn from_client(listener: usize) -> ReceivedInfo {
        ReceivedInfo::new(Endpoint::Listener(listener), client())
    }

    fn from_upstream() -> ReceivedInfo {
        ReceivedInfo::new(Endpoint::Upstream, upstream())
    }

    /// Turns a forwarded query into the response an upstream resolver
    /// might send for it.
    fn answer(query: &[u8], rcode: Rcode) -> Vec<u8> {
        let mut response = query.to_vec();
        let mut header = Header::parse(&response).unwrap();
        header.qr = true;
        header.ra = true;
        header.rcode = rcode;
        header.write(&mut response).unwrap();
        response
    }

    #[test]
    fn accepted_query_is_forwarded_with_new_id() {
        let relay = relay();
        let mut buf = ADS_EXAMPLE_COM_QUERY.to_vec();
        let action = relay.handle_datagram(&mut buf, from_client(1));
        assert_eq!(
            action,
            Action::Send {
                endpoint: Endpoint::Upstream,
                dest: upstream(),
            }
        );
        assert_eq!(relay.pending_count(), 1);

        // Only the ID may change.
        let forwarded = Header::parse(&buf).unwrap();
        let original = Header::parse(ADS_EXAMPLE_COM_QUERY).unwrap();
        assert_eq!(Header { id: original.id, ..forwarded }, original);
        assert_eq!(&buf[2..], &ADS_EXAMPLE_COM_QUERY[2..]);
    }

    #[test]
    fn denied_query_is_refused_locally() {
        let relay = relay();
        let mut buf = TRACKER_NET_QUERY.to_vec();
        let action = relay.handle_datagram(&mut buf, from_client(0));
        assert_eq!(
            action,
            Action::Send {
                endpoint: Endpoint::Listener(0),
                dest: client(),
            }
        );
        assert_eq!(relay.pending_count(), 0);

        let header = Header::parse(&buf).unwrap();
        assert_eq!(header.id, 0x55aa);
        assert!(header.qr);
        assert!(header.rd);
        assert_eq!(header.rcode, Rcode::Refused);
        assert_eq!(buf[3] & 0x0f, 5);
        assert_eq!(&buf[4..], &TRACKER_NET_QUERY[4..]);
    }

    #[test]
    fn response_is_relayed_to_original_client() {
        let relay = relay();
        let mut buf = ADS_EXAMPLE_COM_QUERY.to_vec();
        relay.handle_datagram(&mut buf, from_client(1));

        let mut response = answer(&buf, Rcode::NxDomain);
        let action = relay.handle_datagram(&mut response, from_upstream());
        assert_eq!(
            action,
            Action::Send {
                endpoint: Endpoint::Listener(1),
                dest: client(),
            }
        );
        let header = Header::parse(&response).unwrap();
        assert_eq!(header.id, 0xabcd);
        assert_eq!(header.rcode, Rcode::NxDomain);
        assert_eq!(relay.pending_count(), 0);
    }

    #[test]
    fn pending_entry_is_removed_exactly_once() {
        let relay = relay();
        let mut buf = ADS_EXAMPLE_COM_QUERY.to_vec();
        relay.handle_datagram(&mut buf, from_client(0));
        let response = answer(&buf, Rcode::NoError);

        let mut first = response.clone();
        assert!(matches!(
            relay.handle_datagram(&mut first, from_upstream()),
            Action::Send { .. }
        ));
        let mut second = response;
        assert_eq!(
            relay.handle_datagram(&mut second, from_upstream()),
            Action::Drop
        );
    }

    #[test]
    fn unmatched_response_is_dropped() {
        let relay = relay();
        let mut response = answer(ADS_EXAMPLE_COM_QUERY, Rcode::NoError);
        let before = response.clone();
        assert_eq!(
            relay.handle_datagram(&mut response, from_upstream()),
            Action::Drop
        );
        assert_eq!(response, before);
    }

    #[test]
    fn forwarded_ids_are_unique_among_pending() {
        let relay = relay();
        let mut ids = HashSet::new();
        for _ in 0..500 {
            let mut buf = ADS_EXAMPLE_COM_QUERY.to_vec();
            relay.handle_datagram(&mut buf, from_client(0));
            assert!(ids.insert(Header::parse(&buf).unwrap().id));
        }
        assert_eq!(relay.pending_count(), 500);
    }

    #[test]
    fn short_datagrams_are_dropped() {
        let relay = relay();
        for len in 0..12 {
            let mut buf = ADS_EXAMPLE_COM_QUERY[..len].to_vec();
            assert_eq!(relay.handle_datagram(&mut buf, from_client(0)), Action::Drop);
        }
    }

    #[test]
    fn malformed_questions_are_dropped() {
        let relay = relay();
        let mut buf = ADS_EXAMPLE_COM_QUERY[..20].to_vec();
        assert_eq!(relay.handle_datagram(&mut buf, from_client(0)), Action::Drop);
        assert_eq!(relay.pending_count(), 0);
    }

    #[test]
    fn non_query_opcodes_are_forwarded() {
        let relay = Relay::new(upstream(), Arc::new(DomainList::new()));
        let mut buf = TRACKER_NET_QUERY.to_vec();
        buf[2] = 0x28; // UPDATE
        assert_eq!(
            relay.handle_datagram(&mut buf, from_client(0)),
            Action::Send {
                endpoint: Endpoint::Upstream,
                dest: upstream(),
            }
        );
    }

    #[test]
    fn set_domains_changes_policy() {
        let relay = relay();
        relay.set_domains(Arc::new(DomainList::from_masks(["net"])));
        assert_eq!(relay.domains().len(), 1);

        let mut buf = TRACKER_NET_QUERY.to_vec();
        assert!(matches!(
            relay.handle_datagram(&mut buf, from_client(0)),
            Action::Send {
                endpoint: Endpoint::Upstream,
                ..
            }
        ));
        let mut buf = ADS_EXAMPLE_COM_QUERY.to_vec();
        assert!(matches!(
            relay.handle_datagram(&mut buf, from_client(0)),
            Action::Send {
                endpoint: Endpoint::Listener(0),
                ..
            }
        ));
    }

    #[test]
    fn colliding_outbound_id_drops_query() {
        let relay = relay();
        {
            let mut pending = relay.pending.lock().unwrap();
            let id = pending.allocate_id();
            let request = PendingRequest {
                origin: Endpoint::Listener(0),
                client: client(),
                original_id: 0x0001,
                tracked_at: Instant::now(),
            };
            pending.track(id.wrapping_add(1), request).unwrap();
        }
        assert_eq!(relay.pending_count(), 1);

        let mut buf = ADS_EXAMPLE_COM_QUERY.to_vec();
        assert_eq!(relay.handle_datagram(&mut buf, from_client(0)), Action::Drop);
        assert_eq!(relay.pending_count(), 1);
        assert_eq!(buf, ADS_EXAMPLE_COM_QUERY);

        // The counter has moved past the collision.
        let mut buf = ADS_EXAMPLE_COM_QUERY.to_vec();
        assert_eq!(
            relay.handle_datagram(&mut buf, from_client(0)),
            Action::Send {
                endpoint: Endpoint::Upstream,
                dest: relay.upstream(),
            }
        );
        assert_eq!(relay.pending_count(), 2);
    }

    #[test]
    fn pending_timeout_is_adjustable() {
        let relay = relay();
        assert_eq!(relay.pending_timeout(), Some(DEFAULT_PENDING_TIMEOUT));
        relay.set_pending_timeout(None);
        assert_eq!(relay.pending_timeout(), None);
        relay.set_pending_timeout(Some(Duration::from_secs(5)));
        assert_eq!(relay.pending_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn send_failed_forgets_forwarded_query() {
        let relay = relay();
        let mut buf = ADS_EXAMPLE_COM_QUERY.to_vec();
        relay.handle_datagram(&mut buf, from_client(0));
        assert_eq!(relay.pending_count(), 1);

        let mut refused = TRACKER_NET_QUERY.to_vec();
        relay.handle_datagram(&mut refused, from_client(0));
        relay.send_failed(&refused);
        assert_eq!(relay.pending_count(), 1);

        relay.send_failed(&buf);
        assert_eq!(relay.pending_count(), 0);
    }
}
