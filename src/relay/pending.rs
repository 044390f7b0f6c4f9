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

//! Implementation of the [`PendingTable`], which correlates forwarded
//! queries with the clients that sent them.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::Endpoint;

////////////////////////////////////////////////////////////////////////
// PENDING REQUESTS                                                   //
////////////////////////////////////////////////////////////////////////

/// What we need to remember about a forwarded query in order to return
/// the upstream response to its client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingRequest {
    /// The endpoint the query arrived on, which the response leaves by.
    pub origin: Endpoint,

    /// The client's address.
    pub client: SocketAddr,

    /// The ID the client used, restored in the response.
    pub original_id: u16,

    /// When the query was forwarded.
    pub tracked_at: Instant,
}

////////////////////////////////////////////////////////////////////////
// THE TABLE                                                          //
////////////////////////////////////////////////////////////////////////

/// Maps the IDs of forwarded queries to the [`PendingRequest`]s they
/// were forwarded for, and allocates those IDs.
///
/// IDs come from a wrapping 16-bit counter. Allocation and insertion
/// are separate calls, so callers that share a table between threads
/// must hold one lock across both (as [`Relay`](super::Relay) does).
///
/// Entries leave the table when resolved or forgotten. If a timeout is
/// configured, entries older than it are also evicted whenever
/// [`PendingTable::evict_expired`] is called; without one, a query that
/// is never answered stays pending until its ID comes around again.
#[derive(Debug)]
pub struct PendingTable {
    next_id: u16,
    timeout: Option<Duration>,
    entries: HashMap<u16, PendingRequest>,

    /// IDs in the order they were tracked, for eviction. Only kept
    /// while there is a timeout. May hold IDs that have since been
    /// resolved or reused.
    order: VecDeque<(u16, Instant)>,
}

impl PendingTable {
    /// Creates an empty table. The first allocated ID will be
    /// `last_id + 1` (wrapping).
    pub fn new(last_id: u16, timeout: Option<Duration>) -> Self {
        Self {
            next_id: last_id,
            timeout,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns the eviction timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sets the eviction timeout. `None` disables eviction.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        match (self.timeout, timeout) {
            (None, Some(_)) => {
                let mut order: Vec<_> = self
                    .entries
                    .iter()
                    .map(|(&id, r)| (id, r.tracked_at))
                    .collect();
                order.sort_by_key(|&(_, at)| at);
                self.order = order.into();
            }
            (_, None) => self.order.clear(),
            _ => (),
        }
        self.timeout = timeout;
    }

    /// Returns the number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether there are no pending requests.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the next outbound ID.
    pub fn allocate_id(&mut self) -> u16 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Records `request` as pending under `id`. If `id` is already
    /// pending, the table is left unchanged and an error is returned.
    pub fn track(&mut self, id: u16, request: PendingRequest) -> Result<(), CollisionError> {
        if self.entries.contains_key(&id) {
            return Err(CollisionError(id));
        }
        self.entries.insert(id, request);
        if self.timeout.is_some() {
            self.order.push_back((id, request.tracked_at));
        }
        Ok(())
    }

    /// Removes and returns the request pending under `id`, if any.
    pub fn resolve(&mut self, id: u16) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    /// Removes the request pending under `id` without it having been
    /// answered. This is used when forwarding the query failed.
    pub fn forget(&mut self, id: u16) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    /// Evicts requests tracked more than the timeout before `now`, and
    /// returns how many were evicted. Evicts nothing if there is no
    /// timeout.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        self.compact_order();
        let timeout = match self.timeout {
            Some(t) => t,
            None => return 0,
        };

        let mut evicted = 0;
        while let Some(&(id, tracked_at)) = self.order.front() {
            if now.saturating_duration_since(tracked_at) <= timeout {
                break;
            }
            self.order.pop_front();

            // Only evict if the entry is the one this record was made
            // for; it may have been resolved and the ID reused.
            if self
                .entries
                .get(&id)
                .map_or(false, |r| r.tracked_at == tracked_at)
            {
                self.entries.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Drops records of resolved requests from `order` once they
    /// outnumber the live ones. Without this, answered queries would
    /// pile up in `order` until they were old enough to expire.
    fn compact_order(&mut self) {
        if self.order.len() > 2 * self.entries.len() + 64 {
            let entries = &self.entries;
            self.order
                .retain(|(id, at)| entries.get(id).map_or(false, |r| r.tracked_at == *at));
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that an ID is already pending.
///
/// This happens when the ID counter wraps around while a request from
/// 65,536 allocations ago is still outstanding.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CollisionError(pub u16);

impl fmt::Display for CollisionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ID {} is already pending", self.0)
    }
}

impl std::error::Error for CollisionError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request(original_id: u16, tracked_at: Instant) -> PendingRequest {
        PendingRequest {
            origin: Endpoint::Listener(0),
            client: (Ipv4Addr::new(192, 0, 2, 1), 5353).into(),
            original_id,
            tracked_at,
        }
    }

    #[test]
    fn allocate_id_increments_and_wraps() {
        let mut table = PendingTable::new(u16::MAX - 1, None);
        assert_eq!(table.allocate_id(), u16::MAX);
        assert_eq!(table.allocate_id(), 0);
        assert_eq!(table.allocate_id(), 1);
    }

    #[test]
    fn resolve_removes_exactly_once() {
        let now = Instant::now();
        let mut table = PendingTable::new(0, None);
        let id = table.allocate_id();
        table.track(id, request(0x1234, now)).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve(id), Some(request(0x1234, now)));
        assert_eq!(table.resolve(id), None);
        assert!(table.is_empty());
    }

    #[test]
    fn track_refuses_collisions() {
        let now = Instant::now();
        let mut table = PendingTable::new(0, None);
        table.track(7, request(1, now)).unwrap();
        assert_eq!(table.track(7, request(2, now)), Err(CollisionError(7)));
        assert_eq!(table.resolve(7).map(|r| r.original_id), Some(1));
    }

    #[test]
    fn forget_removes_entry() {
        let now = Instant::now();
        let mut table = PendingTable::new(0, None);
        table.track(9, request(1, now)).unwrap();
        assert!(table.forget(9).is_some());
        assert!(table.forget(9).is_none());
        assert_eq!(table.resolve(9), None);
    }

    #[test]
    fn allocated_ids_are_distinct_from_pending_ones() {
        let now = Instant::now();
        let mut table = PendingTable::new(0, None);
        for original_id in 0..1000 {
            let id = table.allocate_id();
            table.track(id, request(original_id, now)).unwrap();
        }
        assert_eq!(table.len(), 1000);
    }

    #[test]
    fn evict_expired_drops_only_old_entries() {
        let start = Instant::now();
        let mut table = PendingTable::new(0, Some(Duration::from_secs(5)));
        table.track(1, request(1, start)).unwrap();
        table
            .track(2, request(2, start + Duration::from_secs(3)))
            .unwrap();

        assert_eq!(table.evict_expired(start + Duration::from_secs(5)), 0);
        assert_eq!(table.evict_expired(start + Duration::from_secs(6)), 1);
        assert!(table.resolve(1).is_none());
        assert!(table.resolve(2).is_some());
    }

    #[test]
    fn evict_expired_skips_resolved_and_reused_ids() {
        let start = Instant::now();
        let later = start + Duration::from_secs(4);
        let mut table = PendingTable::new(0, Some(Duration::from_secs(5)));
        table.track(1, request(1, start)).unwrap();
        table.resolve(1);
        table.track(1, request(2, later)).unwrap();

        // The first record for ID 1 has expired, but the entry now
        // under ID 1 has not.
        assert_eq!(table.evict_expired(start + Duration::from_secs(6)), 0);
        assert_eq!(table.resolve(1).map(|r| r.original_id), Some(2));
    }

    #[test]
    fn answered_queries_do_not_accumulate() {
        for timeout in [None, Some(Duration::from_secs(30))] {
            let start = Instant::now();
            let mut table = PendingTable::new(0, timeout);
            for original_id in 0..100_000u32 {
                table.evict_expired(start);
                let id = table.allocate_id();
                table.track(id, request(original_id as u16, start)).unwrap();
                table.resolve(id);
            }
            assert!(table.is_empty());
            assert!(table.order.len() < 100, "order grew to {}", table.order.len());
        }
    }

    #[test]
    fn enabling_timeout_covers_existing_entries() {
        let start = Instant::now();
        let mut table = PendingTable::new(0, None);
        table.track(1, request(1, start)).unwrap();
        table
            .track(2, request(2, start + Duration::from_secs(10)))
            .unwrap();

        table.set_timeout(Some(Duration::from_secs(5)));
        assert_eq!(table.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(table.evict_expired(start + Duration::from_secs(6)), 1);
        assert!(table.resolve(1).is_none());
        assert!(table.resolve(2).is_some());

        table.set_timeout(None);
        assert_eq!(table.timeout(), None);
    }

    #[test]
    fn no_timeout_never_evicts() {
        let start = Instant::now();
        let mut table = PendingTable::new(0, None);
        table.track(1, request(1, start)).unwrap();
        assert_eq!(table.evict_expired(start + Duration::from_secs(86400)), 0);
        assert_eq!(table.len(), 1);
    }
}
