// Copyright 2022 Matthew Ingwersen.
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

//! I/O providers for running [`Relay`s](crate::relay::Relay).
//!
//! The [`Relay`](crate::relay::Relay) structure and its methods
//! implement the processing logic of the filtering relay abstracted
//! from underlying network I/O. Therefore, to actually run a
//! [`Relay`](crate::relay::Relay), an I/O provider is needed. The
//! provider owns the sockets, receives datagrams on them, submits each
//! one to the relay, and carries out the resulting
//! [`Action`](crate::relay::Action).

mod tokio;
pub mod udp;

pub use self::tokio::{TokioIoProvider, TokioShutdownController};

/// How many times a send is attempted before giving up on a datagram,
/// and how many receive failures in a row stop a receiver.
pub const MAX_IO_ATTEMPTS: usize = 10;

/// The size of receive buffers. This is the largest possible UDP
/// payload, so that no datagram is ever truncated.
pub const RECEIVE_BUFFER_SIZE: usize = u16::MAX as usize;
