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

//! A transparent, filtering DNS relay.
//!
//! Clients send their DNS queries over UDP to the relay as though it
//! were their resolver. Queries whose names all fall under an accepted
//! domain (see [`policy`]) are forwarded to a real upstream resolver,
//! and the answers are passed back; anything else is refused on the
//! spot. The relay never interprets records: it reads only the header
//! and question names of each datagram ([`message`]) and rewrites only
//! the header.
//!
//! The [`relay::Relay`] type holds the processing logic, independent of
//! any network I/O. To run it, use an I/O provider from [`io`].

pub mod io;
pub mod message;
pub mod policy;
pub mod relay;
