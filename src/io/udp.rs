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

//! Creation of UDP sockets.
//!
//! The standard library binds IPv6 sockets with whatever the system's
//! default for `IPV6_V6ONLY` is. On many systems that default is off,
//! in which case binding `[::]:53` also claims port 53 for IPv4 and
//! conflicts with a separate `0.0.0.0:53` socket. We therefore create
//! sockets through [`socket2`], which lets us set the option
//! explicitly.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Binds a nonblocking UDP socket to `addr`. If `addr` is an IPv6
/// address, the socket only handles IPv6 traffic.
pub fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
