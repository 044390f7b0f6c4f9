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

//! Implementation of the Tokio I/O provider.

// NOTE: Each socket has exactly one task, which receives a datagram,
// hands it to the relay, and performs the send before receiving again.
// A failed send is retried and then abandoned; failed receives are
// retried until MAX_IO_ATTEMPTS happen in a row, after which the task
// exits. Tasks are not respawned. Once every task has exited, the
// controller's stopped() future completes so the caller can give up.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::relay::{Action, Endpoint, ReceivedInfo, Relay};

use super::{udp, MAX_IO_ATTEMPTS, RECEIVE_BUFFER_SIZE};

/// How long [`TokioShutdownController::shut_down`] waits for tasks to
/// finish.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// A Tokio I/O provider.
///
/// This provider uses asynchronous I/O and runs the relay by spawning
/// tasks on a Tokio runtime, one per socket. It owns a set of listener
/// sockets, on which client queries arrive and responses to clients
/// are sent, and one upstream socket, through which queries are
/// forwarded to the upstream resolver and its responses received.
///
/// The `TokioIoProvider` supports graceful shutdown. To initiate a
/// graceful shutdown, use the [`TokioShutdownController`] returned by
/// [`TokioIoProvider::start`].
pub struct TokioIoProvider {
    sockets: Sockets,
}

/// The sockets of a [`TokioIoProvider`], shared by all of its tasks
/// since a datagram may leave by a different socket than it arrived on.
struct Sockets {
    listeners: Vec<UdpSocket>,
    upstream: UdpSocket,
}

impl Sockets {
    fn get(&self, endpoint: Endpoint) -> Option<&UdpSocket> {
        match endpoint {
            Endpoint::Listener(index) => self.listeners.get(index),
            Endpoint::Upstream => Some(&self.upstream),
        }
    }
}

impl TokioIoProvider {
    /// Creates a new `TokioIoProvider`. This call binds a listener
    /// socket to each of `listen_addrs` and the upstream socket to
    /// `outbound_addr`, in preparation, but does not start the relay.
    /// This function requires that the Tokio runtime be active.
    ///
    /// Listeners are numbered in the order given, matching
    /// [`Endpoint::Listener`].
    pub fn bind<L>(listen_addrs: L, outbound_addr: SocketAddr) -> io::Result<Self>
    where
        L: IntoIterator<Item = SocketAddr>,
    {
        let mut listeners = Vec::new();
        for addr in listen_addrs {
            listeners.push(bind_tokio_socket(addr)?);
        }
        let upstream = bind_tokio_socket(outbound_addr)?;
        Ok(Self {
            sockets: Sockets {
                listeners,
                upstream,
            },
        })
    }

    /// Returns the local addresses of the listener sockets, in order.
    pub fn listener_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.sockets
            .listeners
            .iter()
            .map(UdpSocket::local_addr)
            .collect()
    }

    /// Returns the local address of the upstream socket.
    pub fn upstream_addr(&self) -> io::Result<SocketAddr> {
        self.sockets.upstream.local_addr()
    }

    /// Starts the relay on the active Tokio runtime.
    ///
    /// This spawns tasks on the active Tokio runtime and then returns
    /// a [`TokioShutdownController`] that can be used to shut down the
    /// tasks at a later time. (The [`TokioShutdownController`] must be
    /// held as long as the relay should be running, since dropping it
    /// will trigger shutdown.)
    pub fn start(self, relay: &Arc<Relay>) -> TokioShutdownController {
        let (shutdown_controller, shutdown_handle) = make_shutdown_channels();
        let sockets = Arc::new(self.sockets);

        let endpoints = (0..sockets.listeners.len())
            .map(Endpoint::Listener)
            .chain([Endpoint::Upstream]);
        for endpoint in endpoints {
            tokio::spawn(run_receiver(
                shutdown_handle.clone(),
                relay.clone(),
                sockets.clone(),
                endpoint,
            ));
        }

        shutdown_controller
    }
}

/// Binds a socket with [`udp::bind`] and registers it with Tokio.
fn bind_tokio_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    UdpSocket::from_std(udp::bind(addr)?)
}

/// The receiver loop for one socket.
async fn run_receiver(
    mut shutdown: ShutdownHandle,
    relay: Arc<Relay>,
    sockets: Arc<Sockets>,
    endpoint: Endpoint,
) {
    let socket = match sockets.get(endpoint) {
        Some(s) => s,
        None => return,
    };
    let mut buf = vec![0; RECEIVE_BUFFER_SIZE];
    let mut consecutive_failures = 0;

    loop {
        // Receive a datagram (or a shutdown request).
        let res = tokio::select! {
            _ = shutdown.request_receiver.recv() => return,
            res = socket.recv_from(&mut buf) => res,
        };
        let (len, source) = match res {
            Ok(r) => {
                consecutive_failures = 0;
                r
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_IO_ATTEMPTS {
                    error!("{endpoint}: receive failed {consecutive_failures} times in a row, giving up: {e}");
                    return;
                }
                warn!("{endpoint}: receive failed: {e}");
                continue;
            }
        };

        let datagram = &mut buf[..len];
        if let Action::Send {
            endpoint: out,
            dest,
        } = relay.handle_datagram(datagram, ReceivedInfo::new(endpoint, source))
        {
            let res = match sockets.get(out) {
                Some(out_socket) => send_with_retries(out_socket, datagram, dest).await,
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no socket for {out}"),
                )),
            };
            if let Err(e) = res {
                error!("{out}: failed to send {len} octets to {dest}: {e}");
                relay.send_failed(datagram);
            }
        }
    }
}

/// Sends a datagram, making up to [`MAX_IO_ATTEMPTS`] attempts.
async fn send_with_retries(socket: &UdpSocket, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
    let mut attempt = 1;
    loop {
        match socket.send_to(datagram, dest).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt >= MAX_IO_ATTEMPTS => return Err(e),
            Err(e) => {
                debug!("send to {dest} failed (attempt {attempt}): {e}");
                attempt += 1;
            }
        }
    }
}

/// Controls the shutdown of a relay's Tokio tasks.
///
/// This type is used to shut down the Tokio tasks spawned by
/// [`TokioIoProvider::start`], with
/// [`TokioShutdownController::shut_down`], and to find out if they all
/// stopped on their own, with [`TokioShutdownController::stopped`].
/// Dropping the controller will also trigger shutdown (but will not
/// wait for it to complete).
#[must_use]
pub struct TokioShutdownController {
    request_sender: broadcast::Sender<()>,
    wait_receiver: mpsc::Receiver<()>,
}

impl TokioShutdownController {
    /// Requests that running relay tasks shut down, and then waits a
    /// short grace period for them to terminate. Returns whether they
    /// all did.
    pub async fn shut_down(mut self) -> bool {
        drop(self.request_sender);
        timeout(SHUTDOWN_GRACE_PERIOD, self.wait_receiver.recv())
            .await
            .is_ok()
    }

    /// Completes once every relay task has exited without being asked
    /// to, which only happens when all sockets have failed.
    ///
    /// This future is cancel-safe, so it may be used in a
    /// `tokio::select!` loop.
    pub async fn stopped(&mut self) {
        // Nothing is ever sent; recv returns None once every
        // ShutdownHandle is gone.
        let _ = self.wait_receiver.recv().await;
    }
}

/// A handle held by tasks to interact with the graceful shutdown
/// mechanism.
///
/// This type has two roles:
///
/// 1. It enables tasks to listen for graceful shutdown signals. This
///    is done by waiting for all senders attached to `request_receiver`
///    to close.
/// 2. It lets the controller know when tasks are done. This is done by
///    holding `wait_sender`, which closes the controller's channel when
///    the last handle is dropped.
struct ShutdownHandle {
    request_receiver: broadcast::Receiver<()>,
    wait_sender: mpsc::Sender<()>,
}

impl Clone for ShutdownHandle {
    fn clone(&self) -> Self {
        // Values already queued are not copied by resubscribe, but no
        // values are ever sent. The signal is the senders closing.
        ShutdownHandle {
            request_receiver: self.request_receiver.resubscribe(),
            wait_sender: self.wait_sender.clone(),
        }
    }
}

/// Produces a [`TokioShutdownController`] and an initial
/// [`ShutdownHandle`] connected to it.
fn make_shutdown_channels() -> (TokioShutdownController, ShutdownHandle) {
    let (request_sender, request_receiver) = broadcast::channel(1);
    let (wait_sender, wait_receiver) = mpsc::channel(1);
    let controller = TokioShutdownController {
        request_sender,
        wait_receiver,
    };
    let handle = ShutdownHandle {
        request_receiver,
        wait_sender,
    };
    (controller, handle)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, Rcode};
    use crate::policy::DomainList;
    use std::net::Ipv4Addr;

    const WAIT: Duration = Duration::from_secs(5);

    const WWW_EXAMPLE_COM_QUERY: &[u8] =
        b"\x12\x34\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\
          \x03www\x07example\x03com\x00\x00\x01\x00\x01";

    const TRACKER_NET_QUERY: &[u8] =
        b"\x43\x21\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\
          \x07tracker\x03net\x00\x00\x01\x00\x01";

    async fn loopback_socket() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap()
    }

    async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0; RECEIVE_BUFFER_SIZE];
        let (len, source) = timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        buf.truncate(len);
        (buf, source)
    }

    struct Harness {
        client: UdpSocket,
        upstream: UdpSocket,
        listener: SocketAddr,
        relay: Arc<Relay>,
        controller: TokioShutdownController,
    }

    async fn start() -> Harness {
        let upstream = loopback_socket().await;
        let upstream_addr = upstream.local_addr().unwrap();
        start_with(upstream, upstream_addr).await
    }

    /// Starts a relay that forwards to `upstream_addr`, which need not
    /// be where `upstream` is bound.
    async fn start_with(upstream: UdpSocket, upstream_addr: SocketAddr) -> Harness {
        let client = loopback_socket().await;
        let relay = Arc::new(Relay::new(
            upstream_addr,
            Arc::new(DomainList::from_masks(["example.com"])),
        ));
        let provider = TokioIoProvider::bind(
            [SocketAddr::from((Ipv4Addr::LOCALHOST, 0))],
            (Ipv4Addr::LOCALHOST, 0).into(),
        )
        .unwrap();
        let listener = provider.listener_addrs().unwrap()[0];
        assert_ne!(listener.port(), 0);
        assert_ne!(provider.upstream_addr().unwrap().port(), 0);
        let controller = provider.start(&relay);
        Harness {
            client,
            upstream,
            listener,
            relay,
            controller,
        }
    }

    #[tokio::test]
    async fn relays_accepted_query_and_response() {
        let h = start().await;

        h.client
            .send_to(WWW_EXAMPLE_COM_QUERY, h.listener)
            .await
            .unwrap();
        let (forwarded, relay_addr) = recv(&h.upstream).await;
        assert_eq!(forwarded.len(), WWW_EXAMPLE_COM_QUERY.len());
        assert_eq!(&forwarded[2..], &WWW_EXAMPLE_COM_QUERY[2..]);
        assert_eq!(h.relay.pending_count(), 1);

        let mut response = forwarded.clone();
        let mut header = Header::parse(&response).unwrap();
        header.qr = true;
        header.rcode = Rcode::ServFail;
        header.write(&mut response).unwrap();
        h.upstream.send_to(&response, relay_addr).await.unwrap();

        let (relayed, source) = recv(&h.client).await;
        assert_eq!(source, h.listener);
        let header = Header::parse(&relayed).unwrap();
        assert_eq!(header.id, 0x1234);
        assert!(header.qr);
        assert_eq!(header.rcode, Rcode::ServFail);
        assert_eq!(&relayed[4..], &WWW_EXAMPLE_COM_QUERY[4..]);
        assert_eq!(h.relay.pending_count(), 0);

        assert!(h.controller.shut_down().await);
    }

    #[tokio::test]
    async fn refuses_denied_query_locally() {
        let h = start().await;

        h.client.send_to(TRACKER_NET_QUERY, h.listener).await.unwrap();
        let (refused, source) = recv(&h.client).await;
        assert_eq!(source, h.listener);
        let header = Header::parse(&refused).unwrap();
        assert_eq!(header.id, 0x4321);
        assert!(header.qr);
        assert_eq!(header.rcode, Rcode::Refused);
        assert_eq!(h.relay.pending_count(), 0);

        assert!(h.controller.shut_down().await);
    }

    #[tokio::test]
    async fn keeps_running_after_short_datagram() {
        let h = start().await;

        h.client.send_to(b"\x00\x01\x02", h.listener).await.unwrap();
        h.client.send_to(TRACKER_NET_QUERY, h.listener).await.unwrap();
        let (refused, _) = recv(&h.client).await;
        assert_eq!(Header::parse(&refused).unwrap().id, 0x4321);

        assert!(h.controller.shut_down().await);
    }

    #[tokio::test]
    async fn stopped_is_pending_while_running() {
        let mut h = start().await;
        let stopped = timeout(Duration::from_millis(100), h.controller.stopped()).await;
        assert!(stopped.is_err());
        assert!(h.controller.shut_down().await);
    }

    // Linux refuses to send UDP datagrams to port 0 with EINVAL.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn send_with_retries_gives_up() {
        let socket = loopback_socket().await;
        let dest = (Ipv4Addr::LOCALHOST, 0).into();
        assert!(send_with_retries(&socket, b"\x00", dest).await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_forward_is_forgotten() {
        let upstream = loopback_socket().await;
        let h = start_with(upstream, (Ipv4Addr::LOCALHOST, 0).into()).await;

        // The listener task handles datagrams in order, so once the
        // refusal arrives, the failed forward has been dealt with.
        h.client
            .send_to(WWW_EXAMPLE_COM_QUERY, h.listener)
            .await
            .unwrap();
        h.client.send_to(TRACKER_NET_QUERY, h.listener).await.unwrap();
        let (refused, _) = recv(&h.client).await;
        assert_eq!(Header::parse(&refused).unwrap().id, 0x4321);
        assert_eq!(h.relay.pending_count(), 0);

        assert!(h.controller.shut_down().await);
    }

    #[tokio::test]
    async fn stopped_completes_once_tasks_exit() {
        let (mut controller, handle) = make_shutdown_channels();
        let sockets = Arc::new(Sockets {
            listeners: Vec::new(),
            upstream: loopback_socket().await,
        });
        let relay = Arc::new(Relay::new(
            (Ipv4Addr::LOCALHOST, 53).into(),
            Arc::new(DomainList::new()),
        ));

        // With no socket to receive on, the task exits on its own.
        tokio::spawn(run_receiver(handle, relay, sockets, Endpoint::Listener(0)));
        assert!(timeout(WAIT, controller.stopped()).await.is_ok());
    }
}
