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

//! Implements running the relay.

use std::fmt::Write;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use env_logger::Env;
use log::{error, info, warn};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::runtime;
use tokio::sync::mpsc;

use dnsfilter::io::TokioIoProvider;
use dnsfilter::relay::Relay;

use crate::args::Args;
use crate::config::{self, Config};
use crate::{domains, watch};

/// How many events may queue up for the main loop.
const EVENT_QUEUE_SIZE: usize = 16;

/// Something the main loop must react to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Event {
    /// A termination signal arrived.
    Terminate(&'static str),

    /// SIGHUP arrived.
    Hangup,

    /// The domain list file changed.
    DomainsChanged,
}

/// Runs the relay.
pub fn run(args: Args) {
    env_logger::init_from_env(Env::new().default_filter_or("info"));

    if let Err(e) = try_running(args) {
        error!(
            "{}\nExiting with failure.",
            describe_error("Failed to run:", &e)
        );
        process::exit(1);
    }
    info!("Exiting with success.");
}

/// Formats an error and its causes, one per line, under `heading`.
pub fn describe_error(heading: &str, e: &anyhow::Error) -> String {
    let mut message = String::from(heading);
    for (i, cause) in e.chain().enumerate() {
        write!(message, "\n[{}] {}", i + 1, cause).unwrap();
    }
    message
}

fn try_running(args: Args) -> Result<()> {
    info!(
        "dnsfilter daemon v{}.{}.{} starting.",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH"),
    );

    let config = config::load(args).context("failed to load the configuration")?;
    let domains_path = config.domains_path()?;
    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the Tokio runtime")?;

    // Set up signal handling. Signals are forwarded to the main loop
    // from a dedicated thread.
    let (event_sender, events) = mpsc::channel(EVENT_QUEUE_SIZE);
    let signals = set_up_signal_handling().context("failed to set up signal handling")?;
    let signals_handle = signals.handle();
    let signal_thread = forward_signals(signals, event_sender.clone())
        .context("failed to start the signal thread")?;

    let result = runtime.block_on(serve(config, domains_path, event_sender, events));

    signals_handle.close();
    if signal_thread.join().is_err() {
        warn!("The signal thread panicked.");
    }
    result
}

/// Binds the sockets, loads the domain list, and runs the relay until a
/// termination signal arrives or every socket fails.
async fn serve(
    config: Config,
    domains_path: PathBuf,
    event_sender: mpsc::Sender<Event>,
    mut events: mpsc::Receiver<Event>,
) -> Result<()> {
    // Bind before loading the domain list, so that a port conflict is
    // reported first.
    let io_provider = TokioIoProvider::bind(config.listen.iter().copied(), config.outbound_addr())
        .context("failed to bind sockets")?;
    for addr in io_provider
        .listener_addrs()
        .context("failed to get the listener addresses")?
    {
        info!("Listening on {addr}.");
    }

    let domains = domains::load(&domains_path).context("failed to load the domain list")?;
    let relay = Arc::new(Relay::new(config.upstream, Arc::new(domains)));
    relay.set_pending_timeout(config.pending_timeout());

    // Reload the domain list when it changes. SIGHUP still works if the
    // watch can't be set up.
    let _watcher = match watch::watch_with_channel(&domains_path, event_sender, Event::DomainsChanged)
    {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(
                "Failed to watch {} for changes ({e}); send SIGHUP to reload it.",
                domains_path.display()
            );
            None
        }
    };

    match relay.pending_timeout() {
        Some(timeout) => info!("Unanswered queries will be forgotten after {timeout:?}."),
        None => info!("Unanswered queries will be kept until answered."),
    }
    info!(
        "Set-up is complete; relaying accepted queries to {}.",
        relay.upstream()
    );
    let mut shutdown_controller = io_provider.start(&relay);

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::Terminate(name)) => {
                    info!("Received {name}; shutting down.");
                    break Ok(());
                }
                Some(Event::Hangup) => {
                    info!("Received SIGHUP; reloading the domain list.");
                    domains::reload(&domains_path, &relay);
                }
                Some(Event::DomainsChanged) => {
                    info!("{} changed; reloading it.", domains_path.display());
                    domains::reload(&domains_path, &relay);
                }
                None => break Err(anyhow!("the event channel closed unexpectedly")),
            },
            _ = shutdown_controller.stopped() => {
                break Err(anyhow!("every socket has failed; the relay cannot continue"));
            }
        }
    };

    if shutdown_controller.shut_down().await {
        info!("Shutdown complete.");
    } else {
        warn!("Some tasks did not stop in time; abandoning them.");
    }
    outcome
}

fn set_up_signal_handling() -> Result<Signals> {
    let all_signals = &[SIGHUP, SIGINT, SIGTERM];
    let term_signals = &[SIGINT, SIGTERM];
    let already_terminating = Arc::new(AtomicBool::new(false));

    // This sets up signal handlers to exit immediately if a second
    // termination signal arrives before the process finishes shutting
    // down gracefully.
    for sig in term_signals {
        signal_hook::flag::register_conditional_shutdown(*sig, 1, already_terminating.clone())?;
        signal_hook::flag::register(*sig, already_terminating.clone())?;
    }

    Signals::new(all_signals).map_err(Into::into)
}

/// Spawns the thread that turns signals into [`Event`]s. It exits when
/// `signals` is closed through its handle or the main loop is gone.
fn forward_signals(
    mut signals: Signals,
    event_sender: mpsc::Sender<Event>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                let event = match signal {
                    SIGINT => Event::Terminate("SIGINT"),
                    SIGTERM => Event::Terminate("SIGTERM"),
                    SIGHUP => Event::Hangup,
                    _ => continue,
                };
                if event_sender.blocking_send(event).is_err() {
                    break;
                }
            }
        })
}
