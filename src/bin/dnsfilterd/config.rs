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

//! Implements the settings file.

use std::env;
use std::fmt::Write;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::Level::Debug;
use log::{debug, info, log_enabled};
use serde::Deserialize;

use crate::args::Args;

/// The DNS port, used for an upstream resolver given on the command
/// line and in the default listen addresses.
const DNS_PORT: u16 = 53;

/// The file name of the domain list when none is configured. It is
/// looked for in the directory holding the executable.
const DEFAULT_DOMAINS_FILE_NAME: &str = "config.ini";

////////////////////////////////////////////////////////////////////////
// CONFIGURATION LOADING                                              //
////////////////////////////////////////////////////////////////////////

/// Produces the configuration from the parsed command line arguments
/// given by `args`, loading the settings file if one was named there.
/// The upstream address and domain list path given on the command line
/// take precedence over those in the settings file.
pub fn load(args: Args) -> Result<Config> {
    let mut config = if let Some(ref path) = args.config {
        info!("Loading the settings from {}.", path.display());
        load_from_path(path)?
    } else {
        Config::default()
    };

    if let Some(ip) = args.upstream {
        config.upstream = SocketAddr::new(ip, DNS_PORT);
    }
    if let Some(domains) = args.domains {
        config.domains = Some(domains);
    }
    if config.listen.is_empty() {
        return Err(anyhow!("no listen addresses are configured"));
    }

    log_config_summary(&config);
    Ok(config)
}

/// Loads the settings file given by `path`.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let dir = match path.as_ref().parent() {
        Some(p) => p,
        None => return Err(anyhow!("the settings file path has no parent")),
    };
    let raw_config = fs::read(path.as_ref()).context("failed to read the settings file")?;
    parse(&raw_config, dir)
}

/// Parses a settings file whose directory is `dir`. A relative domain
/// list path is interpreted relative to `dir`.
fn parse(raw_config: &[u8], dir: &Path) -> Result<Config> {
    let mut config: Config =
        toml::from_slice(raw_config).context("failed to parse the settings file")?;
    if let Some(ref mut domains) = config.domains {
        if domains.is_relative() {
            *domains = dir.join(&*domains);
        }
    }
    Ok(config)
}

/// Summarizes the configuration in the log, if the debug log level is
/// enabled.
fn log_config_summary(config: &Config) {
    if !log_enabled!(Debug) {
        // Don't compute the message if it will never be printed.
        return;
    }

    let mut message = format!(
        "Configuration loaded:\n\
         Upstream:        {}\n\
         Outbound:        {}\n\
         Pending timeout: ",
        config.upstream,
        config.outbound_addr(),
    );
    match config.pending_timeout() {
        Some(timeout) => write!(message, "{}s", timeout.as_secs()).unwrap(),
        None => message.push_str("never"),
    }
    message.push_str("\nDomain list:     ");
    match config.domains {
        Some(ref path) => write!(message, "{}", path.display()).unwrap(),
        None => message.push_str("(default)"),
    }
    message.push_str("\nListen:");
    for addr in &config.listen {
        write!(message, "\n  {addr}").unwrap();
    }
    debug!("{}", message);
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION FILE STRUCTURE                                       //
////////////////////////////////////////////////////////////////////////

/// The complete settings file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_upstream")]
    pub upstream: SocketAddr,
    #[serde(default = "default_listen")]
    pub listen: Vec<SocketAddr>,
    pub outbound: Option<SocketAddr>,
    pub domains: Option<PathBuf>,
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout: u64,
}

impl Config {
    /// Returns the address to bind the upstream socket to. Unless one
    /// is configured, this is the unspecified address of the upstream
    /// resolver's family, with an ephemeral port.
    pub fn outbound_addr(&self) -> SocketAddr {
        self.outbound.unwrap_or_else(|| {
            let ip = match self.upstream {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            SocketAddr::new(ip, 0)
        })
    }

    /// Returns how long forwarded queries may stay unanswered. A
    /// configured value of zero means forever.
    pub fn pending_timeout(&self) -> Option<Duration> {
        match self.pending_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Returns the path of the domain list.
    pub fn domains_path(&self) -> Result<PathBuf> {
        match self.domains {
            Some(ref path) => Ok(path.clone()),
            None => default_domains_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            listen: default_listen(),
            outbound: None,
            domains: None,
            pending_timeout: default_pending_timeout(),
        }
    }
}

fn default_upstream() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), DNS_PORT)
}

fn default_listen() -> Vec<SocketAddr> {
    vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DNS_PORT),
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DNS_PORT),
    ]
}

fn default_pending_timeout() -> u64 {
    dnsfilter::relay::DEFAULT_PENDING_TIMEOUT.as_secs()
}

fn default_domains_path() -> Result<PathBuf> {
    let exe = env::current_exe().context("failed to find the executable's path")?;
    match exe.parent() {
        Some(dir) => Ok(dir.join(DEFAULT_DOMAINS_FILE_NAME)),
        None => Err(anyhow!("the executable's path has no parent")),
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
