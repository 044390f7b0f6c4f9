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

//! Implements command-line argument parsing.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// The dnsfilter filtering DNS relay
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Args {
    /// Set the upstream resolver IP address [default: 8.8.8.8]
    #[clap(value_name = "UPSTREAM")]
    pub upstream: Option<IpAddr>,

    /// Set the domain list file [default: config.ini next to the
    /// executable]
    #[clap(long, value_name = "FILE")]
    pub domains: Option<PathBuf>,

    /// Set the settings file to use
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::net::Ipv6Addr;

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn everything_is_optional() {
        let args = Args::try_parse_from(["dnsfilterd"]).unwrap();
        assert!(args.upstream.is_none());
        assert!(args.domains.is_none());
        assert!(args.config.is_none());
    }

    #[test]
    fn accepts_ipv6_upstream_and_paths() {
        let args = Args::try_parse_from([
            "dnsfilterd",
            "2001:db8::53",
            "--domains",
            "allowed.txt",
            "--config",
            "dnsfilter.toml",
        ])
        .unwrap();
        assert_eq!(
            args.upstream,
            Some(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x53)))
        );
        assert_eq!(args.domains, Some(PathBuf::from("allowed.txt")));
        assert_eq!(args.config, Some(PathBuf::from("dnsfilter.toml")));
    }

    #[test]
    fn rejects_invalid_upstream() {
        assert!(Args::try_parse_from(["dnsfilterd", "dns.example"]).is_err());
    }
}
