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

//! Implements domain list loading.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::Level::Debug;
use log::{debug, error, info, log_enabled, warn};

use dnsfilter::policy::DomainList;
use dnsfilter::relay::Relay;

use crate::run::describe_error;

/// Loads the domain list file at `path`.
pub fn load(path: &Path) -> Result<DomainList> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let domains = DomainList::parse(&String::from_utf8_lossy(&raw));

    if domains.is_empty() {
        warn!(
            "{} lists no domains; every standard query will be refused.",
            path.display()
        );
    } else if domains.len() == 1 {
        info!("Loaded 1 domain from {}.", path.display());
    } else {
        info!("Loaded {} domains from {}.", domains.len(), path.display());
    }
    if log_enabled!(Debug) {
        for mask in domains.masks() {
            debug!("Accepting {}.", String::from_utf8_lossy(mask));
        }
    }
    Ok(domains)
}

/// Reloads the domain list file at `path` into `relay`. If the file
/// can't be loaded, the relay keeps its current list.
pub fn reload(path: &Path, relay: &Relay) {
    match load(path) {
        Ok(domains) => relay.set_domains(Arc::new(domains)),
        Err(e) => error!(
            "{}\nKeeping the current list.",
            describe_error("Failed to reload the domain list:", &e)
        ),
    }
}
