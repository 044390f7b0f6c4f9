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

//! The domain acceptance policy.
//!
//! A [`DomainList`] holds the domain masks that queries are allowed to
//! ask about. A mask permits the domain it names and every domain below
//! it: `example.com` permits `example.com` and `www.example.com`, but
//! not `notexample.com`. Comparison is ASCII-case-insensitive.

use std::fmt;

use crate::message::{self, Header, Opcode};

/// An immutable list of accepted domain masks.
///
/// Lists are never modified once built. To change the policy of a
/// running [`Relay`](crate::relay::Relay), build a new list and swap it
/// in with [`Relay::set_domains`](crate::relay::Relay::set_domains).
#[derive(Clone, Default, Eq, PartialEq)]
pub struct DomainList {
    masks: Vec<Box<[u8]>>,
}

impl DomainList {
    /// Creates an empty list, which accepts no standard queries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a list from the given masks, in order. A single trailing
    /// dot is removed from each mask.
    pub fn from_masks<I, S>(masks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            masks: masks
                .into_iter()
                .map(|m| normalize_mask(m.as_ref()).into())
                .collect(),
        }
    }

    /// Parses the flat domain list file format: one mask per line.
    /// Surrounding whitespace is ignored, as are blank lines and lines
    /// whose first non-whitespace character is `#`.
    pub fn parse(text: &str) -> Self {
        Self::from_masks(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Returns the number of masks.
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Returns whether the list has no masks.
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Returns an iterator over the masks.
    pub fn masks(&self) -> impl Iterator<Item = &[u8]> {
        self.masks.iter().map(|mask| &**mask)
    }

    /// Returns whether `name` (dot-joined labels, no trailing dot) is
    /// matched by any mask.
    pub fn accepts(&self, name: &[u8]) -> bool {
        self.masks().any(|mask| mask_matches(name, mask))
    }

    /// Decides whether a query may be forwarded.
    ///
    /// Messages whose opcode is not QUERY are accepted without looking
    /// at their names; only standard lookups are filtered. Otherwise,
    /// every question name must be accepted. An error is returned if
    /// the question section cannot be read before a decision is
    /// reached.
    pub fn accepts_query(&self, header: &Header, octets: &[u8]) -> message::Result<bool> {
        if header.opcode != Opcode::Query {
            return Ok(true);
        }
        for name in header.question_names(octets) {
            if !self.accepts(name?.as_bytes()) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Debug for DomainList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.masks().map(String::from_utf8_lossy))
            .finish()
    }
}

/// Returns whether `mask` matches `name` as a domain suffix.
///
/// The mask must equal the end of the name, ignoring ASCII case, and
/// the match must begin on a label boundary: either the mask covers the
/// whole name, or the octet just before the matched suffix is a `.`.
pub fn mask_matches(name: &[u8], mask: &[u8]) -> bool {
    let offset = match name.len().checked_sub(mask.len()) {
        Some(offset) => offset,
        None => return false,
    };
    if offset > 0 && name[offset - 1] != b'.' {
        return false;
    }
    name[offset..].eq_ignore_ascii_case(mask)
}

/// Drops a single trailing dot, so that masks written as fully
/// qualified names match the undotted question names.
fn normalize_mask(mask: &[u8]) -> &[u8] {
    match mask {
        [rest @ .., b'.'] if !rest.is_empty() => rest,
        _ => mask,
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
