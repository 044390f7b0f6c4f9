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

//! Errors produced while reading DNS messages.

use std::fmt;

/// An error signaling that a received datagram is not a DNS message
/// this crate can work with.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    HeaderTooShort,
    UnexpectedEom,
    LabelTooLong,
    NameTooLong,
    InvalidPointer,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::HeaderTooShort => f.write_str("header too short"),
            Self::UnexpectedEom => f.write_str("unexpected end of message"),
            Self::LabelTooLong => f.write_str("label too long or of an unsupported type"),
            Self::NameTooLong => f.write_str("name too long"),
            Self::InvalidPointer => f.write_str("invalid compression pointer"),
        }
    }
}

impl std::error::Error for Error {}

/// The type returned by fallible message-reading functions.
pub type Result<T> = std::result::Result<T, Error>;
