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

//! Just enough of the DNS message format to relay messages: the fixed
//! header and the question names.
//!
//! Relaying never re-serializes a message. The header is decoded with
//! [`Header::parse`], adjusted, and written back in place with
//! [`Header::write`]; every other octet of the datagram is forwarded
//! as-is.

mod codes;
mod constants;
mod error;
mod header;
mod question;

pub use codes::{Opcode, Rcode};
pub use constants::HEADER_SIZE;
pub use error::{Error, Result};
pub use header::Header;
pub use question::{QuestionName, QuestionNames};
