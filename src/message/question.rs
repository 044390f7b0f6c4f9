// Copyright 2021 Matthew Ingwersen.
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

//! Reading of question names, including compressed ones.

use std::fmt;

use arrayvec::ArrayVec;

use super::constants::*;
use super::{Error, Result};

////////////////////////////////////////////////////////////////////////
// QUESTION NAMES                                                     //
////////////////////////////////////////////////////////////////////////

/// A QNAME as read from a message: its labels joined by `.`, without a
/// trailing dot for the root.
///
/// Labels may contain arbitrary octets, so the name is kept as raw
/// octets; [`QuestionName::as_bytes`] exposes them for matching. The
/// [`Display`](fmt::Display) implementation escapes anything that is
/// not printable ASCII, along with literal dots and backslashes inside
/// labels, in the usual `\DDD` and `\.` forms.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct QuestionName {
    text: ArrayVec<u8, MAX_WIRE_LEN>,

    /// Where each label begins in `text`, for display purposes.
    label_starts: ArrayVec<u8, MAX_WIRE_LEN>,
}

impl QuestionName {
    /// Returns the dot-joined labels.
    pub fn as_bytes(&self) -> &[u8] {
        &self.text
    }

    /// Returns whether this is the root name (no labels at all).
    pub fn is_root(&self) -> bool {
        self.label_starts.is_empty()
    }

    /// Returns an iterator over the labels.
    pub fn labels(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.label_starts.iter().enumerate().map(move |(i, &start)| {
            let end = self
                .label_starts
                .get(i + 1)
                .map_or(self.text.len(), |&next| next as usize - 1);
            &self.text[start as usize..end]
        })
    }
}

impl fmt::Display for QuestionName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for (i, label) in self.labels().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            for &octet in label {
                match octet {
                    b'.' | b'\\' => write!(f, "\\{}", octet as char)?,
                    0x21..=0x7e => write!(f, "{}", octet as char)?,
                    _ => write!(f, "\\{:03}", octet)?,
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for QuestionName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "QuestionName({})", self)
    }
}

////////////////////////////////////////////////////////////////////////
// ITERATION OVER THE QUESTION SECTION                                //
////////////////////////////////////////////////////////////////////////

/// An iterator over the QNAMEs of a message, as returned by
/// [`Header::question_names`](super::Header::question_names).
///
/// The iterator yields exactly QDCOUNT items unless an error occurs, in
/// which case the error is yielded and iteration stops. QTYPE and QCLASS
/// are skipped, not read.
#[derive(Clone, Debug)]
pub struct QuestionNames<'a> {
    octets: &'a [u8],
    cursor: usize,
    remaining: u16,
}

impl<'a> QuestionNames<'a> {
    pub(super) fn new(octets: &'a [u8], qdcount: u16) -> Self {
        Self {
            octets,
            cursor: HEADER_SIZE,
            remaining: qdcount,
        }
    }
}

impl Iterator for QuestionNames<'_> {
    type Item = Result<QuestionName>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let result = parse_name(self.octets, self.cursor).and_then(|(name, len)| {
            let end = self.cursor + len + QUESTION_TRAILER_SIZE;
            if end > self.octets.len() {
                Err(Error::UnexpectedEom)
            } else {
                self.cursor = end;
                Ok(name)
            }
        });

        if result.is_ok() {
            self.remaining -= 1;
        } else {
            self.remaining = 0;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

////////////////////////////////////////////////////////////////////////
// PARSING OF COMPRESSED ON-THE-WIRE NAMES                            //
////////////////////////////////////////////////////////////////////////

/// Parses a possibly-compressed name starting at index `start` of
/// `octets`. Pointers are followed, and the offsets they carry are
/// indices of `octets`, so the whole message must be passed in.
///
/// Returns the name and the number of octets it occupies at `start`
/// (that is, up to and including either the terminating null label or
/// the first pointer).
fn parse_name(octets: &[u8], start: usize) -> Result<(QuestionName, usize)> {
    let mut name = QuestionName {
        text: ArrayVec::new(),
        label_starts: ArrayVec::new(),
    };
    let mut wire_len = 0;
    let mut len_at_start = None;
    let mut next_chunk = Some(start);

    while let Some(chunk_start) = next_chunk {
        let mut index = chunk_start;
        loop {
            let len = *octets.get(index).ok_or(Error::UnexpectedEom)?;
            if len & POINTER_MASK == POINTER_MASK {
                next_chunk = Some(parse_pointer(octets, chunk_start, index)?);
                index += 2;
                break;
            } else if len as usize > MAX_LABEL_LEN {
                return Err(Error::LabelTooLong);
            }

            wire_len += len as usize + 1;
            if wire_len > MAX_WIRE_LEN {
                return Err(Error::NameTooLong);
            }

            if len == 0 {
                next_chunk = None;
                index += 1;
                break;
            }

            let label_end = index + len as usize + 1;
            let label = octets.get(index + 1..label_end).ok_or(Error::UnexpectedEom)?;
            if !name.text.is_empty() {
                name.text.push(b'.');
            }
            name.label_starts.push(name.text.len() as u8);
            name.text
                .try_extend_from_slice(label)
                .or(Err(Error::NameTooLong))?;
            index = label_end;
        }
        len_at_start.get_or_insert(index - chunk_start);
    }

    // The loop runs at least once, so this is always set.
    Ok((name, len_at_start.unwrap_or_default()))
}

/// Parses a pointer at `index` in `octets`. This also checks that the
/// pointer refers to an index *earlier* than the start of the chunk it
/// is in (`chunk_start`).
fn parse_pointer(octets: &[u8], chunk_start: usize, index: usize) -> Result<usize> {
    let pointer_bytes = octets.get(index..index + 2).ok_or(Error::UnexpectedEom)?;
    let pointer = u16::from_be_bytes([pointer_bytes[0], pointer_bytes[1]]) & POINTER_OFFSET_MASK;
    if pointer as usize >= chunk_start {
        // According to RFC 1035 § 4.1.4, pointers point to a *prior*
        // occurrence of the name. Requiring this also rules out loops.
        Err(Error::InvalidPointer)
    } else {
        Ok(pointer as usize)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
