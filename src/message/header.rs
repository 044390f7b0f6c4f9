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

//! Implementation of the [`Header`] type.

use super::constants::*;
use super::question::QuestionNames;
use super::{Error, Opcode, Rcode, Result};

////////////////////////////////////////////////////////////////////////
// HEADER                                                             //
////////////////////////////////////////////////////////////////////////

/// The fixed 12-octet header at the start of every DNS message, decoded
/// into host-order values.
///
/// A `Header` is obtained with [`Header::parse`], which converts the
/// network-order wire fields into native integers and flags. Once the
/// caller has made its changes (a new ID, the QR bit, an RCODE), it
/// encodes the header back into the same buffer with
/// [`Header::write`]. Every bit of the wire header is represented, so
/// parsing and then writing an unmodified `Header` leaves the buffer
/// exactly as it was.
///
/// Everything after the header is opaque to this type. The question
/// names can be walked with [`Header::question_names`]; the remaining
/// sections are never touched.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: Opcode,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    /// The three reserved (and, later, AD/CD) bits, right-aligned.
    pub z: u8,
    pub rcode: Rcode,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    /// Decodes the header at the start of `octets`. Fails if `octets`
    /// is shorter than a full header.
    pub fn parse(octets: &[u8]) -> Result<Self> {
        if octets.len() < HEADER_SIZE {
            return Err(Error::HeaderTooShort);
        }
        Ok(Self {
            id: read_u16(octets, ID_START),
            qr: octets[QR_BYTE] & QR_MASK != 0,
            opcode: Opcode::from_bits((octets[OPCODE_BYTE] & OPCODE_MASK) >> OPCODE_SHIFT),
            aa: octets[AA_BYTE] & AA_MASK != 0,
            tc: octets[TC_BYTE] & TC_MASK != 0,
            rd: octets[RD_BYTE] & RD_MASK != 0,
            ra: octets[RA_BYTE] & RA_MASK != 0,
            z: (octets[Z_BYTE] & Z_MASK) >> Z_SHIFT,
            rcode: Rcode::from_bits(octets[RCODE_BYTE] & RCODE_MASK),
            qdcount: read_u16(octets, QDCOUNT_START),
            ancount: read_u16(octets, ANCOUNT_START),
            nscount: read_u16(octets, NSCOUNT_START),
            arcount: read_u16(octets, ARCOUNT_START),
        })
    }

    /// Encodes the header into the first [`HEADER_SIZE`] octets of
    /// `octets`, in network byte order. Fails if `octets` is too short.
    pub fn write(&self, octets: &mut [u8]) -> Result<()> {
        if octets.len() < HEADER_SIZE {
            return Err(Error::HeaderTooShort);
        }

        let mut flags_hi = (self.opcode.bits() << OPCODE_SHIFT) & OPCODE_MASK;
        if self.qr {
            flags_hi |= QR_MASK;
        }
        if self.aa {
            flags_hi |= AA_MASK;
        }
        if self.tc {
            flags_hi |= TC_MASK;
        }
        if self.rd {
            flags_hi |= RD_MASK;
        }
        let mut flags_lo = ((self.z << Z_SHIFT) & Z_MASK) | (self.rcode.bits() & RCODE_MASK);
        if self.ra {
            flags_lo |= RA_MASK;
        }

        octets[ID_START..ID_END].copy_from_slice(&self.id.to_be_bytes());
        octets[QR_BYTE] = flags_hi;
        octets[RA_BYTE] = flags_lo;
        octets[QDCOUNT_START..QDCOUNT_END].copy_from_slice(&self.qdcount.to_be_bytes());
        octets[ANCOUNT_START..ANCOUNT_END].copy_from_slice(&self.ancount.to_be_bytes());
        octets[NSCOUNT_START..NSCOUNT_END].copy_from_slice(&self.nscount.to_be_bytes());
        octets[ARCOUNT_START..ARCOUNT_END].copy_from_slice(&self.arcount.to_be_bytes());
        Ok(())
    }

    /// Returns an iterator over the question names of the message in
    /// `octets`, which must be the same message this header was parsed
    /// from. Each call starts again from the beginning of the question
    /// section.
    pub fn question_names<'a>(&self, octets: &'a [u8]) -> QuestionNames<'a> {
        QuestionNames::new(octets, self.qdcount)
    }
}

/// Reads a network-byte-order `u16` at `index`. The caller guarantees
/// that two octets are available.
fn read_u16(octets: &[u8], index: usize) -> u16 {
    u16::from_be_bytes([octets[index], octets[index + 1]])
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
