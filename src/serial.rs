// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Serial Number Arithmetic and journal entry keys

use std::cmp::Ordering;
use std::ops::Add;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::SerialPolicy;

/// Wrapper type to support Serial Number Arithmetics as defined
/// in RFC 1982. Zone SOA serials are serial numbers.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SerialNumber(pub u32);

impl SerialNumber {
    /// Returns internal value
    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Serial Number Addition, see RFC 1982, section 3.1
///
/// The result is a wrapping add.
impl Add for SerialNumber {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

/// Serial Number Comparison, see RFC 1982, section 3.2
impl PartialOrd for SerialNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        const SERIAL_BITS_HALF: u32 = 1 << (u32::BITS - 1);

        let i1 = self.0;
        let i2 = other.0;

        if i1 == i2 {
            Some(Ordering::Equal)
        } else if (i1 < i2 && (i2 - i1) < SERIAL_BITS_HALF)
            || (i1 > i2 && (i1 - i2) > SERIAL_BITS_HALF)
        {
            Some(Ordering::Less)
        } else if (i1 < i2 && (i2 - i1) > SERIAL_BITS_HALF)
            || (i1 > i2 && (i1 - i2) < SERIAL_BITS_HALF)
        {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

/// Computes the serial the next version of a zone should carry.
///
/// Callers are expected to compare the result against the current serial in
/// RFC 1982 order and warn on regression; the new serial is used regardless.
pub fn next_serial(old_serial: u32, policy: SerialPolicy) -> u32 {
    match policy {
        SerialPolicy::Increment => old_serial.wrapping_add(1),
        SerialPolicy::Unixtime => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_else(|_| old_serial.wrapping_add(1)),
    }
}

/// Key of a journal entry, packing the from- and to-serials of the stored
/// changeset into a single 64-bit value.
///
/// ```text
///       64    32       0
/// key = [TO   |   FROM]
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct JournalKey(u64);

impl JournalKey {
    /// Packs the serial pair into a key
    pub fn pack(from: u32, to: u32) -> Self {
        Self((u64::from(to) << 32) | u64::from(from))
    }

    /// Returns the 'serial_from' part of the key, the least significant 32 bits
    pub fn serial_from(&self) -> u32 {
        (self.0 & 0x0000_0000_ffff_ffff) as u32
    }

    /// Returns the 'serial_to' part of the key, the most significant 32 bits
    pub fn serial_to(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// True if the entry under this key starts at `serial`
    pub fn matches_from(&self, serial: u32) -> bool {
        self.serial_from() == serial
    }

    /// True if the entry under this key ends at `serial`
    pub fn matches_to(&self, serial: u32) -> bool {
        self.serial_to() == serial
    }

    /// The raw packed value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JournalKey {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
