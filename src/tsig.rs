// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The TSIG verification primitive as seen by the zone core

use crate::proto::op::ResponseCode;

/// Outcome of verifying a signed message against a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigVerdict {
    /// The signature checks out
    Ok,
    /// The message names a key this server does not know
    BadKey,
    /// The MAC does not verify
    BadSig,
    /// The signature is outside the time window
    BadTime {
        /// The time-signed field extracted from the message, echoed back so
        /// the client can resynchronize its clock
        time_signed: u64,
    },
    /// The TSIG record itself is unusable
    Malformed,
}

/// The TSIG primitive consumed by the zone core; the MAC computation itself
/// is external
pub trait TsigVerifier: Send + Sync {
    /// Verifies the signed wire message against the named key
    fn verify(&self, message: &[u8], key_name: &str) -> TsigVerdict;
}

/// How a verification outcome is answered on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsigOutcome {
    /// RCODE for the response header
    pub rcode: ResponseCode,
    /// RCODE to place in the response's TSIG record, when any
    pub tsig_rcode: Option<ResponseCode>,
    /// Time-signed to echo back on BADTIME
    pub time_signed: Option<u64>,
}

/// Maps a verification verdict to the response codes the protocol requires
pub fn evaluate(verdict: TsigVerdict) -> TsigOutcome {
    match verdict {
        TsigVerdict::Ok => TsigOutcome {
            rcode: ResponseCode::NoError,
            tsig_rcode: None,
            time_signed: None,
        },
        TsigVerdict::BadKey => TsigOutcome {
            rcode: ResponseCode::NotAuth,
            tsig_rcode: Some(ResponseCode::BADKEY),
            time_signed: None,
        },
        TsigVerdict::BadSig => TsigOutcome {
            rcode: ResponseCode::NotAuth,
            tsig_rcode: Some(ResponseCode::BADSIG),
            time_signed: None,
        },
        TsigVerdict::BadTime { time_signed } => TsigOutcome {
            rcode: ResponseCode::NotAuth,
            tsig_rcode: Some(ResponseCode::BADTIME),
            time_signed: Some(time_signed),
        },
        TsigVerdict::Malformed => TsigOutcome {
            rcode: ResponseCode::FormErr,
            tsig_rcode: None,
            time_signed: None,
        },
    }
}
