//! The application layer PDUs that the transport engine sends and receives.
//!
//! All PDUs start with an octet whose high nibble is the PDU type; the low nibble carries
//!  flags. The layouts follow ASHRAE 135 clause 20.1:
//!
//! ```ascii
//! Confirmed-Request:  0: 0000 SEG MOR SA 0
//!                     1: 0 max-segments(3) max-apdu(4)
//!                     2: invoke id
//!                     3: sequence number      (only if SEG)
//!                     4: proposed window size (only if SEG)
//!                     *: service choice, service payload
//! Unconfirmed-Request 0: 0001 0000, 1: service choice, *: service payload
//! Simple-ACK:         0: 0010 0000, 1: invoke id, 2: service choice
//! Complex-ACK:        0: 0011 SEG MOR 0 0, 1: invoke id,
//!                     2: sequence number, 3: proposed window size (only if SEG)
//!                     *: service choice, service payload
//! Segment-ACK:        0: 0100 00 NAK SRV, 1: invoke id, 2: sequence number, 3: actual window size
//! Error:              0: 0101 0000, 1: invoke id, 2: service choice,
//!                     *: error class, error code (application tagged enumerated)
//! Reject:             0: 0110 0000, 1: invoke id, 2: reject reason
//! Abort:              0: 0111 000 SRV, 1: invoke id, 2: abort reason
//! ```

pub mod codes;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::apdu::codes::{AbortReason, ErrorClass, ErrorCode, MaxApduLength, MaxSegments, RejectReason};

const PDU_CONFIRMED_REQUEST: u8 = 0;
const PDU_UNCONFIRMED_REQUEST: u8 = 1;
const PDU_SIMPLE_ACK: u8 = 2;
const PDU_COMPLEX_ACK: u8 = 3;
const PDU_SEGMENT_ACK: u8 = 4;
const PDU_ERROR: u8 = 5;
const PDU_REJECT: u8 = 6;
const PDU_ABORT: u8 = 7;

const FLAG_SEGMENTED: u8 = 0x08;
const FLAG_MORE_FOLLOWS: u8 = 0x04;
const FLAG_SEGMENTED_RESPONSE_ACCEPTED: u8 = 0x02;
const FLAG_NAK: u8 = 0x02;
const FLAG_SERVER: u8 = 0x01;

const TAG_ENUMERATED: u8 = 9;

/// Segmentation related header fields of a segmented Confirmed-Request or Complex-ACK
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SegmentInfo {
    pub sequence_number: u8,
    pub proposed_window_size: u8,
    pub more_follows: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConfirmedRequest {
    pub segmented_response_accepted: bool,
    pub max_segments_accepted: MaxSegments,
    pub max_apdu_length_accepted: MaxApduLength,
    pub invoke_id: u8,
    pub segment: Option<SegmentInfo>,
    pub service_choice: u8,
    pub payload: Bytes,
}

impl ConfirmedRequest {
    pub const HEADER_LEN: usize = 4;
    pub const SEGMENTED_HEADER_LEN: usize = 6;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnconfirmedRequest {
    pub service_choice: u8,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SimpleAck {
    pub invoke_id: u8,
    pub service_choice: u8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ComplexAck {
    pub invoke_id: u8,
    pub segment: Option<SegmentInfo>,
    pub service_choice: u8,
    pub payload: Bytes,
}

impl ComplexAck {
    pub const HEADER_LEN: usize = 3;
    pub const SEGMENTED_HEADER_LEN: usize = 5;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SegmentAck {
    pub negative: bool,
    pub from_server: bool,
    pub invoke_id: u8,
    pub sequence_number: u8,
    pub actual_window_size: u8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorPdu {
    pub invoke_id: u8,
    pub service_choice: u8,
    pub error_class: ErrorClass,
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RejectPdu {
    pub invoke_id: u8,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AbortPdu {
    pub from_server: bool,
    pub invoke_id: u8,
    pub reason: AbortReason,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Apdu {
    ConfirmedRequest(ConfirmedRequest),
    UnconfirmedRequest(UnconfirmedRequest),
    SimpleAck(SimpleAck),
    ComplexAck(ComplexAck),
    SegmentAck(SegmentAck),
    Error(ErrorPdu),
    Reject(RejectPdu),
    Abort(AbortPdu),
}

impl Apdu {
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest(r) => Some(r.invoke_id),
            Apdu::UnconfirmedRequest(_) => None,
            Apdu::SimpleAck(a) => Some(a.invoke_id),
            Apdu::ComplexAck(a) => Some(a.invoke_id),
            Apdu::SegmentAck(a) => Some(a.invoke_id),
            Apdu::Error(e) => Some(e.invoke_id),
            Apdu::Reject(r) => Some(r.invoke_id),
            Apdu::Abort(a) => Some(a.invoke_id),
        }
    }

    /// `true` if this PDU is sent by the server side of a confirmed exchange
    pub fn is_server(&self) -> bool {
        match self {
            Apdu::ConfirmedRequest(_) | Apdu::UnconfirmedRequest(_) => false,
            Apdu::SimpleAck(_) | Apdu::ComplexAck(_) | Apdu::Error(_) | Apdu::Reject(_) => true,
            Apdu::SegmentAck(a) => a.from_server,
            Apdu::Abort(a) => a.from_server,
        }
    }

    /// `true` for the PDUs that require the peer to reply
    pub fn expects_reply(&self) -> bool {
        matches!(self, Apdu::ConfirmedRequest(_))
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Apdu::ConfirmedRequest(r) => {
                let mut first = PDU_CONFIRMED_REQUEST << 4;
                if let Some(segment) = &r.segment {
                    first |= FLAG_SEGMENTED;
                    if segment.more_follows {
                        first |= FLAG_MORE_FOLLOWS;
                    }
                }
                if r.segmented_response_accepted {
                    first |= FLAG_SEGMENTED_RESPONSE_ACCEPTED;
                }
                buf.put_u8(first);
                buf.put_u8(((u8::from(r.max_segments_accepted) & 0x07) << 4) | (u8::from(r.max_apdu_length_accepted) & 0x0f));
                buf.put_u8(r.invoke_id);
                if let Some(segment) = &r.segment {
                    buf.put_u8(segment.sequence_number);
                    buf.put_u8(segment.proposed_window_size);
                }
                buf.put_u8(r.service_choice);
                buf.put_slice(&r.payload);
            }
            Apdu::UnconfirmedRequest(r) => {
                buf.put_u8(PDU_UNCONFIRMED_REQUEST << 4);
                buf.put_u8(r.service_choice);
                buf.put_slice(&r.payload);
            }
            Apdu::SimpleAck(a) => {
                buf.put_u8(PDU_SIMPLE_ACK << 4);
                buf.put_u8(a.invoke_id);
                buf.put_u8(a.service_choice);
            }
            Apdu::ComplexAck(a) => {
                let mut first = PDU_COMPLEX_ACK << 4;
                if let Some(segment) = &a.segment {
                    first |= FLAG_SEGMENTED;
                    if segment.more_follows {
                        first |= FLAG_MORE_FOLLOWS;
                    }
                }
                buf.put_u8(first);
                buf.put_u8(a.invoke_id);
                if let Some(segment) = &a.segment {
                    buf.put_u8(segment.sequence_number);
                    buf.put_u8(segment.proposed_window_size);
                }
                buf.put_u8(a.service_choice);
                buf.put_slice(&a.payload);
            }
            Apdu::SegmentAck(a) => {
                let mut first = PDU_SEGMENT_ACK << 4;
                if a.negative {
                    first |= FLAG_NAK;
                }
                if a.from_server {
                    first |= FLAG_SERVER;
                }
                buf.put_u8(first);
                buf.put_u8(a.invoke_id);
                buf.put_u8(a.sequence_number);
                buf.put_u8(a.actual_window_size);
            }
            Apdu::Error(e) => {
                buf.put_u8(PDU_ERROR << 4);
                buf.put_u8(e.invoke_id);
                buf.put_u8(e.service_choice);
                put_enumerated(buf, u16::from(e.error_class).into());
                put_enumerated(buf, u16::from(e.error_code).into());
            }
            Apdu::Reject(r) => {
                buf.put_u8(PDU_REJECT << 4);
                buf.put_u8(r.invoke_id);
                buf.put_u8(r.reason.into());
            }
            Apdu::Abort(a) => {
                let mut first = PDU_ABORT << 4;
                if a.from_server {
                    first |= FLAG_SERVER;
                }
                buf.put_u8(first);
                buf.put_u8(a.invoke_id);
                buf.put_u8(a.reason.into());
            }
        }
    }

    /// Parses a complete APDU. The payload of requests and ACKs is the remainder of `buf`
    ///  and shares its storage.
    pub fn deser(mut buf: Bytes) -> anyhow::Result<Apdu> {
        let first = buf.try_get_u8()?;

        let apdu = match first >> 4 {
            PDU_CONFIRMED_REQUEST => {
                let second = buf.try_get_u8()?;
                let invoke_id = buf.try_get_u8()?;
                let segment = Self::try_get_segment_info(&mut buf, first)?;
                let service_choice = buf.try_get_u8()?;
                Apdu::ConfirmedRequest(ConfirmedRequest {
                    segmented_response_accepted: first & FLAG_SEGMENTED_RESPONSE_ACCEPTED != 0,
                    max_segments_accepted: MaxSegments::from((second >> 4) & 0x07),
                    max_apdu_length_accepted: MaxApduLength::from(second & 0x0f),
                    invoke_id,
                    segment,
                    service_choice,
                    payload: buf,
                })
            }
            PDU_UNCONFIRMED_REQUEST => {
                let service_choice = buf.try_get_u8()?;
                Apdu::UnconfirmedRequest(UnconfirmedRequest {
                    service_choice,
                    payload: buf,
                })
            }
            PDU_SIMPLE_ACK => {
                Apdu::SimpleAck(SimpleAck {
                    invoke_id: buf.try_get_u8()?,
                    service_choice: buf.try_get_u8()?,
                })
            }
            PDU_COMPLEX_ACK => {
                let invoke_id = buf.try_get_u8()?;
                let segment = Self::try_get_segment_info(&mut buf, first)?;
                let service_choice = buf.try_get_u8()?;
                Apdu::ComplexAck(ComplexAck {
                    invoke_id,
                    segment,
                    service_choice,
                    payload: buf,
                })
            }
            PDU_SEGMENT_ACK => {
                Apdu::SegmentAck(SegmentAck {
                    negative: first & FLAG_NAK != 0,
                    from_server: first & FLAG_SERVER != 0,
                    invoke_id: buf.try_get_u8()?,
                    sequence_number: buf.try_get_u8()?,
                    actual_window_size: buf.try_get_u8()?,
                })
            }
            PDU_ERROR => {
                let invoke_id = buf.try_get_u8()?;
                let service_choice = buf.try_get_u8()?;
                let error_class = try_get_enumerated(&mut buf)?;
                let error_code = try_get_enumerated(&mut buf)?;
                Apdu::Error(ErrorPdu {
                    invoke_id,
                    service_choice,
                    error_class: ErrorClass::from(u16::try_from(error_class)?),
                    error_code: ErrorCode::from(u16::try_from(error_code)?),
                })
            }
            PDU_REJECT => {
                Apdu::Reject(RejectPdu {
                    invoke_id: buf.try_get_u8()?,
                    reason: RejectReason::from(buf.try_get_u8()?),
                })
            }
            PDU_ABORT => {
                Apdu::Abort(AbortPdu {
                    from_server: first & FLAG_SERVER != 0,
                    invoke_id: buf.try_get_u8()?,
                    reason: AbortReason::from(buf.try_get_u8()?),
                })
            }
            n => bail!("unknown PDU type {}", n),
        };
        Ok(apdu)
    }

    fn try_get_segment_info(buf: &mut Bytes, first: u8) -> anyhow::Result<Option<SegmentInfo>> {
        if first & FLAG_SEGMENTED == 0 {
            return Ok(None);
        }
        Ok(Some(SegmentInfo {
            sequence_number: buf.try_get_u8()?,
            proposed_window_size: buf.try_get_u8()?,
            more_follows: first & FLAG_MORE_FOLLOWS != 0,
        }))
    }
}

/// writes an application tagged enumerated value with the minimal number of octets
fn put_enumerated(buf: &mut BytesMut, value: u32) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter()
        .take(3)
        .take_while(|&&b| b == 0)
        .count();
    buf.put_u8((TAG_ENUMERATED << 4) | (4 - skip) as u8);
    buf.put_slice(&bytes[skip..]);
}

fn try_get_enumerated(buf: &mut Bytes) -> anyhow::Result<u32> {
    let tag = buf.try_get_u8()?;
    if tag >> 4 != TAG_ENUMERATED || tag & 0x08 != 0 {
        bail!("expected application tagged enumerated, got tag octet {:02x}", tag);
    }
    let len = (tag & 0x07) as usize;
    if !(1..=4).contains(&len) {
        return Err(anyhow!("invalid length {} for enumerated value", len));
    }
    let mut value = 0u32;
    for _ in 0..len {
        value = (value << 8) | buf.try_get_u8()? as u32;
    }
    Ok(value)
}
