//! Dialogue portion codec
//!
//! Structured-dialogue PDUs (AARQ / AARE / ABRT) carried in an EXTERNAL
//! envelope under the fixed dialogue-as-structured object identifier.
//! Only protocol version 1 is supported.

use crate::asn1::{self, Expect};
use crate::errors::DecodeError;
use crate::types::ApplicationContext;
use bytes::BytesMut;

/// Dialogue-as-structured object identifier
pub const DIALOGUE_AS_ID: &[u32] = &[0, 0, 17, 773, 1, 1, 1];

const TAG_EXTERNAL: u8 = 0x28;
const TAG_OID: u8 = 0x06;
const TAG_SINGLE_ASN1: u8 = 0xA0;
const TAG_INTEGER: u8 = 0x02;

const TAG_REQUEST: u8 = 0x60; // AARQ
const TAG_RESPONSE: u8 = 0x61; // AARE
const TAG_ABORT: u8 = 0x64; // ABRT

const TAG_VERSION: u8 = 0x80; // [0] in AARQ/AARE
const TAG_CONTEXT: u8 = 0xA1; // [1] wrapping the context OID
const TAG_RESULT: u8 = 0xA2; // [2]
const TAG_DIAGNOSTIC: u8 = 0xA3; // [3]
const TAG_DIAG_USER: u8 = 0xA1;
const TAG_DIAG_PROVIDER: u8 = 0xA2;
const TAG_ABORT_SOURCE: u8 = 0x80; // [0] in ABRT

/// BIT STRING value for protocol version 1 (7 unused bits, bit 0 set)
const VERSION1: [u8; 2] = [0x07, 0x80];

/// Common dialogue-service-user diagnostic reasons
pub mod diagnostic {
    pub const NULL: u8 = 0;
    pub const NO_REASON_GIVEN: u8 = 1;
    pub const CONTEXT_NOT_SUPPORTED: u8 = 2;
}

/// Dialogue PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialoguePdu {
    Request {
        context: ApplicationContext,
    },
    Response {
        context: ApplicationContext,
        result: DialogueResult,
        diagnostic: Diagnostic,
    },
    Abort {
        source: AbortSource,
    },
}

/// Dialogue negotiation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DialogueResult {
    Accepted = 0,
    RejectedPermanent = 1,
}

/// Who produced the negotiation result and why
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostic {
    pub source: DiagnosticSource,
    pub reason: u8,
}

impl Diagnostic {
    pub fn user(reason: u8) -> Self {
        Self {
            source: DiagnosticSource::User,
            reason,
        }
    }

    pub fn provider(reason: u8) -> Self {
        Self {
            source: DiagnosticSource::Provider,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSource {
    User,
    Provider,
}

/// Abort source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortSource {
    User = 0,
    Provider = 1,
}

impl DialoguePdu {
    /// Build an accepting response for a negotiated context
    pub fn accept(context: ApplicationContext) -> Self {
        Self::Response {
            context,
            result: DialogueResult::Accepted,
            diagnostic: Diagnostic::user(diagnostic::NULL),
        }
    }

    /// Build a permanent rejection with the given user reason
    pub fn reject(context: ApplicationContext, reason: u8) -> Self {
        Self::Response {
            context,
            result: DialogueResult::RejectedPermanent,
            diagnostic: Diagnostic::user(reason),
        }
    }

    /// Encode into the EXTERNAL envelope
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut pdu = BytesMut::with_capacity(64);

        match self {
            Self::Request { context } => {
                let mut content = BytesMut::new();
                asn1::write(&mut content, TAG_VERSION, &VERSION1);
                write_context(&mut content, context);
                asn1::write(&mut pdu, TAG_REQUEST, &content);
            }
            Self::Response {
                context,
                result,
                diagnostic,
            } => {
                let mut content = BytesMut::new();
                asn1::write(&mut content, TAG_VERSION, &VERSION1);
                write_context(&mut content, context);

                let mut result_value = BytesMut::new();
                asn1::write(&mut result_value, TAG_INTEGER, &[*result as u8]);
                asn1::write(&mut content, TAG_RESULT, &result_value);

                let mut reason = BytesMut::new();
                asn1::write(&mut reason, TAG_INTEGER, &[diagnostic.reason]);
                let source_tag = match diagnostic.source {
                    DiagnosticSource::User => TAG_DIAG_USER,
                    DiagnosticSource::Provider => TAG_DIAG_PROVIDER,
                };
                let mut source = BytesMut::new();
                asn1::write(&mut source, source_tag, &reason);
                asn1::write(&mut content, TAG_DIAGNOSTIC, &source);

                asn1::write(&mut pdu, TAG_RESPONSE, &content);
            }
            Self::Abort { source } => {
                let mut content = BytesMut::new();
                asn1::write(&mut content, TAG_ABORT_SOURCE, &[*source as u8]);
                asn1::write(&mut pdu, TAG_ABORT, &content);
            }
        }

        let mut external = BytesMut::with_capacity(pdu.len() + 16);
        asn1::write(&mut external, TAG_OID, &asn1::oid_value(DIALOGUE_AS_ID));
        asn1::write(&mut external, TAG_SINGLE_ASN1, &pdu);

        asn1::write(buf, TAG_EXTERNAL, &external);
    }

    /// Decode from the content of a dialogue portion
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (_, external, _) = asn1::read(data, Expect::Tag(TAG_EXTERNAL))?
            .ok_or(DecodeError::Malformed("dialogue portion"))?;

        let (_, oid, rest) = asn1::read(external, Expect::Tag(TAG_OID))?
            .ok_or(DecodeError::Malformed("dialogue: missing identifier"))?;
        if asn1::parse_oid(oid)? != DIALOGUE_AS_ID {
            return Err(DecodeError::BadOid);
        }

        let (_, single, _) = asn1::read(rest, Expect::Tag(TAG_SINGLE_ASN1))?
            .ok_or(DecodeError::Malformed("dialogue: missing encoding"))?;

        let (tag, content, _) = asn1::read(single, Expect::Any)?
            .ok_or(DecodeError::Malformed("dialogue: missing pdu"))?;

        match tag {
            TAG_REQUEST => decode_request(content),
            TAG_RESPONSE => decode_response(content),
            TAG_ABORT => decode_abort(content),
            other => Err(DecodeError::UnrecognizedTag(other)),
        }
    }
}

fn write_context(buf: &mut BytesMut, context: &ApplicationContext) {
    let mut oid = BytesMut::new();
    asn1::write(&mut oid, TAG_OID, &asn1::oid_value(context.arcs()));
    asn1::write(buf, TAG_CONTEXT, &oid);
}

/// Check a protocol-version BIT STRING; absence defaults to version 1
fn check_version(rest: &[u8]) -> Result<&[u8], DecodeError> {
    if rest.first() != Some(&TAG_VERSION) {
        return Ok(rest);
    }

    let (_, value, tail) = asn1::read(rest, Expect::Tag(TAG_VERSION))?
        .ok_or(DecodeError::Malformed("dialogue version"))?;
    if value.len() < 2 || value[1] & 0x80 == 0 {
        return Err(DecodeError::VersionMismatch);
    }

    Ok(tail)
}

fn read_context(rest: &[u8]) -> Result<(ApplicationContext, &[u8]), DecodeError> {
    let (_, wrapper, tail) = asn1::read(rest, Expect::Tag(TAG_CONTEXT))?
        .ok_or(DecodeError::Malformed("dialogue: missing context"))?;
    let (_, oid, _) = asn1::read(wrapper, Expect::Tag(TAG_OID))?
        .ok_or(DecodeError::Malformed("dialogue: missing context oid"))?;

    Ok((ApplicationContext::new(asn1::parse_oid(oid)?), tail))
}

fn decode_request(content: &[u8]) -> Result<DialoguePdu, DecodeError> {
    let rest = check_version(content)?;
    let (context, _) = read_context(rest)?;

    Ok(DialoguePdu::Request { context })
}

fn decode_response(content: &[u8]) -> Result<DialoguePdu, DecodeError> {
    let rest = check_version(content)?;
    let (context, rest) = read_context(rest)?;

    let (_, result_value, rest) = asn1::read(rest, Expect::Tag(TAG_RESULT))?
        .ok_or(DecodeError::Malformed("dialogue: missing result"))?;
    let (_, result_int, _) = asn1::read(result_value, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("dialogue result"))?;
    let result = match asn1::single_octet(result_int)? {
        0 => DialogueResult::Accepted,
        1 => DialogueResult::RejectedPermanent,
        _ => return Err(DecodeError::Malformed("dialogue result value")),
    };

    let (_, diag_value, _) = asn1::read(rest, Expect::Tag(TAG_DIAGNOSTIC))?
        .ok_or(DecodeError::Malformed("dialogue: missing diagnostic"))?;
    let (source_tag, source_value, _) = asn1::read(diag_value, Expect::Any)?
        .ok_or(DecodeError::Malformed("dialogue diagnostic"))?;
    let source = match source_tag {
        TAG_DIAG_USER => DiagnosticSource::User,
        TAG_DIAG_PROVIDER => DiagnosticSource::Provider,
        other => return Err(DecodeError::UnrecognizedTag(other)),
    };
    let (_, reason_value, _) = asn1::read(source_value, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("dialogue diagnostic reason"))?;
    let reason = asn1::single_octet(reason_value)?;

    Ok(DialoguePdu::Response {
        context,
        result,
        diagnostic: Diagnostic { source, reason },
    })
}

fn decode_abort(content: &[u8]) -> Result<DialoguePdu, DecodeError> {
    let (_, value, _) = asn1::read(content, Expect::Tag(TAG_ABORT_SOURCE))?
        .ok_or(DecodeError::Malformed("dialogue: missing abort source"))?;

    let source = match asn1::single_octet(value)? {
        0 => AbortSource::User,
        1 => AbortSource::Provider,
        _ => return Err(DecodeError::Malformed("abort source value")),
    };

    Ok(DialoguePdu::Abort { source })
}
