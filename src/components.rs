//! TCAP components

use crate::asn1::{self, Expect};
use crate::errors::DecodeError;
use crate::registry::OperationRegistry;
use crate::types::Problem;
use bytes::{BufMut, Bytes, BytesMut};

/// TCAP component tags
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum ComponentTag {
    Invoke = 0xA1,
    ReturnResultLast = 0xA2,
    ReturnError = 0xA3,
    Reject = 0xA4,
    ReturnResultNotLast = 0xA7,
}

const TAG_INTEGER: u8 = 0x02;
const TAG_NULL: u8 = 0x05;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_LINKED_ID: u8 = 0x80;

/// TCAP component
///
/// Payloads are the parameter octets produced by the operation module that
/// built the component; inbound payloads pass through the registered codec
/// for their operation code.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Invoke {
        invoke_id: i8,
        linked_id: Option<i8>,
        op_code: u8,
        payload: Option<Bytes>,
    },
    ReturnResultLast {
        invoke_id: i8,
        /// Absent operation code means an empty result
        op_code: Option<u8>,
        payload: Option<Bytes>,
    },
    /// Non-last result: accepted on the wire, never produced
    ReturnResult {
        invoke_id: i8,
        op_code: Option<u8>,
        payload: Option<Bytes>,
    },
    ReturnError {
        invoke_id: i8,
        error_code: u8,
        payload: Option<Bytes>,
    },
    Reject {
        invoke_id: Option<i8>,
        problem: Problem,
    },
}

impl Component {
    /// Get component tag
    pub fn tag(&self) -> u8 {
        match self {
            Self::Invoke { .. } => ComponentTag::Invoke as u8,
            Self::ReturnResultLast { .. } => ComponentTag::ReturnResultLast as u8,
            Self::ReturnResult { .. } => ComponentTag::ReturnResultNotLast as u8,
            Self::ReturnError { .. } => ComponentTag::ReturnError as u8,
            Self::Reject { .. } => ComponentTag::Reject as u8,
        }
    }

    /// Get invoke ID
    pub fn invoke_id(&self) -> Option<i8> {
        match self {
            Self::Invoke { invoke_id, .. }
            | Self::ReturnResultLast { invoke_id, .. }
            | Self::ReturnResult { invoke_id, .. }
            | Self::ReturnError { invoke_id, .. } => Some(*invoke_id),
            Self::Reject { invoke_id, .. } => *invoke_id,
        }
    }

    /// Encode component to ASN.1
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut content = BytesMut::with_capacity(64);

        match self {
            Self::Invoke {
                invoke_id,
                linked_id,
                op_code,
                payload,
            } => {
                asn1::write(&mut content, TAG_INTEGER, &[*invoke_id as u8]);

                if let Some(lid) = linked_id {
                    asn1::write(&mut content, TAG_LINKED_ID, &[*lid as u8]);
                }

                asn1::write(&mut content, TAG_INTEGER, &[*op_code]);

                if let Some(param) = payload {
                    content.put_slice(param);
                }
            }
            Self::ReturnResultLast {
                invoke_id,
                op_code,
                payload,
            }
            | Self::ReturnResult {
                invoke_id,
                op_code,
                payload,
            } => {
                asn1::write(&mut content, TAG_INTEGER, &[*invoke_id as u8]);

                // Result sequence is absent entirely for an empty result
                if let Some(op) = op_code {
                    let mut result = BytesMut::new();
                    asn1::write(&mut result, TAG_INTEGER, &[*op]);
                    if let Some(param) = payload {
                        result.put_slice(param);
                    }
                    asn1::write(&mut content, TAG_SEQUENCE, &result);
                }
            }
            Self::ReturnError {
                invoke_id,
                error_code,
                payload,
            } => {
                asn1::write(&mut content, TAG_INTEGER, &[*invoke_id as u8]);
                asn1::write(&mut content, TAG_INTEGER, &[*error_code]);

                if let Some(param) = payload {
                    content.put_slice(param);
                }
            }
            Self::Reject { invoke_id, problem } => {
                match invoke_id {
                    Some(iid) => asn1::write(&mut content, TAG_INTEGER, &[*iid as u8]),
                    None => asn1::write(&mut content, TAG_NULL, &[]),
                }

                asn1::write(&mut content, TAG_INTEGER, &[problem.to_byte()]);
            }
        }

        asn1::write(buf, self.tag(), &content);
    }

    /// Decode one component from its tag and content octets
    pub fn decode(
        tag: u8,
        content: &[u8],
        registry: &OperationRegistry,
    ) -> Result<Self, DecodeError> {
        match tag {
            t if t == ComponentTag::Invoke as u8 => decode_invoke(content, registry),
            t if t == ComponentTag::ReturnResultLast as u8 => {
                decode_return_result(content, registry, true)
            }
            t if t == ComponentTag::ReturnResultNotLast as u8 => {
                decode_return_result(content, registry, false)
            }
            t if t == ComponentTag::ReturnError as u8 => decode_return_error(content, registry),
            t if t == ComponentTag::Reject as u8 => decode_reject(content),
            other => Err(DecodeError::UnrecognizedTag(other)),
        }
    }

    /// Encode a component list back to back
    pub fn encode_list(components: &[Component], buf: &mut BytesMut) {
        for component in components {
            component.encode(buf);
        }
    }

    /// Decode a component list by reading until the data is exhausted
    pub fn decode_list(
        data: &[u8],
        registry: &OperationRegistry,
    ) -> Result<Vec<Component>, DecodeError> {
        let mut components = Vec::new();
        let mut rest = data;

        while let Some((tag, value, tail)) = asn1::read(rest, Expect::Any)? {
            components.push(Component::decode(tag, value, registry)?);
            rest = tail;
        }

        Ok(components)
    }
}

fn decode_invoke(content: &[u8], registry: &OperationRegistry) -> Result<Component, DecodeError> {
    let (_, id_value, rest) = asn1::read(content, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("invoke: missing invoke id"))?;
    let invoke_id = asn1::single_octet(id_value)? as i8;

    let (linked_id, rest) = if rest.first() == Some(&TAG_LINKED_ID) {
        let (_, lid_value, tail) = asn1::read(rest, Expect::Tag(TAG_LINKED_ID))?
            .ok_or(DecodeError::Malformed("invoke: missing linked id"))?;
        (Some(asn1::single_octet(lid_value)? as i8), tail)
    } else {
        (None, rest)
    };

    let (_, op_value, param) = asn1::read(rest, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("invoke: missing operation code"))?;
    let op_code = asn1::single_octet(op_value)?;

    let codec = registry
        .argument(op_code)
        .ok_or(DecodeError::UnknownOperation(op_code))?;

    codec.decode(invoke_id, linked_id, param)
}

fn decode_return_result(
    content: &[u8],
    registry: &OperationRegistry,
    last: bool,
) -> Result<Component, DecodeError> {
    let (_, id_value, rest) = asn1::read(content, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("return result: missing invoke id"))?;
    let invoke_id = asn1::single_octet(id_value)? as i8;

    // Absent result sequence means an empty result, not a malformed one
    if rest.is_empty() {
        return Ok(if last {
            Component::ReturnResultLast {
                invoke_id,
                op_code: None,
                payload: None,
            }
        } else {
            Component::ReturnResult {
                invoke_id,
                op_code: None,
                payload: None,
            }
        });
    }

    let (_, seq, _) = asn1::read(rest, Expect::Tag(TAG_SEQUENCE))?
        .ok_or(DecodeError::Malformed("return result: missing sequence"))?;

    let (_, op_value, param) = asn1::read(seq, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("return result: missing operation code"))?;
    let op_code = asn1::single_octet(op_value)?;

    if last {
        let codec = registry
            .result(op_code)
            .ok_or(DecodeError::UnknownOperation(op_code))?;
        codec.decode(invoke_id, param)
    } else {
        // Non-last results are a wire-level placeholder; keep the octets
        Ok(Component::ReturnResult {
            invoke_id,
            op_code: Some(op_code),
            payload: if param.is_empty() {
                None
            } else {
                Some(Bytes::copy_from_slice(param))
            },
        })
    }
}

fn decode_return_error(
    content: &[u8],
    registry: &OperationRegistry,
) -> Result<Component, DecodeError> {
    let (_, id_value, rest) = asn1::read(content, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("return error: missing invoke id"))?;
    let invoke_id = asn1::single_octet(id_value)? as i8;

    let (_, code_value, param) = asn1::read(rest, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("return error: missing error code"))?;
    let error_code = asn1::single_octet(code_value)?;

    let codec = registry
        .error(error_code)
        .ok_or(DecodeError::UnknownError(error_code))?;

    codec.decode(invoke_id, param)
}

fn decode_reject(content: &[u8]) -> Result<Component, DecodeError> {
    let (tag, id_value, rest) = asn1::read(content, Expect::Any)?
        .ok_or(DecodeError::Malformed("reject: missing invoke id"))?;

    let invoke_id = match tag {
        TAG_INTEGER => Some(asn1::single_octet(id_value)? as i8),
        TAG_NULL if id_value.is_empty() => None,
        TAG_NULL => return Err(DecodeError::BadLength("reject null invoke id")),
        other => return Err(DecodeError::UnrecognizedTag(other)),
    };

    let (_, problem_value, _) = asn1::read(rest, Expect::Tag(TAG_INTEGER))?
        .ok_or(DecodeError::Malformed("reject: missing problem"))?;
    let problem = Problem::from_byte(asn1::single_octet(problem_value)?)
        .ok_or(DecodeError::Malformed("reject problem category"))?;

    Ok(Component::Reject { invoke_id, problem })
}
