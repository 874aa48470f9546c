//! TCAP transaction-portion messages

use crate::asn1::{self, Expect};
use crate::components::Component;
use crate::dialogue::DialoguePdu;
use crate::errors::DecodeError;
use crate::registry::OperationRegistry;
use crate::types::{ProtocolCause, TransactionId};
use bytes::BytesMut;

/// Top-level message tags
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum MessageTag {
    Unidirectional = 0x61,
    Begin = 0x62,
    End = 0x64,
    Continue = 0x65,
    Abort = 0x67,
}

const TAG_OTID: u8 = 0x48;
const TAG_DTID: u8 = 0x49;
const TAG_DIALOGUE: u8 = 0x6B;
const TAG_COMPONENTS: u8 = 0x6C;
const TAG_PABORT: u8 = 0x4A;

/// Abort cause carried by an Abort message
#[derive(Debug, Clone, PartialEq)]
pub enum AbortCause {
    /// Protocol-level abort (P-abort)
    Protocol(ProtocolCause),
    /// Peer dialogue abort carrying a dialogue PDU
    Dialogue(DialoguePdu),
    /// Local invocation-timer expiry; never sent on the wire
    Timeout,
}

/// TCAP message
#[derive(Debug, Clone, PartialEq)]
pub enum TcapMessage {
    Begin {
        otid: TransactionId,
        dialogue: Option<DialoguePdu>,
        components: Vec<Component>,
    },
    Continue {
        otid: TransactionId,
        dtid: TransactionId,
        dialogue: Option<DialoguePdu>,
        components: Vec<Component>,
    },
    End {
        dtid: TransactionId,
        dialogue: Option<DialoguePdu>,
        components: Vec<Component>,
    },
    Abort {
        dtid: TransactionId,
        cause: AbortCause,
    },
    /// Recognized so dispatch can report it precisely; never produced
    Unidirectional { components: Vec<Component> },
}

impl TcapMessage {
    /// Get message tag
    pub fn tag(&self) -> u8 {
        match self {
            Self::Begin { .. } => MessageTag::Begin as u8,
            Self::Continue { .. } => MessageTag::Continue as u8,
            Self::End { .. } => MessageTag::End as u8,
            Self::Abort { .. } => MessageTag::Abort as u8,
            Self::Unidirectional { .. } => MessageTag::Unidirectional as u8,
        }
    }

    /// Encode to ASN.1 BER
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(512);
        let mut content = BytesMut::with_capacity(256);

        match self {
            Self::Begin {
                otid,
                dialogue,
                components,
            } => {
                asn1::write(&mut content, TAG_OTID, &otid.to_be_bytes());
                write_optional_portions(&mut content, dialogue.as_ref(), components);
            }
            Self::Continue {
                otid,
                dtid,
                dialogue,
                components,
            } => {
                asn1::write(&mut content, TAG_OTID, &otid.to_be_bytes());
                asn1::write(&mut content, TAG_DTID, &dtid.to_be_bytes());
                write_optional_portions(&mut content, dialogue.as_ref(), components);
            }
            Self::End {
                dtid,
                dialogue,
                components,
            } => {
                asn1::write(&mut content, TAG_DTID, &dtid.to_be_bytes());
                write_optional_portions(&mut content, dialogue.as_ref(), components);
            }
            Self::Abort { dtid, cause } => {
                asn1::write(&mut content, TAG_DTID, &dtid.to_be_bytes());
                match cause {
                    AbortCause::Protocol(cause) => {
                        asn1::write(&mut content, TAG_PABORT, &[*cause as u8]);
                    }
                    AbortCause::Dialogue(pdu) => {
                        let mut portion = BytesMut::new();
                        pdu.encode(&mut portion);
                        asn1::write(&mut content, TAG_DIALOGUE, &portion);
                    }
                    AbortCause::Timeout => {
                        unreachable!("timeout aborts are local-only")
                    }
                }
            }
            Self::Unidirectional { .. } => {
                unreachable!("unidirectional messages are never produced")
            }
        }

        asn1::write(&mut buf, self.tag(), &content);
        buf
    }

    /// Decode from ASN.1 BER
    ///
    /// Strict: an unrecognized top-level tag or a missing mandatory
    /// transaction id field is a hard error.
    pub fn decode(data: &[u8], registry: &OperationRegistry) -> Result<Self, DecodeError> {
        let (tag, content, _) =
            asn1::read(data, Expect::Any)?.ok_or(DecodeError::Truncated)?;

        match tag {
            t if t == MessageTag::Begin as u8 => {
                let (otid, rest) = read_tid(content, TAG_OTID, "originating transaction id")?;
                let (dialogue, components) = read_optional_portions(rest, registry)?;
                Ok(Self::Begin {
                    otid,
                    dialogue,
                    components,
                })
            }
            t if t == MessageTag::Continue as u8 => {
                let (otid, rest) = read_tid(content, TAG_OTID, "originating transaction id")?;
                let (dtid, rest) = read_tid(rest, TAG_DTID, "destination transaction id")?;
                let (dialogue, components) = read_optional_portions(rest, registry)?;
                Ok(Self::Continue {
                    otid,
                    dtid,
                    dialogue,
                    components,
                })
            }
            t if t == MessageTag::End as u8 => {
                let (dtid, rest) = read_tid(content, TAG_DTID, "destination transaction id")?;
                let (dialogue, components) = read_optional_portions(rest, registry)?;
                Ok(Self::End {
                    dtid,
                    dialogue,
                    components,
                })
            }
            t if t == MessageTag::Abort as u8 => {
                let (dtid, rest) = read_tid(content, TAG_DTID, "destination transaction id")?;
                let cause = read_abort_cause(rest)?;
                Ok(Self::Abort { dtid, cause })
            }
            t if t == MessageTag::Unidirectional as u8 => {
                let mut components = Vec::new();
                let mut rest = content;
                while let Some((tag, value, tail)) = asn1::read(rest, Expect::Any)? {
                    match tag {
                        // dialogue portion carries nothing we will act on
                        TAG_DIALOGUE => {}
                        TAG_COMPONENTS => components = Component::decode_list(value, registry)?,
                        other => return Err(DecodeError::UnrecognizedTag(other)),
                    }
                    rest = tail;
                }
                Ok(Self::Unidirectional { components })
            }
            other => Err(DecodeError::UnrecognizedTag(other)),
        }
    }
}

fn write_optional_portions(
    buf: &mut BytesMut,
    dialogue: Option<&DialoguePdu>,
    components: &[Component],
) {
    if let Some(pdu) = dialogue {
        let mut portion = BytesMut::new();
        pdu.encode(&mut portion);
        asn1::write(buf, TAG_DIALOGUE, &portion);
    }

    if !components.is_empty() {
        let mut portion = BytesMut::new();
        Component::encode_list(components, &mut portion);
        asn1::write(buf, TAG_COMPONENTS, &portion);
    }
}

fn read_optional_portions(
    data: &[u8],
    registry: &OperationRegistry,
) -> Result<(Option<DialoguePdu>, Vec<Component>), DecodeError> {
    let mut dialogue = None;
    let mut components = Vec::new();
    let mut rest = data;

    while let Some((tag, value, tail)) = asn1::read(rest, Expect::Any)? {
        match tag {
            TAG_DIALOGUE => dialogue = Some(DialoguePdu::decode(value)?),
            TAG_COMPONENTS => components = Component::decode_list(value, registry)?,
            other => return Err(DecodeError::UnrecognizedTag(other)),
        }
        rest = tail;
    }

    Ok((dialogue, components))
}

fn read_tid<'a>(
    data: &'a [u8],
    tag: u8,
    what: &'static str,
) -> Result<(TransactionId, &'a [u8]), DecodeError> {
    let (_, value, rest) =
        asn1::read(data, Expect::Tag(tag))?.ok_or(DecodeError::Malformed(what))?;

    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| DecodeError::BadLength("transaction id"))?;

    Ok((TransactionId::from_be_bytes(bytes), rest))
}

fn read_abort_cause(data: &[u8]) -> Result<AbortCause, DecodeError> {
    let (tag, value, _) =
        asn1::read(data, Expect::Any)?.ok_or(DecodeError::Malformed("abort cause"))?;

    match tag {
        TAG_PABORT => {
            let cause = ProtocolCause::from_u8(asn1::single_octet(value)?)
                .ok_or(DecodeError::Malformed("abort cause value"))?;
            Ok(AbortCause::Protocol(cause))
        }
        TAG_DIALOGUE => Ok(AbortCause::Dialogue(DialoguePdu::decode(value)?)),
        other => Err(DecodeError::UnrecognizedTag(other)),
    }
}

/// Best-effort extraction of the id an abort reply should address.
///
/// Only Begin and Continue carry the sender's own (originating) id; End
/// and Abort cannot be answered.
pub fn reply_tid(data: &[u8]) -> Option<TransactionId> {
    let (tag, content, _) = asn1::read(data, Expect::Any).ok()??;
    if tag != MessageTag::Begin as u8 && tag != MessageTag::Continue as u8 {
        return None;
    }

    let (_, value, _) = asn1::read(content, Expect::Tag(TAG_OTID)).ok()??;
    let bytes: [u8; 4] = value.try_into().ok()?;
    Some(TransactionId::from_be_bytes(bytes))
}
