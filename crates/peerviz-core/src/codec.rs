//! Wire codec for the experiment event stream.
//!
//! Events are ASCII strings terminated by `;` and concatenated with no other
//! framing. Each event starts with a 3-character opcode followed by
//! comma-separated fields:
//!
//! ```text
//! CON<id>,<group>;
//! COM<from>,<to>,<group>;
//! CTM<id>,<target_name>,<received>,<target>;
//! END<id>;
//! ```
//!
//! The server answers `END` with the 2-byte acknowledgement [`END_ACK`].

use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::error::ProtocolError;

/// Event terminator.
pub const DELIMITER: u8 = b';';

/// Field separator inside one event.
pub const FIELD_SEPARATOR: char = ',';

/// Acknowledgement written to a peer once the end barrier releases it.
pub const END_ACK: &[u8; 2] = b"OK";

/// Group name emitted by the instrumentation layer when it reflects on a
/// metaclass instead of a real community. Never materialized as a group.
pub const NO_GROUP_SENTINEL: &str = "ABCMeta";

/// Upper bound for an unterminated fragment held between reads.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const OP_CONNECT: &str = "CON";
const OP_COMMUNICATE: &str = "COM";
const OP_PROGRESS: &str = "CTM";
const OP_END: &str = "END";

// ─── Event ──────────────────────────────────────────────────────

/// One decoded event, one variant per opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `CON`: node `id` joined `group`.
    Connect { id: String, group: String },
    /// `COM`: communication observed from `from` to `to` in `group`.
    Communicate {
        from: String,
        to: String,
        group: String,
    },
    /// `CTM`: node `id` reached `received` out of `target` for `target_name`.
    Progress {
        id: String,
        target_name: String,
        received: f64,
        target: f64,
    },
    /// `END`: node `id` asks to end the experiment.
    End { id: String },
}

impl Event {
    pub fn connect(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self::Connect {
            id: id.into(),
            group: group.into(),
        }
    }

    pub fn communicate(
        from: impl Into<String>,
        to: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self::Communicate {
            from: from.into(),
            to: to.into(),
            group: group.into(),
        }
    }

    pub fn progress(
        id: impl Into<String>,
        target_name: impl Into<String>,
        received: f64,
        target: f64,
    ) -> Self {
        Self::Progress {
            id: id.into(),
            target_name: target_name.into(),
            received,
            target,
        }
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::End { id: id.into() }
    }

    pub fn opcode(&self) -> &'static str {
        match self {
            Self::Connect { .. } => OP_CONNECT,
            Self::Communicate { .. } => OP_COMMUNICATE,
            Self::Progress { .. } => OP_PROGRESS,
            Self::End { .. } => OP_END,
        }
    }

    /// Whether the producer must wait for [`END_ACK`] after sending this event.
    pub fn awaits_ack(&self) -> bool {
        matches!(self, Self::End { .. })
    }

    /// Serialize to one terminated wire event.
    ///
    /// Fails if any string field contains `,` or `;`, which would corrupt
    /// the framing on the receiving side.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        let fields: Vec<&str> = match self {
            Self::Connect { id, group } => vec![id.as_str(), group.as_str()],
            Self::Communicate { from, to, group } => {
                vec![from.as_str(), to.as_str(), group.as_str()]
            }
            Self::Progress {
                id, target_name, ..
            } => vec![id.as_str(), target_name.as_str()],
            Self::End { id } => vec![id.as_str()],
        };
        if let Some(bad) = fields
            .iter()
            .find(|f| f.contains(FIELD_SEPARATOR) || f.contains(DELIMITER as char))
        {
            return Err(ProtocolError::ReservedCharacter((*bad).to_string()));
        }
        let mut frame = self.to_string();
        frame.push(DELIMITER as char);
        Ok(frame)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode())?;
        match self {
            Self::Connect { id, group } => write!(f, "{id},{group}"),
            Self::Communicate { from, to, group } => write!(f, "{from},{to},{group}"),
            Self::Progress {
                id,
                target_name,
                received,
                target,
            } => write!(f, "{id},{target_name},{received},{target}"),
            Self::End { id } => f.write_str(id),
        }
    }
}

impl FromStr for Event {
    type Err = ProtocolError;

    /// Parse one event body (without the trailing `;`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (opcode, rest) = match (s.get(..3), s.get(3..)) {
            (Some(op), Some(rest)) => (op, rest),
            _ => return Err(ProtocolError::MissingOpcode(s.to_string())),
        };
        let fields: Vec<&str> = rest.split(FIELD_SEPARATOR).collect();

        match opcode {
            OP_CONNECT => {
                let [id, group] = take_fields::<2>(OP_CONNECT, &fields)?;
                Ok(Self::connect(id, group))
            }
            OP_COMMUNICATE => {
                let [from, to, group] = take_fields::<3>(OP_COMMUNICATE, &fields)?;
                Ok(Self::communicate(from, to, group))
            }
            OP_PROGRESS => {
                let [id, target_name, received, target] = take_fields::<4>(OP_PROGRESS, &fields)?;
                let received = parse_number("received", received)?;
                let target = parse_number("target", target)?;
                if target == 0.0 {
                    return Err(ProtocolError::ZeroTarget);
                }
                Ok(Self::progress(id, target_name, received, target))
            }
            OP_END => {
                let [id] = take_fields::<1>(OP_END, &fields)?;
                Ok(Self::end(id))
            }
            other => Err(ProtocolError::UnknownOpcode(other.to_string())),
        }
    }
}

fn take_fields<'a, const N: usize>(
    opcode: &'static str,
    fields: &[&'a str],
) -> Result<[&'a str; N], ProtocolError> {
    let array: [&str; N] = fields.try_into().map_err(|_| ProtocolError::FieldCount {
        opcode,
        expected: N,
        got: fields.len(),
    })?;
    if let Some(index) = array.iter().position(|f| f.is_empty()) {
        return Err(ProtocolError::EmptyField { opcode, index });
    }
    Ok(array)
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, ProtocolError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| ProtocolError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

// ─── Stream decoder ─────────────────────────────────────────────

/// Splits a byte stream on `;` and decodes each event.
///
/// An unterminated trailing fragment stays buffered until the rest of it
/// arrives. Malformed events surface as `Ok(Some(Err(_)))` so the stream
/// keeps going; only transport failures end it.
#[derive(Debug)]
pub struct EventCodec {
    max_frame_len: usize,
    /// Skipping the remainder of an oversized fragment up to its `;`.
    discarding: bool,
}

impl EventCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            discarding: false,
        }
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EventCodec {
    type Item = Result<Event, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == DELIMITER) else {
                if self.discarding {
                    src.clear();
                } else if src.len() > self.max_frame_len {
                    src.clear();
                    self.discarding = true;
                    return Ok(Some(Err(ProtocolError::FrameTooLong {
                        limit: self.max_frame_len,
                    })));
                }
                return Ok(None);
            };

            let frame = src.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let body = &frame[..pos];
            if body.is_empty() {
                continue;
            }
            return Ok(Some(decode_body(body)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let fragment = String::from_utf8_lossy(src).into_owned();
        src.clear();
        tracing::debug!(fragment = %fragment, "discarding unterminated fragment at end of stream");
        Ok(None)
    }
}

fn decode_body(body: &[u8]) -> Result<Event, ProtocolError> {
    std::str::from_utf8(body)
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .parse()
}
