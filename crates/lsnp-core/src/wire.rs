//! LSNP wire format — the line-oriented text frame every peer speaks.
//!
//! A datagram carries exactly one frame: `KEY: value` header lines, a blank
//! line, and an optional binary body whose length is given by the `SIZE`
//! header. Header keys are case-sensitive; values may not contain newlines;
//! the body is binary-transparent. Changing anything here is a protocol
//! break for every peer on the segment.
//!
//! Decoding is deliberately tolerant: `\r\n` line endings are accepted,
//! lines without a `": "` separator are skipped, and unknown headers are
//! preserved verbatim so a newer peer's fields survive re-encoding. Only a
//! missing required header, a missing terminator, or a truncated body
//! rejects the frame.
//!
//! `SIZE` names the body length on body-carrying frames. `FILE_OFFER` reuses
//! the key for the advertised file size — it carries no body, so the two
//! meanings never meet in one frame.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::token::Scope;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Well-known LSNP port. Every peer binds and sends here.
pub const DEFAULT_PORT: u16 = 50999;

/// Maximum encoded frame size: 64 KiB minus IPv4 + UDP overhead.
pub const MAX_DATAGRAM: usize = 65_507;

/// Default file-chunk body size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

// ── Frame types ───────────────────────────────────────────────────────────────

/// Every frame type on the wire. The `TYPE` header carries the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Profile,
    Ping,
    Pong,
    Post,
    Like,
    Chat,
    GroupChat,
    GroupUpdate,
    FileOffer,
    FileAccept,
    FileReject,
    FileData,
    FileComplete,
    FileCancel,
    GameInvite,
    GameInviteAck,
    GameMove,
    GameResult,
    GameResign,
    GameResync,
    Ack,
    Revoke,
}

impl FrameType {
    pub const ALL: [FrameType; 22] = [
        FrameType::Profile,
        FrameType::Ping,
        FrameType::Pong,
        FrameType::Post,
        FrameType::Like,
        FrameType::Chat,
        FrameType::GroupChat,
        FrameType::GroupUpdate,
        FrameType::FileOffer,
        FrameType::FileAccept,
        FrameType::FileReject,
        FrameType::FileData,
        FrameType::FileComplete,
        FrameType::FileCancel,
        FrameType::GameInvite,
        FrameType::GameInviteAck,
        FrameType::GameMove,
        FrameType::GameResult,
        FrameType::GameResign,
        FrameType::GameResync,
        FrameType::Ack,
        FrameType::Revoke,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Profile => "PROFILE",
            FrameType::Ping => "PING",
            FrameType::Pong => "PONG",
            FrameType::Post => "POST",
            FrameType::Like => "LIKE",
            FrameType::Chat => "CHAT",
            FrameType::GroupChat => "GROUP_CHAT",
            FrameType::GroupUpdate => "GROUP_UPDATE",
            FrameType::FileOffer => "FILE_OFFER",
            FrameType::FileAccept => "FILE_ACCEPT",
            FrameType::FileReject => "FILE_REJECT",
            FrameType::FileData => "FILE_DATA",
            FrameType::FileComplete => "FILE_COMPLETE",
            FrameType::FileCancel => "FILE_CANCEL",
            FrameType::GameInvite => "GAME_INVITE",
            FrameType::GameInviteAck => "GAME_INVITE_ACK",
            FrameType::GameMove => "GAME_MOVE",
            FrameType::GameResult => "GAME_RESULT",
            FrameType::GameResign => "GAME_RESIGN",
            FrameType::GameResync => "GAME_RESYNC",
            FrameType::Ack => "ACK",
            FrameType::Revoke => "REVOKE",
        }
    }

    /// Token scope a frame of this type must carry. `None` means the type is
    /// processed without a token (ACK, REVOKE).
    pub fn scope(self) -> Option<Scope> {
        match self {
            FrameType::Profile | FrameType::Post | FrameType::Like | FrameType::GroupUpdate => {
                Some(Scope::Broadcast)
            }
            FrameType::Ping | FrameType::Pong => Some(Scope::Presence),
            FrameType::Chat | FrameType::GroupChat => Some(Scope::Chat),
            FrameType::FileOffer
            | FrameType::FileAccept
            | FrameType::FileReject
            | FrameType::FileData
            | FrameType::FileComplete
            | FrameType::FileCancel => Some(Scope::File),
            FrameType::GameInvite
            | FrameType::GameInviteAck
            | FrameType::GameMove
            | FrameType::GameResult
            | FrameType::GameResign
            | FrameType::GameResync => Some(Scope::Game),
            FrameType::Ack | FrameType::Revoke => None,
        }
    }

    /// Whether the receiver must reply with an ACK and the sender retries
    /// until one arrives.
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            FrameType::Chat
                | FrameType::GroupChat
                | FrameType::FileOffer
                | FrameType::FileAccept
                | FrameType::FileReject
                | FrameType::FileData
                | FrameType::FileComplete
                | FrameType::FileCancel
                | FrameType::GameInvite
                | FrameType::GameInviteAck
                | FrameType::GameMove
                | FrameType::GameResult
                | FrameType::GameResign
                | FrameType::GameResync
        )
    }

    /// Whether a frame of this type carries a body.
    pub fn has_body(self) -> bool {
        matches!(
            self,
            FrameType::Post | FrameType::Chat | FrameType::GroupChat | FrameType::FileData
        )
    }

    /// Headers that must be present for the frame to be dispatched.
    /// Absence rejects the frame as malformed.
    pub fn required_headers(self) -> &'static [&'static str] {
        match self {
            FrameType::Profile => &["USER_ID", "DISPLAY_NAME", "STATUS", "TOKEN"],
            FrameType::Ping => &["USER_ID", "TOKEN"],
            FrameType::Pong => &["USER_ID", "TO", "TOKEN"],
            FrameType::Post => &["POST_ID", "FROM", "TOKEN"],
            FrameType::Like => &["POST_ID", "FROM", "TOKEN"],
            FrameType::Chat => &["MESSAGE_ID", "FROM", "TO", "TOKEN"],
            FrameType::GroupChat => &["MESSAGE_ID", "GROUP_ID", "FROM", "TO", "TOKEN"],
            FrameType::GroupUpdate => &["GROUP_ID", "CREATOR", "MEMBERS", "NAME", "TOKEN"],
            FrameType::FileOffer => &[
                "MESSAGE_ID",
                "TRANSFER_ID",
                "FROM",
                "TO",
                "FILENAME",
                "SIZE",
                "CHUNK_SIZE",
                "CHUNK_COUNT",
                "TOKEN",
            ],
            FrameType::FileAccept | FrameType::FileReject => {
                &["MESSAGE_ID", "TRANSFER_ID", "FROM", "TO", "TOKEN"]
            }
            FrameType::FileData => &["MESSAGE_ID", "TRANSFER_ID", "CHUNK_INDEX", "TOKEN"],
            FrameType::FileComplete | FrameType::FileCancel => {
                &["MESSAGE_ID", "TRANSFER_ID", "TOKEN"]
            }
            FrameType::GameInvite => &["MESSAGE_ID", "GAME_ID", "FROM", "TO", "TOKEN"],
            FrameType::GameInviteAck => &["MESSAGE_ID", "GAME_ID", "FROM", "TO", "TOKEN"],
            FrameType::GameMove => &[
                "MESSAGE_ID",
                "GAME_ID",
                "MOVE_NO",
                "POSITION",
                "PLAYER",
                "TOKEN",
            ],
            FrameType::GameResult | FrameType::GameResign => &["MESSAGE_ID", "GAME_ID", "TOKEN"],
            FrameType::GameResync => &["MESSAGE_ID", "GAME_ID", "BOARD", "MOVE_NO", "TOKEN"],
            FrameType::Ack => &["MESSAGE_ID"],
            FrameType::Revoke => &["USER_ID"],
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameType {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FrameType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| WireError::UnknownType(s.to_string()))
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// A parsed or under-construction frame: type, ordered headers, optional body.
#[derive(Debug, Clone)]
pub struct Frame {
    frame_type: FrameType,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl Frame {
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Append a header. Last write wins on lookup is not a thing here —
    /// the first occurrence of a key is the one `get` returns.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &'static str) -> Result<&str, WireError> {
        self.get(key).ok_or(WireError::MissingHeader(key))
    }

    /// Fetch and parse a header value. A present-but-unparseable value is
    /// rejected the same way a missing one is: the frame is malformed.
    pub fn require_parsed<T: FromStr>(&self, key: &'static str) -> Result<T, WireError> {
        let raw = self.require(key)?;
        raw.parse().map_err(|_| WireError::BadValue {
            header: key,
            value: raw.to_string(),
        })
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Body interpreted as UTF-8 text (chat and post payloads).
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get("MESSAGE_ID")
    }

    pub fn token(&self) -> Option<&str> {
        self.get("TOKEN")
    }

    /// The claimed sender, wherever the type carries it: `FROM`, `USER_ID`,
    /// `CREATOR`, or finally the first segment of the token.
    pub fn sender(&self) -> Option<&str> {
        self.get("FROM")
            .or_else(|| self.get("USER_ID"))
            .or_else(|| self.get("CREATOR"))
            .or_else(|| self.token().and_then(|t| t.split('|').next()))
    }

    // ── Encode ────────────────────────────────────────────────────────────────

    /// Serialize to a single datagram. `TYPE` is emitted first, then the
    /// headers in insertion order, `SIZE` for the body when one is present.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = Vec::with_capacity(128 + self.body.as_ref().map_or(0, |b| b.len()));
        push_header(&mut out, "TYPE", self.frame_type.as_str())?;
        for (k, v) in &self.headers {
            push_header(&mut out, k, v)?;
        }
        if let Some(body) = &self.body {
            push_header(&mut out, "SIZE", &body.len().to_string())?;
        }
        out.push(b'\n');
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        if out.len() > MAX_DATAGRAM {
            return Err(WireError::Oversize { len: out.len() });
        }
        Ok(Bytes::from(out))
    }

    // ── Decode ────────────────────────────────────────────────────────────────

    /// Parse one datagram. Tolerates `\r\n`, skips separator-less lines,
    /// preserves unknown headers, validates the type's required headers and
    /// body.
    pub fn decode(datagram: &[u8]) -> Result<Frame, WireError> {
        let (header_end, body_start) =
            find_terminator(datagram).ok_or(WireError::Unterminated)?;

        let header_text =
            std::str::from_utf8(&datagram[..header_end]).map_err(|_| WireError::NotUtf8)?;

        let mut headers = Vec::new();
        for line in header_text.lines() {
            let line = line.trim_end_matches('\r');
            // Only `": "` splits; anything else is noise and skipped.
            if let Some((k, v)) = line.split_once(": ") {
                headers.push((k.trim().to_string(), v.trim().to_string()));
            }
        }

        let type_str = headers
            .iter()
            .find(|(k, _)| k == "TYPE")
            .map(|(_, v)| v.clone())
            .ok_or(WireError::MissingHeader("TYPE"))?;
        let frame_type: FrameType = type_str.parse()?;
        headers.retain(|(k, _)| k != "TYPE");

        let body = if frame_type.has_body() {
            let frame = Frame {
                frame_type,
                headers: headers.clone(),
                body: None,
            };
            let size: usize = frame.require_parsed("SIZE")?;
            let raw = &datagram[body_start..];
            if raw.len() < size {
                return Err(WireError::BodyTruncated {
                    expected: size,
                    actual: raw.len(),
                });
            }
            Some(Bytes::copy_from_slice(&raw[..size]))
        } else {
            None
        };

        let frame = Frame {
            frame_type,
            headers,
            body,
        };
        for key in frame_type.required_headers() {
            if frame.get(key).is_none() {
                return Err(WireError::MissingHeader(key));
            }
        }
        Ok(frame)
    }
}

fn push_header(out: &mut Vec<u8>, key: &str, value: &str) -> Result<(), WireError> {
    if value.contains('\n') || value.contains('\r') || key.contains('\n') || key.contains('\r') {
        return Err(WireError::ValueHasNewline(key.to_string()));
    }
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
    Ok(())
}

/// Locate the blank line ending the header block. Returns the byte offset of
/// the newline that closes the last header line, and the start of the body.
/// Accepts `\n\n`, `\n\r\n`, and `\r\n\r\n` terminators.
fn find_terminator(datagram: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < datagram.len() {
        if datagram[i] == b'\n' {
            match (datagram.get(i + 1), datagram.get(i + 2)) {
                (Some(b'\n'), _) => return Some((i, i + 2)),
                (Some(b'\r'), Some(b'\n')) => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that reject a frame at the codec boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("no blank-line terminator in datagram")]
    Unterminated,

    #[error("header block is not valid UTF-8")]
    NotUtf8,

    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    #[error("unknown frame type {0:?}")]
    UnknownType(String),

    #[error("bad value for {header}: {value:?}")]
    BadValue { header: &'static str, value: String },

    #[error("body truncated: SIZE says {expected}, got {actual} bytes")]
    BodyTruncated { expected: usize, actual: usize },

    #[error("header value for {0} contains a newline")]
    ValueHasNewline(String),

    #[error("encoded frame is {len} bytes, exceeds {MAX_DATAGRAM}")]
    Oversize { len: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chat() -> Frame {
        Frame::new(FrameType::Chat)
            .with("MESSAGE_ID", "ab12cd34")
            .with("FROM", "alice@192.168.1.10")
            .with("TO", "bob@192.168.1.11")
            .with("TOKEN", "alice@192.168.1.10|1999999999|chat")
            .with_body(Bytes::from_static(b"hello"))
    }

    #[test]
    fn chat_round_trip() {
        let encoded = sample_chat().encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.frame_type(), FrameType::Chat);
        assert_eq!(decoded.get("FROM"), Some("alice@192.168.1.10"));
        assert_eq!(decoded.message_id(), Some("ab12cd34"));
        assert_eq!(decoded.body_text().as_deref(), Some("hello"));
    }

    #[test]
    fn binary_body_survives() {
        let blob: Vec<u8> = (0..=255u8).collect();
        let frame = Frame::new(FrameType::FileData)
            .with("MESSAGE_ID", "t1:0")
            .with("TRANSFER_ID", "t1")
            .with("CHUNK_INDEX", "0")
            .with("TOKEN", "alice@192.168.1.10|1999999999|file")
            .with_body(Bytes::from(blob.clone()));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.body().unwrap().as_ref(), &blob[..]);
    }

    #[test]
    fn crlf_headers_accepted() {
        let raw = b"TYPE: PING\r\nUSER_ID: alice@192.168.1.10\r\nTOKEN: alice@192.168.1.10|1999999999|presence\r\n\r\n";
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(frame.frame_type(), FrameType::Ping);
        assert_eq!(frame.get("USER_ID"), Some("alice@192.168.1.10"));
    }

    #[test]
    fn unterminated_rejected() {
        let raw = b"TYPE: PING\nUSER_ID: alice@192.168.1.10\n";
        assert!(matches!(Frame::decode(raw), Err(WireError::Unterminated)));
    }

    #[test]
    fn missing_required_header_rejected() {
        let raw = b"TYPE: PING\nTOKEN: alice@192.168.1.10|1999999999|presence\n\n";
        assert!(matches!(
            Frame::decode(raw),
            Err(WireError::MissingHeader("USER_ID"))
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let raw = b"TYPE: GOSSIP\nUSER_ID: x@1.2.3.4\n\n";
        assert!(matches!(
            Frame::decode(raw),
            Err(WireError::UnknownType(t)) if t == "GOSSIP"
        ));
    }

    #[test]
    fn unknown_headers_preserved() {
        let raw =
            b"TYPE: PING\nUSER_ID: a@1.2.3.4\nTOKEN: a@1.2.3.4|1999999999|presence\nX_FUTURE: yes\n\n";
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(frame.get("X_FUTURE"), Some("yes"));
    }

    #[test]
    fn separator_less_lines_skipped() {
        let raw = b"TYPE: REVOKE\ngarbage line\nUSER_ID: a@1.2.3.4\n\n";
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(frame.frame_type(), FrameType::Revoke);
    }

    #[test]
    fn truncated_body_rejected() {
        let frame = Frame::new(FrameType::Chat)
            .with("MESSAGE_ID", "m")
            .with("FROM", "a@1.2.3.4")
            .with("TO", "b@1.2.3.5")
            .with("TOKEN", "a@1.2.3.4|1999999999|chat")
            .with_body(Bytes::from_static(b"hello"));
        let mut encoded = frame.encode().unwrap().to_vec();
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(
            Frame::decode(&encoded),
            Err(WireError::BodyTruncated {
                expected: 5,
                actual: 3
            })
        ));
    }

    #[test]
    fn newline_in_value_refused_at_encode() {
        let frame = Frame::new(FrameType::Revoke).with("USER_ID", "a@1.2.3.4\nTYPE: PING");
        assert!(matches!(
            frame.encode(),
            Err(WireError::ValueHasNewline(_))
        ));
    }

    #[test]
    fn every_ack_required_type_carries_message_id() {
        for t in FrameType::ALL {
            if t.requires_ack() {
                assert!(
                    t.required_headers().contains(&"MESSAGE_ID"),
                    "{t} requires ack but not MESSAGE_ID"
                );
            }
        }
    }

    #[test]
    fn scope_table_matches_protocol() {
        assert_eq!(FrameType::Profile.scope(), Some(Scope::Broadcast));
        assert_eq!(FrameType::Ping.scope(), Some(Scope::Presence));
        assert_eq!(FrameType::Chat.scope(), Some(Scope::Chat));
        assert_eq!(FrameType::FileData.scope(), Some(Scope::File));
        assert_eq!(FrameType::GameMove.scope(), Some(Scope::Game));
        assert_eq!(FrameType::Ack.scope(), None);
        assert_eq!(FrameType::Revoke.scope(), None);
    }

    #[test]
    fn sender_falls_back_to_token() {
        let raw = b"TYPE: FILE_COMPLETE\nMESSAGE_ID: m1\nTRANSFER_ID: t1\nTOKEN: carol@10.0.0.3|1999999999|file\n\n";
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(frame.sender(), Some("carol@10.0.0.3"));
    }
}
