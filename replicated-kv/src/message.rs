//! The command envelope exchanged between clients, the leader and followers.
//!
//! One [`Message`] type covers every exchange: client requests and their
//! responses, operations pushed to followers, follower acknowledgements and the
//! catch-up handshake. The byte layout lives in [`crate::wire`].

use std::fmt;

use crate::error::ProtocolError;
use crate::store::Write;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 256;
/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: usize = 4096;
/// Maximum response text length in bytes.
pub const MAX_RESPONSE_LEN: usize = 4096;

/// Operation carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Set = 1,
    Get = 2,
    Delete = 3,
    Ack = 4,
    Sync = 5,
    List = 6,
}

impl TryFrom<u8> for Kind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Kind::Set),
            2 => Ok(Kind::Get),
            3 => Ok(Kind::Delete),
            4 => Ok(Kind::Ack),
            5 => Ok(Kind::Sync),
            6 => Ok(Kind::List),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Set => "SET",
            Kind::Get => "GET",
            Kind::Delete => "DELETE",
            Kind::Ack => "ACK",
            Kind::Sync => "SYNC",
            Kind::List => "LIST",
        };
        f.write_str(name)
    }
}

/// Outcome code: 0 on the wire for success, -1 for error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    Error,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Error => -1,
        }
    }
}

impl TryFrom<i32> for Status {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Status::Ok),
            -1 => Ok(Status::Error),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: Kind,
    pub key: String,
    pub value: String,
    /// Text answer, leader to client only.
    pub response: String,
    pub status: Status,
    /// Leader-assigned; also the "from" position of a SYNC request and the
    /// leader's highest sequence on the terminating ACK.
    pub sequence: u64,
    /// Wall-clock milliseconds, present when last-writer-wins is in use.
    pub timestamp: Option<u64>,
    /// Sender of an acknowledgement in the strict strategy.
    pub follower_id: Option<u32>,
}

impl Message {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            key: String::new(),
            value: String::new(),
            response: String::new(),
            status: Status::Ok,
            sequence: 0,
            timestamp: None,
            follower_id: None,
        }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Self::new(Kind::Set)
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::new(Kind::Get)
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::new(Kind::Delete)
        }
    }

    pub fn list() -> Self {
        Self::new(Kind::List)
    }

    /// Catch-up request for every operation after `from`.
    pub fn sync(from: u64) -> Self {
        Self {
            sequence: from,
            ..Self::new(Kind::Sync)
        }
    }

    /// Acknowledgement of `sequence`, or the end-of-replay marker when sent by
    /// the leader.
    pub fn ack(sequence: u64, follower_id: Option<u32>) -> Self {
        Self {
            sequence,
            follower_id,
            ..Self::new(Kind::Ack)
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Turns a request into a successful reply carrying `response`.
    pub fn reply_ok(mut self, response: impl Into<String>) -> Self {
        self.status = Status::Ok;
        self.response = response.into();
        self
    }

    /// Turns a request into a failed reply carrying `response`.
    pub fn reply_err(mut self, response: impl Into<String>) -> Self {
        self.status = Status::Error;
        self.response = response.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// The store mutation this message describes, if any.
    pub fn as_write(&self) -> Option<Write<'_>> {
        match self.kind {
            Kind::Set => Some(Write::Set {
                key: &self.key,
                value: &self.value,
            }),
            Kind::Delete => Some(Write::Delete { key: &self.key }),
            _ => None,
        }
    }
}

/// Cuts `text` to at most `max` bytes without splitting a character.
pub fn truncate_to(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_match_protocol_table() {
        for (code, kind) in [
            (1, Kind::Set),
            (2, Kind::Get),
            (3, Kind::Delete),
            (4, Kind::Ack),
            (5, Kind::Sync),
            (6, Kind::List),
        ] {
            assert_eq!(kind as u8, code);
            assert_eq!(Kind::try_from(code).unwrap(), kind);
        }
        assert!(matches!(Kind::try_from(0), Err(ProtocolError::UnknownKind(0))));
        assert!(matches!(Kind::try_from(7), Err(ProtocolError::UnknownKind(7))));
    }

    #[test]
    fn only_set_and_delete_are_writes() {
        assert_eq!(
            Message::set("k", "v").as_write(),
            Some(Write::Set { key: "k", value: "v" })
        );
        assert_eq!(Message::delete("k").as_write(), Some(Write::Delete { key: "k" }));
        assert!(Message::get("k").as_write().is_none());
        assert!(Message::sync(3).as_write().is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut text = "aé".repeat(4); // 'é' is two bytes
        truncate_to(&mut text, 4);
        assert_eq!(text, "aéa");

        let mut short = "abc".to_string();
        truncate_to(&mut short, 10);
        assert_eq!(short, "abc");
    }

    #[test]
    fn status_codes() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::Error.code(), -1);
        assert!(Status::try_from(2).is_err());
    }
}
