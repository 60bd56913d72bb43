//! Wire encoding of consensus messages.
//!
//! Every message travels as an `Envelope` of `{version, message_type,
//! payload}` where the payload is the protobuf encoding of the message's
//! wire struct. Decoding goes back through the validating constructors in
//! `message`, so malformed input is rejected before it reaches the engine.

use prost::Message;

use crate::error::{BallotError, Result};
use crate::message::{
    AppendRequest, AppendResponse, HeartbeatRequest, HeartbeatResponse, MessageType, Request,
    Response, RpcMessage, VoteRequest, VoteResponse,
};
use crate::raft::log::{Command, LogEntry};

/// Protocol version. Bump on breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint32, tag = "2")]
    pub message_type: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Protobuf payloads, one per message kind.
pub mod wire {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LogEntry {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(uint64, tag = "2")]
        pub index: u64,
        #[prost(bool, tag = "3")]
        pub noop: bool,
        #[prost(bytes = "vec", tag = "4")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct HeartbeatRequest {
        #[prost(uint32, tag = "1")]
        pub member: u32,
        #[prost(uint64, tag = "2")]
        pub term: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct HeartbeatResponse {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(string, optional, tag = "2")]
        pub leader: Option<String>,
        #[prost(bool, tag = "3")]
        pub recognized: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VoteRequest {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(string, tag = "2")]
        pub candidate: String,
        #[prost(uint64, tag = "3")]
        pub last_log_index: u64,
        #[prost(uint64, tag = "4")]
        pub last_log_term: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VoteResponse {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(bool, tag = "2")]
        pub voted: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AppendRequest {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(string, tag = "2")]
        pub leader: String,
        #[prost(uint64, tag = "3")]
        pub prev_log_index: u64,
        #[prost(uint64, tag = "4")]
        pub prev_log_term: u64,
        #[prost(message, repeated, tag = "5")]
        pub entries: Vec<LogEntry>,
        #[prost(uint64, tag = "6")]
        pub leader_commit: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AppendResponse {
        #[prost(uint64, tag = "1")]
        pub term: u64,
        #[prost(bool, tag = "2")]
        pub succeeded: bool,
        #[prost(uint64, tag = "3")]
        pub log_index: u64,
    }
}

/// Serialization seam between messages and the transport.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, message: &RpcMessage) -> Result<Envelope>;

    fn decode(&self, envelope: &Envelope) -> Result<RpcMessage>;

    fn encode_request(&self, request: Request) -> Result<Envelope> {
        self.encode(&request.into())
    }

    fn encode_response(&self, response: Response) -> Result<Envelope> {
        self.encode(&response.into())
    }

    fn decode_request(&self, envelope: &Envelope) -> Result<Request> {
        Request::try_from(self.decode(envelope)?)
    }

    fn decode_response(&self, envelope: &Envelope) -> Result<Response> {
        Response::try_from(self.decode(envelope)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufCodec;

impl ProtobufCodec {
    pub fn new() -> Self {
        Self
    }
}

fn pack<M: Message>(message_type: MessageType, payload: &M) -> Envelope {
    Envelope {
        version: PROTOCOL_VERSION,
        message_type: message_type.id(),
        payload: payload.encode_to_vec(),
    }
}

fn entry_to_wire(entry: &LogEntry) -> wire::LogEntry {
    let (noop, data) = match &entry.command {
        Command::Noop => (true, Vec::new()),
        Command::Apply(data) => (false, data.clone()),
    };
    wire::LogEntry {
        term: entry.term,
        index: entry.index,
        noop,
        data,
    }
}

fn entry_from_wire(entry: wire::LogEntry) -> LogEntry {
    let command = if entry.noop {
        Command::Noop
    } else {
        Command::Apply(entry.data)
    };
    LogEntry::new(entry.term, entry.index, command)
}

impl Codec for ProtobufCodec {
    fn encode(&self, message: &RpcMessage) -> Result<Envelope> {
        let envelope = match message {
            RpcMessage::HeartbeatRequest(m) => pack(
                MessageType::HeartbeatRequest,
                &wire::HeartbeatRequest {
                    member: m.member().get(),
                    term: m.term(),
                },
            ),
            RpcMessage::HeartbeatResponse(m) => pack(
                MessageType::HeartbeatResponse,
                &wire::HeartbeatResponse {
                    term: m.term(),
                    leader: m.leader().map(str::to_string),
                    recognized: m.recognized(),
                },
            ),
            RpcMessage::VoteRequest(m) => pack(
                MessageType::VoteRequest,
                &wire::VoteRequest {
                    term: m.term(),
                    candidate: m.candidate().to_string(),
                    last_log_index: m.last_log_index(),
                    last_log_term: m.last_log_term(),
                },
            ),
            RpcMessage::VoteResponse(m) => pack(
                MessageType::VoteResponse,
                &wire::VoteResponse {
                    term: m.term(),
                    voted: m.voted(),
                },
            ),
            RpcMessage::AppendRequest(m) => pack(
                MessageType::AppendRequest,
                &wire::AppendRequest {
                    term: m.term(),
                    leader: m.leader().to_string(),
                    prev_log_index: m.prev_log_index(),
                    prev_log_term: m.prev_log_term(),
                    entries: m.entries().iter().map(entry_to_wire).collect(),
                    leader_commit: m.leader_commit(),
                },
            ),
            RpcMessage::AppendResponse(m) => pack(
                MessageType::AppendResponse,
                &wire::AppendResponse {
                    term: m.term(),
                    succeeded: m.succeeded(),
                    log_index: m.log_index(),
                },
            ),
        };
        Ok(envelope)
    }

    fn decode(&self, envelope: &Envelope) -> Result<RpcMessage> {
        if envelope.version != PROTOCOL_VERSION {
            return Err(BallotError::Codec(format!(
                "unsupported protocol version {} (expected {})",
                envelope.version, PROTOCOL_VERSION
            )));
        }
        let message_type = MessageType::from_id(envelope.message_type).ok_or_else(|| {
            BallotError::Codec(format!("unknown message type {}", envelope.message_type))
        })?;
        let payload = envelope.payload.as_slice();

        let message = match message_type {
            MessageType::HeartbeatRequest => {
                let m = wire::HeartbeatRequest::decode(payload)?;
                RpcMessage::HeartbeatRequest(HeartbeatRequest::new(m.member, m.term)?)
            }
            MessageType::HeartbeatResponse => {
                let m = wire::HeartbeatResponse::decode(payload)?;
                RpcMessage::HeartbeatResponse(HeartbeatResponse::new(
                    m.term,
                    m.leader,
                    m.recognized,
                ))
            }
            MessageType::VoteRequest => {
                let m = wire::VoteRequest::decode(payload)?;
                RpcMessage::VoteRequest(VoteRequest::new(
                    m.term,
                    m.candidate,
                    m.last_log_index,
                    m.last_log_term,
                )?)
            }
            MessageType::VoteResponse => {
                let m = wire::VoteResponse::decode(payload)?;
                RpcMessage::VoteResponse(VoteResponse::new(m.term, m.voted))
            }
            MessageType::AppendRequest => {
                let m = wire::AppendRequest::decode(payload)?;
                RpcMessage::AppendRequest(AppendRequest::new(
                    m.term,
                    m.leader,
                    m.prev_log_index,
                    m.prev_log_term,
                    m.entries.into_iter().map(entry_from_wire).collect(),
                    m.leader_commit,
                )?)
            }
            MessageType::AppendResponse => {
                let m = wire::AppendResponse::decode(payload)?;
                RpcMessage::AppendResponse(AppendResponse::new(m.term, m.succeeded, m.log_index))
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<RpcMessage> {
        vec![
            RpcMessage::HeartbeatRequest(HeartbeatRequest::new(2, 5).unwrap()),
            RpcMessage::HeartbeatResponse(HeartbeatResponse::new(5, Some("a:1".into()), true)),
            RpcMessage::HeartbeatResponse(HeartbeatResponse::new(6, None, false)),
            RpcMessage::VoteRequest(VoteRequest::new(3, "b:1", 4, 2).unwrap()),
            RpcMessage::VoteResponse(VoteResponse::new(3, true)),
            RpcMessage::AppendRequest(
                AppendRequest::new(
                    3,
                    "a:1",
                    1,
                    1,
                    vec![
                        LogEntry::new(3, 2, Command::Noop),
                        LogEntry::new(3, 3, Command::Apply(Vec::new())),
                        LogEntry::new(3, 4, Command::Apply(b"set x=1".to_vec())),
                    ],
                    1,
                )
                .unwrap(),
            ),
            RpcMessage::AppendResponse(AppendResponse::new(3, false, 1)),
        ]
    }

    #[test]
    fn decode_inverts_encode() {
        let codec = ProtobufCodec::new();
        for message in samples() {
            let envelope = codec.encode(&message).unwrap();
            assert_eq!(envelope.version, PROTOCOL_VERSION);
            assert_eq!(envelope.message_type, message.message_type().id());
            assert_eq!(codec.decode(&envelope).unwrap(), message);
        }
    }

    #[test]
    fn heartbeat_uses_type_260() {
        let codec = ProtobufCodec::new();
        let envelope = codec
            .encode_request(Request::Heartbeat(HeartbeatRequest::new(1, 1).unwrap()))
            .unwrap();
        assert_eq!(envelope.message_type, 260);
    }

    #[test]
    fn decode_rejects_member_zero() {
        let envelope = pack(
            MessageType::HeartbeatRequest,
            &wire::HeartbeatRequest { member: 0, term: 1 },
        );
        let err = ProtobufCodec::new().decode(&envelope).unwrap_err();
        assert!(matches!(err, BallotError::InvalidMessage(_)));
    }

    #[test]
    fn decode_rejects_unknown_version_and_type() {
        let codec = ProtobufCodec::new();
        let mut envelope = codec
            .encode(&RpcMessage::VoteResponse(VoteResponse::new(1, false)))
            .unwrap();

        envelope.version = PROTOCOL_VERSION + 1;
        assert!(matches!(codec.decode(&envelope), Err(BallotError::Codec(_))));

        envelope.version = PROTOCOL_VERSION;
        envelope.message_type = 999;
        assert!(matches!(codec.decode(&envelope), Err(BallotError::Codec(_))));
    }

    #[test]
    fn decode_rejects_garbage_payload() {
        let envelope = Envelope {
            version: PROTOCOL_VERSION,
            message_type: MessageType::AppendRequest.id(),
            payload: vec![0xff, 0xff, 0xff],
        };
        assert!(matches!(
            ProtobufCodec::new().decode(&envelope),
            Err(BallotError::DecodeError(_))
        ));
    }

    #[test]
    fn decode_revalidates_append_entries() {
        let envelope = pack(
            MessageType::AppendRequest,
            &wire::AppendRequest {
                term: 2,
                leader: "a:1".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![wire::LogEntry {
                    term: 2,
                    index: 5,
                    noop: true,
                    data: Vec::new(),
                }],
                leader_commit: 0,
            },
        );
        assert!(ProtobufCodec::new().decode(&envelope).is_err());

        // An index at the top of the range cannot be followed
        let envelope = pack(
            MessageType::AppendRequest,
            &wire::AppendRequest {
                term: 2,
                leader: "a:1".to_string(),
                prev_log_index: u64::MAX,
                prev_log_term: 1,
                entries: Vec::new(),
                leader_commit: 0,
            },
        );
        assert!(matches!(
            ProtobufCodec::new().decode(&envelope),
            Err(BallotError::InvalidMessage(_))
        ));
    }

    #[test]
    fn decode_request_rejects_responses() {
        let codec = ProtobufCodec::new();
        let envelope = codec
            .encode_response(Response::Vote(VoteResponse::new(1, true)))
            .unwrap();
        assert!(codec.decode_request(&envelope).is_err());
        assert!(codec.decode_response(&envelope).is_ok());
    }
}
