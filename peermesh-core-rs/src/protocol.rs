//! Wire protocol for mesh messages
//!
//! Every frame is a self-describing JSON envelope
//! `{"type": <int>, "senderId": <int>, "data": <string>}`. The `data` string
//! is opaque at the envelope level; the helpers below encode and decode the
//! payload shapes each message type uses.

use crate::error::CodecError;
use crate::types::{DeviceInfo, PeerId, Pose};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator for DATA_RELIABLE and DEVICE_INFO payload fields
pub const FIELD_SEPARATOR: char = '|';

/// Separator for POSE_UPDATE numeric tuples
pub const POSE_SEPARATOR: char = ',';

const RELIABLE_SEQ_TAG: &str = "seq";
const RELIABLE_ACK_TAG: &str = "ack";

/// Message type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Handshake,
    Election,
    Ok,
    Coordinator,
    PoseUpdate,
    DeviceInfo,
    DataReliable,
    DataUnreliable,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::Handshake => 0,
            MessageType::Election => 1,
            MessageType::Ok => 2,
            MessageType::Coordinator => 3,
            MessageType::PoseUpdate => 4,
            MessageType::DeviceInfo => 5,
            MessageType::DataReliable => 6,
            MessageType::DataUnreliable => 7,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageType::Handshake),
            1 => Ok(MessageType::Election),
            2 => Ok(MessageType::Ok),
            3 => Ok(MessageType::Coordinator),
            4 => Ok(MessageType::PoseUpdate),
            5 => Ok(MessageType::DeviceInfo),
            6 => Ok(MessageType::DataReliable),
            7 => Ok(MessageType::DataUnreliable),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Handshake => "HANDSHAKE",
            MessageType::Election => "ELECTION",
            MessageType::Ok => "OK",
            MessageType::Coordinator => "COORDINATOR",
            MessageType::PoseUpdate => "POSE_UPDATE",
            MessageType::DeviceInfo => "DEVICE_INFO",
            MessageType::DataReliable => "DATA_RELIABLE",
            MessageType::DataUnreliable => "DATA_UNRELIABLE",
        };
        f.write_str(name)
    }
}

/// Envelope exchanged between peers. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(rename = "senderId")]
    sender_id: PeerId,
    #[serde(default)]
    data: String,
}

impl MeshMessage {
    pub fn new(kind: MessageType, sender_id: PeerId, data: impl Into<String>) -> Self {
        Self {
            kind,
            sender_id,
            data: data.into(),
        }
    }

    pub fn handshake(sender: PeerId) -> Self {
        Self::new(MessageType::Handshake, sender, "")
    }

    pub fn election(sender: PeerId) -> Self {
        Self::new(MessageType::Election, sender, "")
    }

    pub fn ok(sender: PeerId) -> Self {
        Self::new(MessageType::Ok, sender, "")
    }

    /// COORDINATOR announcement, optionally carrying a bootstrap anchor id
    pub fn coordinator(sender: PeerId, anchor: Option<&str>) -> Self {
        Self::new(MessageType::Coordinator, sender, anchor.unwrap_or(""))
    }

    pub fn pose_update(sender: PeerId, pose: &Pose) -> Self {
        Self::new(MessageType::PoseUpdate, sender, encode_pose(pose))
    }

    pub fn device_info(sender: PeerId, info: &DeviceInfo) -> Self {
        Self::new(MessageType::DeviceInfo, sender, encode_device_info(info))
    }

    pub fn reliable(sender: PeerId, frame: &ReliableFrame) -> Self {
        Self::new(MessageType::DataReliable, sender, frame.encode())
    }

    pub fn unreliable(sender: PeerId, payload: impl Into<String>) -> Self {
        Self::new(MessageType::DataUnreliable, sender, payload)
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn sender_id(&self) -> PeerId {
        self.sender_id
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// Anchor carried by a COORDINATOR message, if any
    pub fn anchor(&self) -> Option<&str> {
        if self.kind == MessageType::Coordinator && !self.data.is_empty() {
            Some(&self.data)
        } else {
            None
        }
    }

    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for MeshMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.kind, self.sender_id)
    }
}

/// DATA_RELIABLE sub-frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliableFrame {
    /// Sequenced payload awaiting acknowledgement
    Seq { seq: u64, payload: String },
    /// Acknowledgement of a sequenced payload
    Ack { seq: u64 },
}

impl ReliableFrame {
    pub fn seq(&self) -> u64 {
        match self {
            ReliableFrame::Seq { seq, .. } | ReliableFrame::Ack { seq } => *seq,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ReliableFrame::Seq { seq, payload } => {
                format!("{RELIABLE_SEQ_TAG}{FIELD_SEPARATOR}{seq}{FIELD_SEPARATOR}{payload}")
            }
            ReliableFrame::Ack { seq } => format!("{RELIABLE_ACK_TAG}{FIELD_SEPARATOR}{seq}"),
        }
    }

    /// Parse a DATA_RELIABLE payload. The application payload may itself
    /// contain the separator; only the first two fields are split off.
    pub fn decode(data: &str) -> Result<Self, CodecError> {
        let mut parts = data.splitn(3, FIELD_SEPARATOR);
        let tag = parts.next().unwrap_or_default();
        let seq = parts
            .next()
            .ok_or_else(|| CodecError::Malformed(format!("missing sequence in {:?}", data)))?
            .parse::<u64>()
            .map_err(|e| CodecError::Malformed(format!("bad sequence number: {}", e)))?;

        match tag {
            RELIABLE_SEQ_TAG => Ok(ReliableFrame::Seq {
                seq,
                payload: parts.next().unwrap_or_default().to_string(),
            }),
            RELIABLE_ACK_TAG => Ok(ReliableFrame::Ack { seq }),
            other => Err(CodecError::Malformed(format!("unknown reliable tag {:?}", other))),
        }
    }
}

/// Encode a pose as 3 (position) or 7 (position + orientation) fields
pub fn encode_pose(pose: &Pose) -> String {
    let mut fields: Vec<String> = pose.position.iter().map(|v| v.to_string()).collect();
    if let Some(q) = pose.orientation {
        fields.extend(q.iter().map(|v| v.to_string()));
    }
    fields.join(&POSE_SEPARATOR.to_string())
}

/// Decode either legacy pose shape, dispatching on field count
pub fn decode_pose(data: &str) -> Result<Pose, CodecError> {
    let values = data
        .split(POSE_SEPARATOR)
        .map(|f| f.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CodecError::Malformed(format!("bad pose field: {}", e)))?;

    match values.len() {
        3 => Ok(Pose::position(values[0], values[1], values[2])),
        7 => Ok(Pose::position(values[0], values[1], values[2])
            .with_orientation([values[3], values[4], values[5], values[6]])),
        n => Err(CodecError::PoseFieldCount(n)),
    }
}

pub fn encode_device_info(info: &DeviceInfo) -> String {
    format!("{}{}{}", info.display_name, FIELD_SEPARATOR, info.device_model)
}

/// Names may contain the separator, models may not
pub fn decode_device_info(data: &str) -> Result<DeviceInfo, CodecError> {
    let (name, model) = data
        .rsplit_once(FIELD_SEPARATOR)
        .ok_or_else(|| CodecError::Malformed(format!("device info without separator: {:?}", data)))?;

    Ok(DeviceInfo {
        display_name: name.to_string(),
        device_model: model.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let msg = MeshMessage::election(PeerId(42));
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(json["type"], 1);
        assert_eq!(json["senderId"], 42);
        assert_eq!(json["data"], "");
    }

    #[test]
    fn test_message_serialization() {
        let msg = MeshMessage::coordinator(PeerId(7), Some("anchor-1"));

        let bytes = msg.to_bytes().unwrap();
        let parsed = MeshMessage::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.kind(), MessageType::Coordinator);
        assert_eq!(parsed.sender_id(), PeerId(7));
        assert_eq!(parsed.anchor(), Some("anchor-1"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let bytes = br#"{"type":42,"senderId":1,"data":""}"#;
        assert!(MeshMessage::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(MeshMessage::from_bytes(b"not json").is_err());
        assert!(MeshMessage::from_bytes(br#"{"type":0}"#).is_err());
    }

    #[test]
    fn test_missing_data_defaults_to_empty() {
        let parsed = MeshMessage::from_bytes(br#"{"type":0,"senderId":9}"#).unwrap();
        assert_eq!(parsed.kind(), MessageType::Handshake);
        assert_eq!(parsed.data(), "");
    }

    #[test]
    fn test_pose_legacy_shapes() {
        let short = decode_pose("1,2,3").unwrap();
        assert_eq!(short.position, [1.0, 2.0, 3.0]);
        assert!(short.orientation.is_none());

        let long = decode_pose("1,2,3,0,0,0,1").unwrap();
        assert_eq!(long.orientation, Some([0.0, 0.0, 0.0, 1.0]));

        assert!(matches!(decode_pose("1,2"), Err(CodecError::PoseFieldCount(2))));
        assert!(decode_pose("1,x,3").is_err());
    }

    #[test]
    fn test_pose_encoding_field_count() {
        let pose = Pose::position(0.5, 1.0, -2.0).with_orientation([0.0, 0.7, 0.0, 0.7]);
        assert_eq!(encode_pose(&pose).split(POSE_SEPARATOR).count(), 7);
        assert_eq!(decode_pose(&encode_pose(&pose)).unwrap(), pose);
    }

    #[test]
    fn test_reliable_frame_payload_may_contain_separator() {
        let frame = ReliableFrame::Seq {
            seq: 12,
            payload: "a|b|c".to_string(),
        };
        assert_eq!(frame.encode(), "seq|12|a|b|c");
        assert_eq!(ReliableFrame::decode("seq|12|a|b|c").unwrap(), frame);
    }

    #[test]
    fn test_reliable_frame_ack() {
        assert_eq!(ReliableFrame::Ack { seq: 3 }.encode(), "ack|3");
        assert_eq!(
            ReliableFrame::decode("ack|3").unwrap(),
            ReliableFrame::Ack { seq: 3 }
        );
    }

    #[test]
    fn test_reliable_frame_malformed() {
        assert!(ReliableFrame::decode("").is_err());
        assert!(ReliableFrame::decode("seq").is_err());
        assert!(ReliableFrame::decode("seq|abc|x").is_err());
        assert!(ReliableFrame::decode("nak|1").is_err());
    }

    #[test]
    fn test_device_info_name_with_separator() {
        let info = decode_device_info("Ana|s phone|Pixel 8").unwrap();
        assert_eq!(info.display_name, "Ana|s phone");
        assert_eq!(info.device_model, "Pixel 8");
        assert!(decode_device_info("no separator").is_err());
    }
}
