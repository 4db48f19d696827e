use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use crate::common::data::Value;
use crate::common::Map;
use crate::protocol::codec::DaskCodec;
use crate::protocol::key::DaskKey;

pub type Frame = BytesMut;
pub type Frames = Vec<Frame>;

/// A single message on the wire: a MsgPack-encoded main frame plus zero or
/// more opaque payload frames.
#[derive(Debug, Clone, Default)]
pub struct DaskPacket {
    pub main_frame: Frame,
    pub additional_frames: Frames,
}

impl DaskPacket {
    pub fn new(main_frame: Frame, additional_frames: Frames) -> Self {
        Self {
            main_frame,
            additional_frames,
        }
    }

    /// Number of frames on the wire, including the empty leading frame.
    pub fn frame_count(&self) -> usize {
        2 + self.additional_frames.len()
    }

    pub fn payload_bytes(&self) -> usize {
        self.main_frame.len()
            + self
                .additional_frames
                .iter()
                .map(|frame| frame.len())
                .sum::<usize>()
    }
}

/// Encodes a message (or a batch of messages) into a single-frame packet.
pub fn serialize_single_packet<T: Serialize>(item: &T) -> crate::Result<DaskPacket> {
    let buffer = rmp_serde::to_vec_named(item)?;
    Ok(DaskPacket::new(BytesMut::from(buffer.as_slice()), vec![]))
}

pub fn deserialize_packet<T: DeserializeOwned>(packet: &DaskPacket) -> crate::Result<T> {
    Ok(rmp_serde::from_slice(&packet.main_frame)?)
}

/// Messages may arrive singly or batched into an array; either way the
/// result is a flat list of dynamic values to dispatch one by one.
pub fn packet_to_messages(packet: &DaskPacket) -> crate::Result<Vec<Value>> {
    let value = rmpv::decode::read_value(&mut packet.main_frame.as_ref())?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

pub fn message_from_value<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    rmpv::ext::from_value(value)
        .map_err(|e| crate::DsError::GenericError(format!("malformed message: {}", e)))
}

/// Decodes a `{key: value}` reply (e.g. a peer's `get_data` response).
pub fn packet_to_value_map(packet: &DaskPacket) -> crate::Result<Map<DaskKey, Value>> {
    let value = rmpv::decode::read_value(&mut packet.main_frame.as_ref())?;
    let pairs = match value {
        Value::Map(pairs) => pairs,
        _ => return Err("expected a key/value map".into()),
    };
    let mut map = Map::with_capacity(pairs.len());
    for (key, value) in pairs {
        match key {
            Value::String(s) => match s.into_str() {
                Some(key) => {
                    map.insert(key, value);
                }
                None => return Err("map key is not valid UTF-8".into()),
            },
            _ => return Err("map key is not a string".into()),
        }
    }
    Ok(map)
}

pub fn asyncread_to_stream<R: AsyncRead>(reader: R) -> FramedRead<R, DaskCodec> {
    FramedRead::new(reader, DaskCodec::default())
}

pub fn asyncwrite_to_sink<W: AsyncWrite>(writer: W) -> FramedWrite<W, DaskCodec> {
    FramedWrite::new(writer, DaskCodec::default())
}

pub fn dask_framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, DaskCodec> {
    Framed::new(io, DaskCodec::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        op: String,
        id: u64,
    }

    #[test]
    fn test_single_packet_roundtrip() {
        let msg = Ping {
            op: "ping".into(),
            id: 3,
        };
        let packet = serialize_single_packet(&msg).unwrap();
        let parsed: Ping = deserialize_packet(&packet).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_packet_to_messages_single() {
        let packet = serialize_single_packet(&Ping {
            op: "ping".into(),
            id: 1,
        })
        .unwrap();
        let messages = packet_to_messages(&packet).unwrap();
        assert_eq!(messages.len(), 1);
        let parsed: Ping = message_from_value(messages.into_iter().next().unwrap()).unwrap();
        assert_eq!(parsed.id, 1);
    }

    #[test]
    fn test_packet_to_messages_batched() {
        let batch = vec![
            Ping {
                op: "ping".into(),
                id: 1,
            },
            Ping {
                op: "ping".into(),
                id: 2,
            },
        ];
        let packet = serialize_single_packet(&batch).unwrap();
        let messages = packet_to_messages(&packet).unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_value_map() {
        let mut map: Map<DaskKey, Value> = Map::default();
        map.insert("x".to_owned(), Value::from(42));
        let packet = serialize_single_packet(&map).unwrap();
        let parsed = packet_to_value_map(&packet).unwrap();
        assert_eq!(parsed.get("x"), Some(&Value::from(42)));
    }
}
