use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::protocol::DaskPacket;
use crate::trace::{trace_packet_receive, trace_packet_send};

/// Dask packet framing: a little-endian `u64` frame count, followed by one
/// `u64` length per frame, followed by the frame payloads. The first frame
/// is always empty, the second is the MsgPack main frame, the rest are
/// opaque payload frames.
#[derive(Default)]
pub struct DaskCodec {
    /// Parsed header of the packet currently being received:
    /// (main frame size, additional frame sizes).
    sizes: Option<(u64, Vec<u64>)>,
}

impl Decoder for DaskCodec {
    type Item = DaskPacket;
    type Error = crate::DsError;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<DaskPacket>> {
        if self.sizes.is_none() {
            if src.len() < 8 {
                return Ok(None);
            }
            let count = LittleEndian::read_u64(&src[..8]);
            if count < 2 {
                return Err("malformed packet: less than two frames".into());
            }
            let header_size = ((count + 1) * 8) as usize;
            if src.len() < header_size {
                src.reserve(header_size - src.len());
                return Ok(None);
            }
            src.advance(8);
            let leading = src.get_u64_le();
            if leading != 0 {
                return Err("malformed packet: non-empty leading frame".into());
            }
            let main_size = src.get_u64_le();
            let mut additional = Vec::with_capacity((count - 2) as usize);
            for _ in 2..count {
                additional.push(src.get_u64_le());
            }
            self.sizes = Some((main_size, additional));
        }

        let (main_size, additional) = self.sizes.as_ref().unwrap();
        let payload_size = main_size + additional.iter().sum::<u64>();
        if (src.len() as u64) < payload_size {
            src.reserve(payload_size as usize - src.len());
            return Ok(None);
        }
        trace_packet_receive(payload_size as usize);

        let main_frame = src.split_to(*main_size as usize);
        let additional_frames = additional
            .iter()
            .map(|&size| src.split_to(size as usize))
            .collect();
        self.sizes = None;
        Ok(Some(DaskPacket::new(main_frame, additional_frames)))
    }
}

impl Encoder<DaskPacket> for DaskCodec {
    type Error = crate::DsError;

    fn encode(&mut self, item: DaskPacket, dst: &mut BytesMut) -> crate::Result<()> {
        let header_size = (item.frame_count() + 1) * 8;
        let total_size = header_size + item.payload_bytes();
        trace_packet_send(total_size);

        dst.reserve(total_size);
        dst.put_u64_le(item.frame_count() as u64);
        dst.put_u64_le(0);
        dst.put_u64_le(item.main_frame.len() as u64);
        for frame in &item.additional_frames {
            dst.put_u64_le(frame.len() as u64);
        }
        dst.extend_from_slice(&item.main_frame);
        for frame in &item.additional_frames {
            dst.extend_from_slice(frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DaskCodec;
    use crate::protocol::protocol::DaskPacket;
    use bytes::{BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_roundtrip() {
        let packet = DaskPacket::new(
            BytesMut::from([1u8, 2u8, 3u8].as_ref()),
            vec![
                BytesMut::from([4u8, 5u8, 6u8].as_ref()),
                BytesMut::from([7u8, 8u8, 9u8].as_ref()),
            ],
        );
        let mut codec = DaskCodec::default();
        let mut buffer = BytesMut::default();
        codec.encode(packet, &mut buffer).unwrap();

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.main_frame.to_vec(), vec![1, 2, 3]);
        assert_eq!(decoded.additional_frames.len(), 2);
        assert_eq!(decoded.additional_frames[1].to_vec(), vec![7, 8, 9]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_decode_stream() {
        let mut buf = BytesMut::default();
        let sizes: Vec<usize> = vec![13, 17, 2, 1];

        for _ in 0..3 {
            buf.put_u64_le((2 + sizes.len()) as u64);
            buf.put_u64_le(0);
            buf.put_u64_le(1);
            for &size in sizes.iter() {
                buf.put_u64_le(size as u64);
            }
            buf.put_u8(137u8);
            for &size in sizes.iter() {
                buf.put_slice(
                    &std::iter::repeat(size as u8)
                        .take(size)
                        .collect::<Vec<u8>>(),
                );
            }
        }

        let mut codec = DaskCodec::default();
        for _ in 0..3 {
            let packet = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(packet.main_frame.to_vec(), vec![137u8]);
            assert_eq!(packet.additional_frames.len(), sizes.len());
            for (&size, frame) in sizes.iter().zip(packet.additional_frames.iter()) {
                assert_eq!(frame.len(), size);
                assert_eq!(frame.to_vec(), vec![size as u8; size]);
            }
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_input() {
        let packet = DaskPacket::new(BytesMut::from([42u8; 100].as_ref()), vec![]);
        let mut codec = DaskCodec::default();
        let mut buffer = BytesMut::default();
        codec.encode(packet, &mut buffer).unwrap();

        let mut partial = BytesMut::from(&buffer[..20]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&buffer[20..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.main_frame.len(), 100);
    }
}
