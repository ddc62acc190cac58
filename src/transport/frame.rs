use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use crate::safe_converter::PrecheckedCast;
use crate::transport::{Reliability, NUM_ORDERING_CHANNELS};

pub const PROTOCOL_VERSION_1: u8 = 1;

const KIND_CONNECT_REQUEST: u8 = 1;
const KIND_CONNECT_ACCEPT: u8 = 2;
const KIND_CONNECT_REFUSED: u8 = 3;
const KIND_DATA: u8 = 4;
const KIND_ACK: u8 = 5;
const KIND_DISCONNECT: u8 = 6;
const KIND_PING: u8 = 7;
const KIND_PONG: u8 = 8;
const KIND_UNCONNECTED_PING: u8 = 9;
const KIND_UNCONNECTED_PONG: u8 = 10;

/// The maximum number of sequence numbers in a single ACK frame, chosen so that an ACK frame
///  always fits into a minimal datagram
pub const MAX_ACKS_PER_FRAME: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    pub reliability: Reliability,
    pub channel: u8,
    /// present iff the reliability mode is reliable
    pub reliable_seq: Option<u32>,
    /// present iff the reliability mode is ordered or sequenced
    pub order_index: Option<u32>,
    pub payload: Bytes,
}

impl DataFrame {
    /// version, kind, reliability, channel, sequence number, ordering index
    pub const MAX_HEADER_LEN: usize = 4 + 2*std::mem::size_of::<u32>();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    ConnectRequest,
    ConnectAccept,
    /// the receiver has no free slots for incoming connections
    ConnectRefused,
    Data(DataFrame),
    Ack(Vec<u32>),
    Disconnect,
    Ping,
    Pong,
    UnconnectedPing,
    UnconnectedPong(Bytes),
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::ConnectRequest => KIND_CONNECT_REQUEST,
            Frame::ConnectAccept => KIND_CONNECT_ACCEPT,
            Frame::ConnectRefused => KIND_CONNECT_REFUSED,
            Frame::Data(_) => KIND_DATA,
            Frame::Ack(_) => KIND_ACK,
            Frame::Disconnect => KIND_DISCONNECT,
            Frame::Ping => KIND_PING,
            Frame::Pong => KIND_PONG,
            Frame::UnconnectedPing => KIND_UNCONNECTED_PING,
            Frame::UnconnectedPong(_) => KIND_UNCONNECTED_PONG,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PROTOCOL_VERSION_1);
        buf.put_u8(self.kind());

        match self {
            Frame::Data(data) => {
                buf.put_u8(data.reliability.into());
                buf.put_u8(data.channel);
                if let Some(seq) = data.reliable_seq {
                    buf.put_u32(seq);
                }
                if let Some(order_index) = data.order_index {
                    buf.put_u32(order_index);
                }
                buf.put_slice(&data.payload);
            }
            Frame::Ack(seqs) => {
                buf.put_u8(seqs.len().prechecked_cast());
                for &seq in seqs {
                    buf.put_u32(seq);
                }
            }
            Frame::UnconnectedPong(descriptor) => {
                buf.put_slice(descriptor);
            }
            _ => {}
        }
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<Frame> {
        let version = buf.try_get_u8()?;
        if version != PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }

        let frame = match buf.try_get_u8()? {
            KIND_CONNECT_REQUEST => Frame::ConnectRequest,
            KIND_CONNECT_ACCEPT => Frame::ConnectAccept,
            KIND_CONNECT_REFUSED => Frame::ConnectRefused,
            KIND_DATA => Frame::Data(Self::deser_data(buf)?),
            KIND_ACK => Frame::Ack(Self::deser_ack(&mut buf)?),
            KIND_DISCONNECT => Frame::Disconnect,
            KIND_PING => Frame::Ping,
            KIND_PONG => Frame::Pong,
            KIND_UNCONNECTED_PING => Frame::UnconnectedPing,
            KIND_UNCONNECTED_PONG => Frame::UnconnectedPong(buf),
            kind => return Err(anyhow!("invalid frame kind {}", kind)),
        };
        Ok(frame)
    }

    fn deser_data(mut buf: Bytes) -> anyhow::Result<DataFrame> {
        let reliability = Reliability::try_from_primitive(buf.try_get_u8()?)?;
        let channel = buf.try_get_u8()?;
        if channel as usize >= NUM_ORDERING_CHANNELS {
            bail!("invalid ordering channel {}", channel);
        }

        let reliable_seq = if reliability.is_reliable() {
            Some(buf.try_get_u32()?)
        }
        else {
            None
        };
        let order_index = if reliability.has_order_index() {
            Some(buf.try_get_u32()?)
        }
        else {
            None
        };

        Ok(DataFrame {
            reliability,
            channel,
            reliable_seq,
            order_index,
            payload: buf,
        })
    }

    fn deser_ack(buf: &mut Bytes) -> anyhow::Result<Vec<u32>> {
        let num_seqs = buf.try_get_u8()? as usize;
        if num_seqs > MAX_ACKS_PER_FRAME {
            bail!("ACK frame with {} sequence numbers exceeds the maximum of {}", num_seqs, MAX_ACKS_PER_FRAME);
        }

        let mut seqs = Vec::with_capacity(num_seqs);
        for _ in 0..num_seqs {
            seqs.push(buf.try_get_u32()?);
        }
        Ok(seqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn data(reliability: Reliability, reliable_seq: Option<u32>, order_index: Option<u32>) -> Frame {
        Frame::Data(DataFrame {
            reliability,
            channel: 3,
            reliable_seq,
            order_index,
            payload: Bytes::from_static(&[200, 1, 2]),
        })
    }

    #[rstest]
    #[case::connect_request(Frame::ConnectRequest, vec![1, 1])]
    #[case::connect_accept(Frame::ConnectAccept, vec![1, 2])]
    #[case::connect_refused(Frame::ConnectRefused, vec![1, 3])]
    #[case::unreliable(data(Reliability::Unreliable, None, None), vec![1, 4, 0, 3, 200, 1, 2])]
    #[case::unreliable_sequenced(data(Reliability::UnreliableSequenced, None, Some(7)), vec![1, 4, 1, 3, 0,0,0,7, 200, 1, 2])]
    #[case::reliable(data(Reliability::Reliable, Some(9), None), vec![1, 4, 2, 3, 0,0,0,9, 200, 1, 2])]
    #[case::reliable_ordered(data(Reliability::ReliableOrdered, Some(9), Some(258)), vec![1, 4, 3, 3, 0,0,0,9, 0,0,1,2, 200, 1, 2])]
    #[case::reliable_sequenced(data(Reliability::ReliableSequenced, Some(1), Some(2)), vec![1, 4, 4, 3, 0,0,0,1, 0,0,0,2, 200, 1, 2])]
    #[case::ack_empty(Frame::Ack(vec![]), vec![1, 5, 0])]
    #[case::ack(Frame::Ack(vec![1, 256]), vec![1, 5, 2, 0,0,0,1, 0,0,1,0])]
    #[case::disconnect(Frame::Disconnect, vec![1, 6])]
    #[case::ping(Frame::Ping, vec![1, 7])]
    #[case::pong(Frame::Pong, vec![1, 8])]
    #[case::unconnected_ping(Frame::UnconnectedPing, vec![1, 9])]
    #[case::unconnected_pong(Frame::UnconnectedPong(Bytes::from_static(b"abc")), vec![1, 10, 97, 98, 99])]
    fn test_ser(#[case] frame: Frame, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let deser = Frame::deser(buf.freeze()).unwrap();
        assert_eq!(deser, frame);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::wrong_version(vec![2, 1])]
    #[case::missing_kind(vec![1])]
    #[case::invalid_kind(vec![1, 99])]
    #[case::invalid_reliability(vec![1, 4, 5, 0])]
    #[case::invalid_channel(vec![1, 4, 0, 32])]
    #[case::missing_seq(vec![1, 4, 2, 0, 0, 0])]
    #[case::missing_order_index(vec![1, 4, 1, 0, 0])]
    #[case::truncated_ack(vec![1, 5, 2, 0, 0, 0, 1])]
    #[case::too_many_acks(vec![1, 5, 17])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        assert!(Frame::deser(Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_max_header_len() {
        let frame = data(Reliability::ReliableOrdered, Some(1), Some(1));
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.len(), DataFrame::MAX_HEADER_LEN + 3);
    }
}
