use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A read cursor over a received message, positioned after the message tag. Every listener
///  gets its own cursor over the same bytes.
pub struct NetworkInMessage {
    message: Bytes,
    cursor: Bytes,
}

impl NetworkInMessage {
    pub fn new(message: Bytes) -> NetworkInMessage {
        let mut cursor = message.clone();
        if cursor.has_remaining() {
            cursor.advance(1);
        }
        NetworkInMessage { message, cursor }
    }

    pub fn tag(&self) -> Option<u8> {
        self.message.first().copied()
    }

    /// The complete message including its tag
    pub fn message(&self) -> &Bytes {
        &self.message
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.cursor.try_get_u8()?)
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        Ok(self.cursor.try_get_u32_le()?)
    }

    pub fn read_array(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.cursor.remaining() < len {
            bail!("cannot read {} bytes, only {} remaining", len, self.cursor.remaining());
        }
        Ok(self.cursor.split_to(len))
    }

    /// Everything after the cursor, leaving the cursor at the end
    pub fn read_rest(&mut self) -> Bytes {
        self.cursor.split_off(0)
    }
}

/// A message being written. The first byte is the message tag. Buffers come from the
///  connection's message pool and should be returned to it after sending.
pub struct NetworkOutMessage {
    buf: BytesMut,
}

impl NetworkOutMessage {
    pub fn new(mut buf: BytesMut, tag: u8) -> NetworkOutMessage {
        buf.clear();
        buf.put_u8(tag);
        NetworkOutMessage { buf }
    }

    pub fn tag(&self) -> u8 {
        self.buf[0]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_array(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_message() {
        let mut msg = NetworkInMessage::new(Bytes::from_static(&[150, 7, 1, 0, 0, 0, 9, 8, 7]));
        assert_eq!(msg.tag(), Some(150));
        assert_eq!(msg.remaining(), 8);
        assert_eq!(msg.read_u8().unwrap(), 7);
        assert_eq!(msg.read_u32().unwrap(), 1);
        assert_eq!(msg.read_array(2).unwrap().as_ref(), &[9, 8]);
        assert!(msg.read_array(2).is_err());
        assert_eq!(msg.read_rest().as_ref(), &[7]);
        assert!(msg.read_u8().is_err());
        assert_eq!(msg.message().len(), 9);
    }

    #[test]
    fn test_empty_in_message() {
        let mut msg = NetworkInMessage::new(Bytes::new());
        assert_eq!(msg.tag(), None);
        assert_eq!(msg.remaining(), 0);
        assert!(msg.read_u32().is_err());
    }

    #[test]
    fn test_independent_cursors() {
        let data = Bytes::from_static(&[150, 1, 2]);
        let mut a = NetworkInMessage::new(data.clone());
        let mut b = NetworkInMessage::new(data);
        assert_eq!(a.read_u8().unwrap(), 1);
        assert_eq!(a.read_u8().unwrap(), 2);
        assert_eq!(b.read_u8().unwrap(), 1);
    }

    #[test]
    fn test_out_message() {
        let mut msg = NetworkOutMessage::new(BytesMut::from(&[1u8, 2, 3][..]), 160);
        assert_eq!(msg.as_slice(), &[160]);
        msg.write_u8(5);
        msg.write_u32(0x01020304);
        msg.write_array(&[9, 9]);
        assert_eq!(msg.tag(), 160);
        assert_eq!(msg.as_slice(), &[160, 5, 4, 3, 2, 1, 9, 9]);
        assert_eq!(msg.len(), 8);

        let mut incoming = NetworkInMessage::new(Bytes::copy_from_slice(msg.as_slice()));
        assert_eq!(incoming.read_u8().unwrap(), 5);
        assert_eq!(incoming.read_u32().unwrap(), 0x01020304);
    }
}
