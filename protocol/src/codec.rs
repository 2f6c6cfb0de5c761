//! 帧编解码
//!
//! 帧格式:
//! ```text
//! ┌────────────────┬────────────────────────────────┐
//! │  Length (4B)   │          Body (bincode)        │
//! │    u32 LE      │      Packet { kind, payload }  │
//! └────────────────┴────────────────────────────────┘
//! ```
//!
//! Length 只计算包体，不含帧头。

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::HEADER_SIZE;

/// 将数据包编码为包体（不含帧头）
pub fn encode_body(packet: &Packet) -> Result<Vec<u8>> {
    Ok(bincode::serialize(packet)?)
}

/// 从包体解码数据包
pub fn decode_body(body: &[u8]) -> Result<Packet> {
    Ok(bincode::deserialize(body)?)
}

/// 编码完整的帧：4 字节小端长度 + 包体
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>> {
    let body = encode_body(packet)?;
    let length = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// 帧重组器
///
/// 固定容量的接收缓冲区。`received` 记录缓冲区开头处尚未消费的有效字节数，
/// 帧头始终位于偏移 0。
pub struct FrameAssembler {
    buffer: Vec<u8>,
    received: usize,
}

impl FrameAssembler {
    /// 创建指定容量的重组器
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity.max(HEADER_SIZE)],
            received: 0,
        }
    }

    /// 缓冲区容量
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// 当前等待组帧的字节数
    pub fn received(&self) -> usize {
        self.received
    }

    /// 缓冲区中可写入的空闲部分
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.received..]
    }

    /// 标记刚写入 `unfilled_mut()` 的 `n` 个字节
    pub fn advance(&mut self, n: usize) {
        self.received = (self.received + n).min(self.buffer.len());
    }

    /// 复制字节到缓冲区，返回实际接收的字节数
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let unfilled = self.unfilled_mut();
        let n = bytes.len().min(unfilled.len());
        unfilled[..n].copy_from_slice(&bytes[..n]);
        self.advance(n);
        n
    }

    /// 取出下一个完整的帧
    ///
    /// 数据不足时返回 `Ok(None)`。包体解码失败时该帧已经从缓冲区移除，
    /// 后续帧不受影响。
    pub fn next_frame(&mut self) -> Result<Option<Packet>> {
        if self.received < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        let max = self.buffer.len() - HEADER_SIZE;
        if length > max {
            return Err(ProtocolError::FrameTooLarge { size: length, max });
        }

        let frame_len = HEADER_SIZE + length;
        if self.received < frame_len {
            return Ok(None);
        }

        let packet = decode_body(&self.buffer[HEADER_SIZE..frame_len]);

        // 将属于后续帧的剩余字节移到缓冲区开头
        self.buffer.copy_within(frame_len..self.received, 0);
        self.received -= frame_len;

        packet.map(Some)
    }
}

/// 帧读取器
pub struct FrameReader<R> {
    reader: R,
    assembler: FrameAssembler,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// 创建新的帧读取器
    pub fn new(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            assembler: FrameAssembler::new(capacity),
        }
    }

    /// 读取并解码一帧
    ///
    /// 缓冲区中已有完整帧时不会读取套接字。对端关闭写方向时返回
    /// `ConnectionClosed`。
    pub async fn read_frame(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = self.assembler.next_frame()? {
                return Ok(packet);
            }

            let n = self.reader.read(self.assembler.unfilled_mut()).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.assembler.advance(n);
        }
    }
}

/// 帧写入器
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// 创建新的帧写入器
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// 编码并以一次写入发送整帧
    pub async fn write_frame(&mut self, packet: &Packet) -> Result<()> {
        let frame = encode_frame(packet)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 关闭写方向
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PacketKind;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip_all_kinds() {
        let packets = [
            Packet::ping(),
            Packet::pong(),
            Packet::disconnect(),
            Packet::message(""),
            Packet::message("Hello, world!"),
        ];
        for packet in packets {
            let body = encode_body(&packet).unwrap();
            assert_eq!(decode_body(&body).unwrap(), packet);
        }
    }

    #[test]
    fn test_message_frame_layout() {
        let frame = encode_frame(&Packet::message("Ping")).unwrap();

        // kind(u32) + payload 长度(u64) + 4 字节文本
        assert_eq!(&frame[..HEADER_SIZE], &[16, 0, 0, 0]);
        assert_eq!(frame.len(), HEADER_SIZE + 16);

        let packet = decode_body(&frame[HEADER_SIZE..]).unwrap();
        assert_eq!(packet.kind, PacketKind::Message);
        assert_eq!(packet.payload, b"Ping");
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let packet = Packet::message(&"x".repeat(300));
        let frame = encode_frame(&packet).unwrap();
        let length = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(length, frame.len() - HEADER_SIZE);
    }

    #[test]
    fn test_decode_truncated_body() {
        let body = encode_body(&Packet::message("truncated")).unwrap();
        let err = decode_body(&body[..body.len() - 3]).unwrap_err();
        assert!(err.is_frame_local());
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut body = encode_body(&Packet::ping()).unwrap();
        body[0] = 9;
        assert!(matches!(
            decode_body(&body),
            Err(ProtocolError::Serialization(_))
        ));
    }

    #[test]
    fn test_byte_at_a_time_matches_single_shot() {
        let frame = encode_frame(&Packet::message("split across reads")).unwrap();

        let mut whole = FrameAssembler::new(64);
        whole.extend(&frame);
        let expected = whole.next_frame().unwrap().unwrap();

        let mut split = FrameAssembler::new(64);
        let mut decoded = Vec::new();
        for byte in &frame {
            split.extend(std::slice::from_ref(byte));
            while let Some(packet) = split.next_frame().unwrap() {
                decoded.push(packet);
            }
        }

        assert_eq!(decoded, vec![expected]);
        assert_eq!(split.received(), 0);
    }

    #[test]
    fn test_drains_every_buffered_frame() {
        let mut bytes = encode_frame(&Packet::message("first")).unwrap();
        bytes.extend(encode_frame(&Packet::ping()).unwrap());
        bytes.extend(encode_frame(&Packet::message("third")).unwrap());

        let mut assembler = FrameAssembler::new(256);
        assembler.extend(&bytes);

        let mut kinds = Vec::new();
        while let Some(packet) = assembler.next_frame().unwrap() {
            kinds.push(packet.kind);
        }
        assert_eq!(
            kinds,
            vec![PacketKind::Message, PacketKind::Ping, PacketKind::Message]
        );
    }

    #[test]
    fn test_leftover_bytes_are_compacted() {
        let first = encode_frame(&Packet::message("a")).unwrap();
        let second = encode_frame(&Packet::message("b")).unwrap();

        let mut assembler = FrameAssembler::new(128);
        assembler.extend(&first);
        assembler.extend(&second[..5]);

        assert_eq!(assembler.next_frame().unwrap(), Some(Packet::message("a")));
        assert_eq!(assembler.received(), 5);
        assert_eq!(assembler.next_frame().unwrap(), None);

        assembler.extend(&second[5..]);
        assert_eq!(assembler.next_frame().unwrap(), Some(Packet::message("b")));
        assert_eq!(assembler.received(), 0);
    }

    #[test]
    fn test_frame_larger_than_buffer() {
        let frame = encode_frame(&Packet::message(&"y".repeat(100))).unwrap();
        let mut assembler = FrameAssembler::new(32);
        assembler.extend(&frame);
        assert!(matches!(
            assembler.next_frame(),
            Err(ProtocolError::FrameTooLarge { max: 28, .. })
        ));
    }

    #[test]
    fn test_malformed_body_is_skipped() {
        // 长度正确但类型标签未知的帧
        let mut bad = encode_frame(&Packet::pong()).unwrap();
        bad[HEADER_SIZE] = 42;
        bad.extend(encode_frame(&Packet::message("after")).unwrap());

        let mut assembler = FrameAssembler::new(128);
        assembler.extend(&bad);

        assert!(assembler.next_frame().is_err());
        assert_eq!(
            assembler.next_frame().unwrap(),
            Some(Packet::message("after"))
        );
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buffer = Vec::new();

        {
            let mut writer = FrameWriter::new(&mut buffer);
            writer.write_frame(&Packet::message("test_user")).await.unwrap();
            writer.write_frame(&Packet::disconnect()).await.unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(&buffer), 64);
        assert_eq!(reader.read_frame().await.unwrap(), Packet::message("test_user"));
        assert_eq!(reader.read_frame().await.unwrap(), Packet::disconnect());
        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
