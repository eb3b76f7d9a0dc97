//! AVL 数据帧
//! 4 字节零前导 + 4 字节数据域长度 + Codec 8 / 8E 记录批 + 4 字节 CRC
//! 记录本体的解析见 [`super::io_element`]

use bytes::{Buf, Bytes, BytesMut};
use log::warn;

use super::{io_element::IoElements, Error};

/// 数据域长度下限：codec id + 两个记录数 + 一条最小记录不可能更短
pub(crate) const MIN_DATA_FIELD_LEN: u32 = 12;
/// 数据域长度上限，远大于设备实际会发的最大帧
pub(crate) const MAX_DATA_FIELD_LEN: u32 = 200_000;
/// 连续丢弃多少个前导垃圾字节后放弃这条连接
pub(crate) const MAX_RESYNC_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Codec8,
    Codec8Ext,
}

impl Codec {
    fn from_id(id: u8) -> Result<Self, Error> {
        match id {
            0x08 => Ok(Codec::Codec8),
            0x8E => Ok(Codec::Codec8Ext),
            other => Err(Error::UnsupportedCodec(other)),
        }
    }

    /// 记录数、IO 元素 id 和分组计数在 Codec 8 里是 8 位，在 8E 里是 16 位
    pub(crate) fn read_count(&self, stream: &mut Bytes) -> Result<u16, Error> {
        match self {
            Codec::Codec8 => Ok(super::read_u8(stream)? as u16),
            Codec::Codec8Ext => super::read_u16(stream),
        }
    }
}

/// GPS 元素
/// 坐标是符号位 + 绝对值的定点数，放大 1e7 倍存储
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gps {
    pub longitude_e7: i32,
    pub latitude_e7: i32,
    pub altitude_m: i16,
    /// 航向角，0 为正北，顺时针
    pub heading_deg: u16,
    pub satellites: u8,
    pub speed_kmh: u16,
}

impl Gps {
    fn read(stream: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            longitude_e7: read_coordinate(stream)?,
            latitude_e7: read_coordinate(stream)?,
            altitude_m: super::read_i16(stream)?,
            heading_deg: super::read_u16(stream)?,
            satellites: super::read_u8(stream)?,
            speed_kmh: super::read_u16(stream)?,
        })
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_e7 as f64 / 10_000_000.0
    }

    pub fn latitude(&self) -> f64 {
        self.latitude_e7 as f64 / 10_000_000.0
    }

    /// 可见卫星太少时坐标不可信
    pub fn position_valid(&self) -> bool {
        self.satellites >= 3
    }
}

fn read_coordinate(stream: &mut Bytes) -> Result<i32, Error> {
    let raw = super::read_u32(stream)?;
    let magnitude = (raw & 0x7FFF_FFFF) as i32;
    Ok(if raw & 0x8000_0000 != 0 {
        -magnitude
    } else {
        magnitude
    })
}

#[derive(Debug, Clone)]
pub struct AvlRecord {
    /// Unix 毫秒时间戳，设备时间轴
    pub timestamp_ms: i64,
    pub priority: u8,
    pub gps: Gps,
    pub io: IoElements,
}

impl AvlRecord {
    fn read(stream: &mut Bytes, codec: Codec) -> Result<Self, Error> {
        Ok(Self {
            timestamp_ms: super::read_i64(stream)?,
            priority: super::read_u8(stream)?,
            gps: Gps::read(stream)?,
            io: IoElements::read(stream, codec)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AvlFrame {
    pub codec: Codec,
    pub records: Vec<AvlRecord>,
    /// CRC 是否匹配，宽松模式下不匹配的帧照常下发
    pub crc_ok: bool,
    /// 帧在线路上占用的字节数，含前导和 CRC
    pub wire_len: usize,
}

/// AVL 帧解码器
/// 前导失配时逐字节丢弃重新对齐；丢弃计数跨多次读取累计，
/// 成功解出一帧才清零
#[derive(Debug)]
pub(crate) struct AvlDecoder {
    strict_crc: bool,
    resync_run: usize,
    crc_mismatches: u64,
}

impl AvlDecoder {
    pub(crate) fn new(strict_crc: bool) -> Self {
        Self {
            strict_crc,
            resync_run: 0,
            crc_mismatches: 0,
        }
    }

    pub(crate) fn crc_mismatches(&self) -> u64 {
        self.crc_mismatches
    }

    /// 尝试从缓冲区头部取出一个完整的 AVL 帧
    pub(crate) fn read(&mut self, stream: &mut BytesMut) -> Result<AvlFrame, Error> {
        // 对齐到零前导
        while stream.len() >= 4 {
            if stream[..4] == [0, 0, 0, 0] {
                break;
            }
            stream.advance(1);
            self.resync_run += 1;
            if self.resync_run >= MAX_RESYNC_BYTES {
                return Err(Error::ResyncExhausted);
            }
        }
        if stream.len() < 8 {
            return Err(Error::InsufficientBytes(8 - stream.len()));
        }

        let data_len = u32::from_be_bytes([stream[4], stream[5], stream[6], stream[7]]);
        if !(MIN_DATA_FIELD_LEN..=MAX_DATA_FIELD_LEN).contains(&data_len) {
            return Err(Error::DataFieldLength(data_len));
        }
        let total = 8 + data_len as usize + 4;
        if stream.len() < total {
            return Err(Error::InsufficientBytes(total - stream.len()));
        }

        // 整帧到齐，从缓冲区取出
        let frame = stream.split_to(total).freeze();
        self.resync_run = 0;

        let mut body = frame.slice(8..8 + data_len as usize);
        let crc_field = u32::from_be_bytes([
            frame[total - 4],
            frame[total - 3],
            frame[total - 2],
            frame[total - 1],
        ]);
        // 协议字段是 4 字节，有效校验值只有低 16 位
        let crc_frame = (crc_field & 0xFFFF) as u16;
        let calculated = crc16_ibm(&body);
        let crc_ok = calculated == crc_frame;
        if !crc_ok {
            if self.strict_crc {
                return Err(Error::CrcMismatch {
                    calculated,
                    frame: crc_frame,
                });
            }
            self.crc_mismatches += 1;
            warn!(
                "crc mismatch on avl frame: calculated {:#06x}, frame {:#06x}",
                calculated, crc_frame
            );
        }

        let codec = Codec::from_id(super::read_u8(&mut body)?)?;
        let header_count = codec.read_count(&mut body)?;
        let mut records = Vec::with_capacity(header_count as usize);
        for _ in 0..header_count {
            records.push(AvlRecord::read(&mut body, codec)?);
        }
        let trailer_count = codec.read_count(&mut body)?;
        if trailer_count != header_count {
            return Err(Error::RecordCountMismatch {
                header: header_count,
                trailer: trailer_count,
            });
        }
        // 记录必须把数据域刚好用完
        if body.has_remaining() {
            return Err(Error::MalformedPacket);
        }

        Ok(AvlFrame {
            codec,
            records,
            crc_ok,
            wire_len: total,
        })
    }
}

/// CRC-16/IBM，多项式 0xA001（反射），初值 0
pub(crate) fn crc16_ibm(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::super::test_util::hex;
    use super::*;

    // Teltonika 文档里的 Codec 8 样例帧：1 条记录，5 个 IO 元素
    const CODEC8_SAMPLE: &str = "000000000000003608010000016B40D8EA30010000000000000000000000000000000105021503010101425E0F01F10000601A014E0000000000000000010000C7CF";
    // 自造的 Codec 8 帧：带坐标和 movement/电量元素
    const CODEC8_MOVING: &str = "000000000000002808010000016b373ef000000f266970206b64240070005a090005f00302f001713701430f7a00000100005bed";
    // 自造的 Codec 8E 帧：16 位 id 与计数，西经坐标
    const CODEC8E_SAMPLE: &str = "000000000000003c8e00010000016b373fda60018f266970206b64240064010e0b000001810003000100f0000000000101810001e24000010010000000003ade68b100010000e46f";

    fn decode(input: &[u8]) -> Result<AvlFrame, Error> {
        AvlDecoder::new(false).read(&mut BytesMut::from(input))
    }

    #[test]
    fn codec8_sample_works() {
        let frame = decode(&hex(CODEC8_SAMPLE)).unwrap();
        assert_eq!(frame.codec, Codec::Codec8);
        assert!(frame.crc_ok);
        assert_eq!(frame.wire_len, 66);
        assert_eq!(frame.records.len(), 1);

        let record = &frame.records[0];
        assert_eq!(record.timestamp_ms, 1_560_161_086_000);
        assert_eq!(record.priority, 1);
        assert_eq!(record.gps.longitude_e7, 0);
        assert_eq!(record.gps.latitude_e7, 0);
        assert!(!record.gps.position_valid());

        assert_eq!(record.io.event_id, 1);
        assert_eq!(record.io.count, 5);
        assert_eq!(record.io.one_byte, vec![(0x15, 3), (0x01, 1)]);
        assert_eq!(record.io.two_byte, vec![(0x42, 0x5E0F)]);
        assert_eq!(record.io.four_byte, vec![(0xF1, 0x601A)]);
        assert_eq!(record.io.eight_byte, vec![(0x4E, 0)]);
    }

    #[test]
    fn codec8_coordinates_work() {
        let frame = decode(&hex(CODEC8_MOVING)).unwrap();
        let record = &frame.records[0];
        assert_eq!(record.timestamp_ms, 1_560_000_000_000);
        assert_eq!(record.gps.longitude_e7, 254_175_600);
        assert_eq!(record.gps.latitude_e7, 543_908_900);
        assert_eq!(record.gps.altitude_m, 112);
        assert_eq!(record.gps.heading_deg, 90);
        assert_eq!(record.gps.satellites, 9);
        assert_eq!(record.gps.speed_kmh, 5);
        assert!(record.gps.position_valid());
        assert!((record.gps.latitude() - 54.390_89).abs() < 1e-9);
        assert!((record.gps.longitude() - 25.417_56).abs() < 1e-9);
        assert_eq!(record.io.u8_value(240), Some(1));
        assert_eq!(record.io.u8_value(113), Some(55));
        assert_eq!(record.io.u16_value(67), Some(3962));
    }

    #[test]
    fn codec8_extended_works() {
        let frame = decode(&hex(CODEC8E_SAMPLE)).unwrap();
        assert_eq!(frame.codec, Codec::Codec8Ext);
        assert!(frame.crc_ok);
        let record = &frame.records[0];
        // 符号位置位，西经
        assert_eq!(record.gps.longitude_e7, -254_175_600);
        assert_eq!(record.io.event_id, 385);
        assert_eq!(record.io.count, 3);
        assert_eq!(record.io.one_byte, vec![(240, 0)]);
        assert_eq!(record.io.four_byte, vec![(385, 123_456)]);
        assert_eq!(record.io.eight_byte, vec![(16, 987_654_321)]);
    }

    #[test]
    fn any_chunking_gives_same_result() {
        // 帧在任意位置被 TCP 切开，结果都和一次到齐相同
        let bytes = hex(CODEC8_SAMPLE);
        for split in 1..bytes.len() {
            let mut decoder = AvlDecoder::new(false);
            let mut buf = BytesMut::from(&bytes[..split]);
            match decoder.read(&mut buf) {
                Err(Error::InsufficientBytes(n)) => {
                    assert!(n > 0, "split {split} asked for zero bytes");
                    buf.extend_from_slice(&bytes[split..]);
                    let frame = decoder.read(&mut buf).unwrap();
                    assert_eq!(frame.records.len(), 1);
                    assert!(buf.is_empty());
                }
                other => panic!("unexpected result at split {split}: {other:?}"),
            }
        }
    }

    #[test]
    fn resync_skips_garbage() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF; 1023]);
        buf.extend_from_slice(&hex(CODEC8_SAMPLE));
        let mut decoder = AvlDecoder::new(false);
        let frame = decoder.read(&mut buf).unwrap();
        assert_eq!(frame.records.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn resync_limit_terminates() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF; 1024]);
        buf.extend_from_slice(&hex(CODEC8_SAMPLE));
        let mut decoder = AvlDecoder::new(false);
        assert!(matches!(
            decoder.read(&mut buf),
            Err(Error::ResyncExhausted)
        ));
    }

    #[test]
    fn resync_run_accumulates_across_reads() {
        // 垃圾分两批到达，丢弃计数必须累计
        let mut decoder = AvlDecoder::new(false);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF; 600]);
        assert!(matches!(
            decoder.read(&mut buf),
            Err(Error::InsufficientBytes(_))
        ));
        buf.extend_from_slice(&[0xFF; 600]);
        assert!(matches!(
            decoder.read(&mut buf),
            Err(Error::ResyncExhausted)
        ));
    }

    #[test]
    fn crc_mismatch_is_counted_when_lenient() {
        let mut bytes = hex(CODEC8_SAMPLE);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut decoder = AvlDecoder::new(false);
        let frame = decoder.read(&mut BytesMut::from(&bytes[..])).unwrap();
        assert!(!frame.crc_ok);
        assert_eq!(frame.records.len(), 1);
        assert_eq!(decoder.crc_mismatches(), 1);
    }

    #[test]
    fn crc_mismatch_is_fatal_when_strict() {
        let mut bytes = hex(CODEC8_SAMPLE);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut decoder = AvlDecoder::new(true);
        assert!(matches!(
            decoder.read(&mut BytesMut::from(&bytes[..])),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn data_field_length_bounds_work() {
        // 长度域小于下限
        let mut buf = BytesMut::from(&hex("0000000000000008")[..]);
        assert!(matches!(
            AvlDecoder::new(false).read(&mut buf),
            Err(Error::DataFieldLength(8))
        ));

        // 长度域超过上限
        let mut buf = BytesMut::from(&hex("000000007fffffff")[..]);
        assert!(matches!(
            AvlDecoder::new(false).read(&mut buf),
            Err(Error::DataFieldLength(0x7FFF_FFFF))
        ));
    }

    #[test]
    fn unsupported_codec_is_rejected() {
        let mut bytes = hex(CODEC8_SAMPLE);
        bytes[8] = 0x0C;
        assert!(matches!(
            decode(&bytes),
            Err(Error::UnsupportedCodec(0x0C))
        ));
    }

    #[test]
    fn record_count_mismatch_is_rejected() {
        let mut bytes = hex(CODEC8_SAMPLE);
        // 尾部记录数在 CRC 之前的最后一个字节
        let trailer = bytes.len() - 5;
        bytes[trailer] = 2;
        assert!(matches!(
            decode(&bytes),
            Err(Error::RecordCountMismatch {
                header: 1,
                trailer: 2
            })
        ));
    }

    #[test]
    fn truncated_record_is_malformed() {
        // 声称 2 条记录但只有 1 条的数据量
        let mut body = vec![0x08, 0x02];
        let valid = hex(CODEC8_MOVING);
        body.extend_from_slice(&valid[10..47]);
        body.push(0x02);
        let mut framed = Vec::new();
        framed.extend_from_slice(&0u32.to_be_bytes());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        framed.extend_from_slice(&(crc16_ibm(&body) as u32).to_be_bytes());
        assert!(matches!(decode(&framed), Err(Error::MalformedPacket)));
    }

    #[test]
    fn crc16_reference_value_works() {
        // CRC-16/IBM 的公开校验值："123456789" -> 0xBB3D
        assert_eq!(crc16_ibm(b"123456789"), 0xBB3D);
    }
}
