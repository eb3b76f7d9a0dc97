//! 设备协议帧编解码
//! 两种帧：IMEI 登录帧和 AVL 数据帧，所有多字节字段均为大端

use bytes::{Buf, Bytes};

pub(crate) mod avl;
pub(crate) mod imei;
pub(crate) mod io_element;

pub(crate) use avl::AvlDecoder;
pub use avl::{AvlFrame, AvlRecord, Codec, Gps};
pub(crate) use imei::ImeiFrame;
pub use io_element::IoElements;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Imei length out of range: {0}")]
    ImeiLength(u16),
    #[error("Imei contains non-digit byte: {0:#04x}")]
    ImeiNotDigit(u8),
    #[error("Data field length out of range: {0}")]
    DataFieldLength(u32),
    #[error("Unsupported codec id: {0:#04x}")]
    UnsupportedCodec(u8),
    #[error("Record count mismatch: header {header}, trailer {trailer}")]
    RecordCountMismatch { header: u16, trailer: u16 },
    #[error("Crc mismatch: calculated {calculated:#06x}, frame {frame:#06x}")]
    CrcMismatch { calculated: u16, frame: u16 },
    #[error("Resync limit exceeded")]
    ResyncExhausted,
    #[error("Malformed packet")]
    MalformedPacket,
}

// 帧内读取助手
// 走到这里时整帧已经取出，长度不够说明报文本身是坏的
fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u8())
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u16())
}

fn read_u32(stream: &mut Bytes) -> Result<u32, Error> {
    if stream.len() < 4 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u32())
}

fn read_u64(stream: &mut Bytes) -> Result<u64, Error> {
    if stream.len() < 8 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u64())
}

fn read_i16(stream: &mut Bytes) -> Result<i16, Error> {
    Ok(read_u16(stream)? as i16)
}

fn read_i64(stream: &mut Bytes) -> Result<i64, Error> {
    Ok(read_u64(stream)? as i64)
}

#[cfg(test)]
pub(crate) mod test_util {
    /// 十六进制字符串转字节，测试里写线上抓到的报文用
    pub(crate) fn hex(s: &str) -> Vec<u8> {
        let digits: Vec<u8> = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_digit(16).expect("hex digit") as u8)
            .collect();
        digits.chunks(2).map(|p| (p[0] << 4) | p[1]).collect()
    }
}
