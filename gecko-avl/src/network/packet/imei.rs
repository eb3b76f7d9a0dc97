//! IMEI 登录帧
//! 2 字节长度前缀 + ASCII 数字，设备建连后的第一条消息

use bytes::BytesMut;

use super::Error;

const IMEI_MIN_LEN: usize = 15;
const IMEI_MAX_LEN: usize = 17;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ImeiFrame {
    pub(crate) imei: String,
}

impl ImeiFrame {
    /// 尝试从缓冲区头部取出一个完整的登录帧
    /// 长度前缀不在 15..=17 之内即认为这不是登录帧，由上层断开连接
    pub(crate) fn read(stream: &mut BytesMut) -> Result<Self, Error> {
        if stream.len() < 2 {
            return Err(Error::InsufficientBytes(2 - stream.len()));
        }
        let n = u16::from_be_bytes([stream[0], stream[1]]) as usize;
        if !(IMEI_MIN_LEN..=IMEI_MAX_LEN).contains(&n) {
            return Err(Error::ImeiLength(n as u16));
        }
        if stream.len() < 2 + n {
            return Err(Error::InsufficientBytes(2 + n - stream.len()));
        }

        // 完整帧已经到齐，从缓冲区取出
        let frame = stream.split_to(2 + n);
        let digits = &frame[2..];
        if let Some(&bad) = digits.iter().find(|b| !b.is_ascii_digit()) {
            return Err(Error::ImeiNotDigit(bad));
        }

        // 全部是 ASCII 数字，不存在非法 utf8
        Ok(Self {
            imei: String::from_utf8_lossy(digits).into_owned(),
        })
    }
}
