//! 设备与服务器之间的连接
//! 单纯的缓冲读写管理，以帧为单位消费，不包含任何协议状态

use bytes::{BufMut, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};

use super::packet::{self, AvlDecoder, AvlFrame, ImeiFrame};

/// 读缓冲上限，远大于最大合法 AVL 帧
pub(crate) const MAX_READ_BUFFER: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    IO(#[from] std::io::Error),
    #[error("Idle timeout")]
    Idle(#[from] time::error::Elapsed),
    #[error("Connection closed by peer")]
    ConnectionAborted,
    #[error("Read buffer overflow")]
    BufferOverflow,
}

/// 一条设备连接
/// 读写都先走缓冲区而非按字节直接操作 socket
pub(crate) struct DeviceConnection<T> {
    stream: T,
    /// 读缓冲区
    read: BytesMut,
    /// 写缓冲区
    write: BytesMut,
    /// 自上次取数以来读到的字节数
    read_since_taken: u64,
}

impl<T: AsyncRead + AsyncWrite + Unpin> DeviceConnection<T> {
    pub(crate) fn new(stream: T) -> Self {
        Self {
            stream,
            read: BytesMut::new(),
            write: BytesMut::new(),
            read_since_taken: 0,
        }
    }

    /// 读出登录帧，连接上的第一条消息
    pub(crate) async fn read_imei(&mut self) -> Result<ImeiFrame, Error> {
        loop {
            let required = match ImeiFrame::read(&mut self.read) {
                Ok(frame) => return Ok(frame),
                Err(packet::Error::InsufficientBytes(n)) => n,
                Err(e) => return Err(Error::Packet(e)),
            };
            self.read_bytes(required).await?;
        }
    }

    /// 读出一个完整的 AVL 帧
    pub(crate) async fn read_avl(
        &mut self,
        decoder: &mut AvlDecoder,
    ) -> Result<AvlFrame, Error> {
        loop {
            let required = match decoder.read(&mut self.read) {
                Ok(frame) => return Ok(frame),
                Err(packet::Error::InsufficientBytes(n)) => n,
                Err(e) => return Err(Error::Packet(e)),
            };
            self.read_bytes(required).await?;
        }
    }

    /// 等待从 socket 读出至少所需长度的数据，放入缓冲区
    async fn read_bytes(&mut self, required: usize) -> Result<(), Error> {
        if self.read.len() + required > MAX_READ_BUFFER {
            return Err(Error::BufferOverflow);
        }
        let mut total_read = 0;
        loop {
            let read = self.stream.read_buf(&mut self.read).await?;
            if read == 0 {
                return Err(Error::ConnectionAborted);
            }
            self.read_since_taken += read as u64;
            if self.read.len() > MAX_READ_BUFFER {
                return Err(Error::BufferOverflow);
            }
            total_read += read;
            if total_read >= required {
                return Ok(());
            }
        }
    }

    /// 取走自上次调用以来读到的字节数，报注册表统计用
    pub(crate) fn take_bytes_read(&mut self) -> u64 {
        std::mem::take(&mut self.read_since_taken)
    }

    /// 登录确认，单字节 0x01
    pub(crate) async fn write_login_ack(&mut self) -> Result<(), Error> {
        self.write.put_u8(0x01);
        self.flush().await
    }

    /// 帧确认，4 字节大端记录数；被限流丢弃的帧回 0
    pub(crate) async fn write_record_ack(&mut self, count: u32) -> Result<(), Error> {
        self.write.put_u32(count);
        self.flush().await
    }

    /// 写失败不重试，由上层断开连接
    async fn flush(&mut self) -> Result<(), Error> {
        if self.write.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write).await?;
        self.write.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::super::packet::test_util::hex;
    use super::*;

    #[tokio::test]
    async fn imei_then_avl_works() {
        let (mut client, server) = duplex(4096);
        let mut conn = DeviceConnection::new(server);

        client
            .write_all(&hex("000f 333533363931383431303035313334"))
            .await
            .unwrap();
        let login = conn.read_imei().await.unwrap();
        assert_eq!(login.imei, "353691841005134");
        assert_eq!(conn.take_bytes_read(), 17);
    }

    #[tokio::test]
    async fn eof_is_connection_aborted() {
        let (client, server) = duplex(4096);
        let mut conn = DeviceConnection::new(server);
        drop(client);
        assert!(matches!(
            conn.read_imei().await,
            Err(Error::ConnectionAborted)
        ));
    }

    #[tokio::test]
    async fn read_buffer_is_capped() {
        let (_client, server) = duplex(64);
        let mut conn = DeviceConnection::new(server);
        conn.read = BytesMut::from(&vec![0u8; MAX_READ_BUFFER][..]);
        assert!(matches!(
            conn.read_bytes(1).await,
            Err(Error::BufferOverflow)
        ));
    }

    #[tokio::test]
    async fn acks_are_flushed() {
        let (mut client, server) = duplex(4096);
        let mut conn = DeviceConnection::new(server);
        conn.write_login_ack().await.unwrap();
        conn.write_record_ack(7).await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x00, 0x00, 0x00, 0x07]);
    }
}
