//! Client side of the protocol.
//!
//! One TCP connection carries any number of requests; responses arrive in
//! maturity order, not submission order, so callers match them by id.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::codec::{
    Request, Response, ResponseHeader, DEFAULT_MAX_COOKIE_SIZE, RESPONSE_HEADER_LEN,
};
use crate::error::ClientError;

pub struct Client {
    stream: TcpStream,
    next_id: u32,
    max_cookie_size: u32,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            next_id: 1,
            max_cookie_size: DEFAULT_MAX_COOKIE_SIZE,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.stream.local_addr()?)
    }

    /// Send `request` as-is, including its caller-chosen id.
    pub async fn submit(&mut self, request: &Request) -> Result<(), ClientError> {
        self.stream.write_all(&request.encode()).await?;
        log::debug!(
            "[client] → request {} due {} ({} bytes)",
            request.id,
            request.due_time,
            request.cookie.len()
        );
        Ok(())
    }

    /// Ask to be woken at `due_time` (Unix seconds) with `cookie`.
    ///
    /// Ids are handed out sequentially starting at 1.  Returns the id used.
    pub async fn wake_at(
        &mut self,
        due_time: u64,
        cookie: impl Into<Bytes>,
    ) -> Result<u32, ClientError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.submit(&Request::new(id, due_time, cookie)).await?;
        Ok(id)
    }

    /// Read the next response, giving up after `wait`.
    ///
    /// A timeout that strikes mid-frame leaves the stream out of step; the
    /// client should be dropped afterwards.
    pub async fn next_response(&mut self, wait: Duration) -> Result<Response, ClientError> {
        match tokio::time::timeout(wait, self.read_response()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ClientError::Timeout(wait)),
        }
    }

    async fn read_response(&mut self) -> Result<Response, ClientError> {
        let mut header = [0u8; RESPONSE_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let header = ResponseHeader::decode(&header, self.max_cookie_size)?;

        let mut cookie = vec![0u8; header.cookie_size as usize];
        self.stream.read_exact(&mut cookie).await?;
        log::debug!("[client] ← response {} ({} bytes)", header.id, cookie.len());
        Ok(Response {
            id: header.id,
            cookie: Bytes::from(cookie),
        })
    }

    /// Shut down the write side and drop the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
