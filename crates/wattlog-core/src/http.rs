//! HTTP uplink to the collector
//!
//! Uploads are a single `POST` whose body is the concatenation of encoded
//! frames and whose `Content-Length` is the exact byte count. Any 2xx status
//! is an acknowledgement. Liveness is checked with `GET /ping`, which must
//! answer 200.
//!
//! Every request opens a fresh connection (`Connection: close`). The network
//! stack is reached through the [`Connector`] and [`Connection`] traits so the
//! uplink runs unchanged on the device and in host tests.

extern crate alloc;
use alloc::string::String;

use core::fmt::Write;

use embassy_time::{Duration, with_timeout};
use log::debug;

use crate::config::{PING_PATH, ServerAddress};
use crate::error::{BacklogError, TransportError, UploadError};
use crate::frame::{FRAME_SIZE, ProcessedFrame};

/// Header carrying the device identifier on every upload; the collector
/// rejects uploads without it
pub const DEVICE_ID_HEADER: &str = "Pico-ID";

/// Longest status line we bother to buffer
const STATUS_LINE_MAX: usize = 64;

/// An open byte stream to the collector.
pub trait Connection {
    fn write_all(&mut self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>>;

    /// Reads into `buf`; zero means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, TransportError>>;

    fn close(&mut self) -> impl Future<Output = ()>;
}

/// Opens connections to the collector.
pub trait Connector {
    type Connection<'a>: Connection
    where
        Self: 'a;

    fn connect(
        &mut self,
        addr: ServerAddress,
    ) -> impl Future<Output = Result<Self::Connection<'_>, TransportError>>;
}

/// Whether `status` acknowledges an upload.
pub const fn is_success(status: u16) -> bool {
    status >= 200 && status < 300
}

/// Writes a request head into `out`.
pub fn write_request_head(
    out: &mut String,
    method: &str,
    path: &str,
    host: ServerAddress,
    device_id: &str,
    content_length: Option<u64>,
) {
    let _ = core::write!(
        out,
        "{} {} HTTP/1.1\r\n\
         Host: {}\r\n\
         {}: {}\r\n\
         Connection: close\r\n",
        method,
        path,
        host,
        DEVICE_ID_HEADER,
        device_id,
    );
    if let Some(len) = content_length {
        let _ = core::write!(
            out,
            "Content-Type: application/octet-stream\r\n\
             Content-Length: {}\r\n",
            len
        );
    }
    out.push_str("\r\n");
}

/// Extracts the status code from the start of a response.
pub fn parse_status(response: &[u8]) -> Result<u16, TransportError> {
    let line_end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(response.len());
    let line = core::str::from_utf8(&response[..line_end])
        .map_err(|_| TransportError::MalformedResponse)?;

    let mut parts = line.split(' ');
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") && code.len() == 3 => {
            code.parse().map_err(|_| TransportError::MalformedResponse)
        }
        _ => Err(TransportError::MalformedResponse),
    }
}

/// Reads until the status line is complete and parses it.
async fn read_status<C: Connection>(conn: &mut C) -> Result<u16, TransportError> {
    let mut buf = [0u8; STATUS_LINE_MAX];
    let mut filled = 0;

    while filled < buf.len() {
        let n = conn.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(TransportError::Closed);
            }
            break;
        }
        filled += n;
        if buf[..filled].windows(2).any(|w| w == b"\r\n") {
            break;
        }
    }
    parse_status(&buf[..filled])
}

/// Sends `head` then every body chunk, and returns the response status.
async fn exchange<C, I, B>(conn: &mut C, head: &[u8], body: I) -> Result<u16, UploadError>
where
    C: Connection,
    I: IntoIterator<Item = Result<B, BacklogError>>,
    B: AsRef<[u8]>,
{
    conn.write_all(head).await?;
    for chunk in body {
        conn.write_all(chunk?.as_ref()).await?;
    }
    Ok(read_status(conn).await?)
}

/// Collector client
pub struct HttpUplink<C: Connector> {
    connector: C,
    device_id: String,
    path: &'static str,
    connect_timeout: Duration,
    exchange_timeout: Duration,
}

impl<C: Connector> HttpUplink<C> {
    pub fn new(
        connector: C,
        device_id: &str,
        path: &'static str,
        connect_timeout: Duration,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            device_id: String::from(device_id),
            path,
            connect_timeout,
            exchange_timeout,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    /// Posts `content_length` bytes produced by `body` and returns the status.
    ///
    /// A 2xx status is `Ok`, any other status is [`UploadError::Rejected`].
    pub async fn post<I, B>(
        &mut self,
        addr: ServerAddress,
        content_length: u64,
        body: I,
    ) -> Result<u16, UploadError>
    where
        I: IntoIterator<Item = Result<B, BacklogError>>,
        B: AsRef<[u8]>,
    {
        let mut head = String::new();
        write_request_head(
            &mut head,
            "POST",
            self.path,
            addr,
            &self.device_id,
            Some(content_length),
        );

        let mut conn = with_timeout(self.connect_timeout, self.connector.connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;

        let result = with_timeout(self.exchange_timeout, exchange(&mut conn, head.as_bytes(), body))
            .await
            .unwrap_or(Err(UploadError::Transport(TransportError::Timeout)));
        conn.close().await;

        let status = result?;
        debug!("POST {} to {} -> {}", content_length, addr, status);
        if is_success(status) {
            Ok(status)
        } else {
            Err(UploadError::Rejected { status })
        }
    }

    /// Posts `frames` in one request.
    pub async fn post_frames(
        &mut self,
        addr: ServerAddress,
        frames: &[ProcessedFrame],
    ) -> Result<u16, UploadError> {
        let content_length = (frames.len() * FRAME_SIZE) as u64;
        let body = frames.iter().map(|f| Ok::<_, BacklogError>(f.to_bytes()));
        self.post(addr, content_length, body).await
    }

    /// Checks that a collector answers at `addr`.
    pub async fn ping(&mut self, addr: ServerAddress) -> Result<bool, TransportError> {
        let mut head = String::new();
        write_request_head(&mut head, "GET", PING_PATH, addr, &self.device_id, None);

        let mut conn = with_timeout(self.connect_timeout, self.connector.connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;

        let result = with_timeout(self.exchange_timeout, async {
            conn.write_all(head.as_bytes()).await?;
            Ok::<u16, TransportError>(read_status(&mut conn).await?)
        })
        .await
        .unwrap_or(Err(TransportError::Timeout));
        conn.close().await;

        Ok(result? == 200)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted [`Connector`] for host tests

    use super::*;
    use alloc::collections::VecDeque;
    use alloc::format;
    use alloc::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Outcome {
        /// Accept the connection and answer with this status
        Status(u16),
        /// Fail the connect call
        ConnectFails(TransportError),
        /// Accept, then fail the first write
        WriteFails(TransportError),
        /// Accept, then close without answering
        Silent,
    }

    #[derive(Debug, Default)]
    pub struct MockConnector {
        pub script: VecDeque<Outcome>,
        /// Every request that reached the collector, head and body
        pub requests: Vec<Vec<u8>>,
        /// Connect attempts, including failed ones
        pub connects: usize,
    }

    impl MockConnector {
        pub fn scripted(outcomes: &[Outcome]) -> Self {
            Self {
                script: outcomes.iter().copied().collect(),
                ..Default::default()
            }
        }

        /// Bodies of every recorded request.
        pub fn bodies(&self) -> Vec<&[u8]> {
            self.requests
                .iter()
                .map(|r| {
                    let split = r
                        .windows(4)
                        .position(|w| w == b"\r\n\r\n")
                        .map_or(r.len(), |p| p + 4);
                    &r[split..]
                })
                .collect()
        }
    }

    pub struct MockConnection<'a> {
        owner: &'a mut MockConnector,
        outcome: Outcome,
        request: Vec<u8>,
        response: Vec<u8>,
        read_pos: usize,
    }

    impl Connection for MockConnection<'_> {
        async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            if let Outcome::WriteFails(e) = self.outcome {
                return Err(e);
            }
            self.request.extend_from_slice(data);
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            let rest = &self.response[self.read_pos..];
            let n = rest.len().min(buf.len());
            buf[..n].copy_from_slice(&rest[..n]);
            self.read_pos += n;
            Ok(n)
        }

        async fn close(&mut self) {
            if !self.request.is_empty() {
                self.owner.requests.push(core::mem::take(&mut self.request));
            }
        }
    }

    impl Connector for MockConnector {
        type Connection<'a> = MockConnection<'a>;

        async fn connect(&mut self, _addr: ServerAddress) -> Result<MockConnection<'_>, TransportError> {
            self.connects += 1;
            let outcome = self.script.pop_front().unwrap_or(Outcome::Status(200));
            if let Outcome::ConnectFails(e) = outcome {
                return Err(e);
            }
            let response = match outcome {
                Outcome::Status(code) => format!("HTTP/1.1 {} X\r\n\r\n", code).into_bytes(),
                _ => Vec::new(),
            };
            Ok(MockConnection {
                owner: self,
                outcome,
                request: Vec::new(),
                response,
                read_pos: 0,
            })
        }
    }
}
