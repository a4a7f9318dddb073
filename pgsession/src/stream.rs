//! Buffered message framing over [`Socket`].
use bytes::{Buf, Bytes, BytesMut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::io::AsyncWrite;

use crate::{
    Result,
    io::{poll_read, poll_write_all},
    net::Socket,
    postgres::{FrontendProtocol, ProtocolError, frontend},
};

const DEFAULT_BUF_CAPACITY: usize = 8 * 1024;

/// Largest backend frame accepted, anything bigger is treated as stream corruption.
const MAX_FRAME_LEN: usize = 1 << 30;

/// Buffered connection to postgres.
///
/// Writes are buffered until [`poll_flush`][PgStream::poll_flush], reads only consume
/// a frame once it is fully buffered, so dropping a pending read loses nothing.
#[derive(Debug)]
pub struct PgStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl PgStream {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        }
    }

    pub fn send<F: FrontendProtocol>(&mut self, msg: F) {
        frontend::write(msg, &mut self.write_buf);
    }

    pub fn send_startup(&mut self, msg: frontend::Startup) {
        msg.write(&mut self.write_buf);
    }

    /// Returns `true` if some message have not been written to the socket.
    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    pub fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        ready!(poll_write_all(&mut self.socket, &mut self.write_buf, cx))?;
        Pin::new(&mut self.socket).poll_flush(cx)
    }

    /// Poll for a complete frame, returns the message type and its body.
    pub fn poll_frame(&mut self, cx: &mut Context) -> Poll<Result<(u8, Bytes)>> {
        loop {
            if let Some(mut header) = self.read_buf.get(..5) {
                let msgtype = header.get_u8();
                let len = header.get_i32();

                if len < 4 || len as usize > MAX_FRAME_LEN {
                    return Poll::Ready(Err(ProtocolError::InvalidLength { msgtype, len }.into()));
                }

                let len = len as usize;
                if self.read_buf.len() > len {
                    self.read_buf.advance(5);
                    let body = self.read_buf.split_to(len - 4).freeze();
                    return Poll::Ready(Ok((msgtype, body)));
                }

                self.read_buf.reserve(1 + len - self.read_buf.len());
            } else {
                self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            }

            let n = ready!(poll_read(&mut self.socket, &mut self.read_buf, cx))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ).into()));
            }
        }
    }

    pub fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.socket).poll_shutdown(cx)
    }

    pub fn is_tls(&self) -> bool {
        self.socket.is_tls()
    }
}
