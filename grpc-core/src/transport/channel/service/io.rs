use hyper::rt::{Read, ReadBufCursor, Write};
use std::{
    io::IoSlice,
    pin::Pin,
    task::{Context, Poll},
};

/// A type-erased transport-layer connection, so [`Connector`](super::Connector) can return either
/// a plain TCP stream or (once wired up) a TLS stream behind one concrete type.
pub(crate) struct BoxedIo(Pin<Box<dyn IoStream>>);

trait IoStream: Read + Write + Send + 'static {}
impl<T: Read + Write + Send + 'static> IoStream for T {}

impl BoxedIo {
    pub(crate) fn new<I>(io: I) -> Self
    where
        I: Read + Write + Send + 'static,
    {
        Self(Box::pin(io))
    }
}

impl Read for BoxedIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_read(cx, buf)
    }
}

impl Write for BoxedIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.as_mut().poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        self.0.as_mut().poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.0.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_shutdown(cx)
    }
}
