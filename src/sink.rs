// sink.rs

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::OpError;
use crate::transport::Transport;

/// Append-only destination for drained bytes.
pub trait Sink: Send {
    /// Append `bytes`. Writes arrive in iteration order.
    fn write(&mut self, bytes: &[u8]) -> Result<(), OpError>;

    /// Push buffered bytes to their destination.
    fn flush(&mut self) -> Result<(), OpError> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), OpError> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> Result<(), OpError> {
        (**self).flush()
    }
}

/// Sink over any [`std::io::Write`], e.g. stdout or a file.
#[derive(Debug)]
pub struct WriterSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), OpError> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OpError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink. Clones share the same storage, so a test can keep one
/// handle while the pipeline writes through another.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    pub fn clear(&self) {
        self.data.lock().clear();
    }
}

impl Sink for MemorySink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), OpError> {
        self.data.lock().extend_from_slice(bytes);
        Ok(())
    }
}

/// Default datagram-sized chunk for [`TransportSink`].
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Forwards drained bytes to an async [`Transport`].
///
/// The drain stage runs on a plain OS thread, so each send is driven to
/// completion with [`tokio::runtime::Handle::block_on`]. The handle must
/// belong to a runtime that outlives the pipeline run.
pub struct TransportSink<T: Transport> {
    transport: T,
    handle: tokio::runtime::Handle,
    chunk_size: usize,
}

impl<T: Transport> TransportSink<T> {
    pub fn new(transport: T, handle: tokio::runtime::Handle) -> Self {
        Self {
            transport,
            handle,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: Transport> Sink for TransportSink<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), OpError> {
        for chunk in bytes.chunks(self.chunk_size) {
            self.handle.block_on(self.transport.send(chunk))?;
        }
        Ok(())
    }
}
