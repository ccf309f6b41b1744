use flate2::{write::GzEncoder, Compression};
use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to drain archive source: {0}")]
    Source(#[source] io::Error),
    #[error("failed to write archive: {0}")]
    Sink(#[source] io::Error),
}

/// Transparent tee: everything read through the pipe is also gzip compressed into the sink
///
/// This lets a reader scan a log once while it is being archived, after `finish` the
/// uncompressed original can be removed.
pub struct ArchivingPipe<R: Read, W: Write> {
    source: R,
    sink: GzEncoder<W>,
}

impl<R: Read, W: Write> ArchivingPipe<R, W> {
    pub fn new(source: R, sink: W) -> Self {
        Self {
            source,
            sink: GzEncoder::new(sink, Compression::default()),
        }
    }

    /// copy whatever was not read yet into the sink, then close the gzip stream
    ///
    /// Returns the inner sink so the caller can sync it, the source is dropped.
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let read = match self.source.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(ArchiveError::Source(error)),
            };

            self.sink
                .write_all(&buffer[..read])
                .map_err(ArchiveError::Sink)?;
        }

        let mut inner = self.sink.finish().map_err(ArchiveError::Sink)?;
        inner.flush().map_err(ArchiveError::Sink)?;

        Ok(inner)
    }
}

impl<R: Read, W: Write> Read for ArchivingPipe<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.source.read(buf)?;

        if read > 0 {
            if let Err(error) = self.sink.write_all(&buf[..read]) {
                return Err(io::Error::new(
                    error.kind(),
                    format!("archive copy dest, {error}"),
                ));
            }
        }

        Ok(read)
    }
}
