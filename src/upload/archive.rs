//! Streaming archive container for upload bodies.
//!
//! The modified DICOM object is serialized on a blocking thread into a bounded
//! channel while the calling task compresses the chunks into a single-member gzip
//! stream and writes it to the outbound body. No temporary file is involved.

use std::io::{self, BufWriter, Write};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use snafu::prelude::*;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::dataset::ImagingFile;
use crate::repository::{
    GeneratedInput, InputError, ServiceInput, WriteInputSnafu, ARCHIVE_MIME_TYPE,
};

/// Size of the chunks handed from the serializer to the compressor.
pub const CHUNK_SIZE: usize = 64 * 1024;
/// Number of chunks the channel buffers before the serializer blocks.
pub const CHANNEL_DEPTH: usize = 4;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Serializer = Box<dyn FnOnce(&mut dyn Write) -> Result<(), BoxError> + Send>;

/// Blocking writer end of the chunk channel.
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer hung up"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Single-entry gzip archive generated from a serializer.
pub struct ArchiveInput {
    entry_name: String,
    level: u32,
    serializer: Serializer,
}

impl ArchiveInput {
    pub fn new<F>(entry_name: impl Into<String>, level: u32, serializer: F) -> Self
    where
        F: FnOnce(&mut dyn Write) -> Result<(), BoxError> + Send + 'static,
    {
        ArchiveInput {
            entry_name: entry_name.into(),
            level: level.min(9),
            serializer: Box::new(serializer),
        }
    }

    /// Archive holding the complete serialized file, named after the local file.
    pub fn for_file(file: ImagingFile, level: u32) -> Self {
        let name = file.file_name();
        ArchiveInput::new(name, level, move |out: &mut dyn Write| {
            file.write_to(out).map_err(BoxError::from)
        })
    }

    pub fn into_service_input(self) -> ServiceInput {
        ServiceInput {
            mime_type: ARCHIVE_MIME_TYPE.to_string(),
            name: self.entry_name.clone(),
            source: Box::new(self),
        }
    }
}

async fn drain<W>(encoder: &mut GzEncoder<Vec<u8>>, out: &mut W) -> Result<(), InputError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let pending = std::mem::take(encoder.get_mut());
    if !pending.is_empty() {
        out.write_all(&pending).await.context(WriteInputSnafu)?;
    }
    Ok(())
}

#[async_trait]
impl GeneratedInput for ArchiveInput {
    async fn copy_to(
        self: Box<Self>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), InputError> {
        let ArchiveInput {
            entry_name,
            level,
            serializer,
        } = *self;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let producer = tokio::task::spawn_blocking(move || -> Result<(), BoxError> {
            let mut writer = BufWriter::with_capacity(CHUNK_SIZE, ChannelWriter { tx });
            serializer(&mut writer)?;
            writer.flush()?;
            Ok(())
        });

        let mut encoder = GzBuilder::new()
            .filename(entry_name.as_bytes())
            .write(Vec::new(), Compression::new(level));
        let mut streamed = 0usize;
        let consumed: Result<(), InputError> = async {
            while let Some(chunk) = rx.recv().await {
                streamed += chunk.len();
                encoder.write_all(&chunk).context(WriteInputSnafu)?;
                drain(&mut encoder, out).await?;
            }
            Ok(())
        }
        .await;
        // unblocks a producer still sending
        drop(rx);

        let joined = producer.await;
        consumed?;
        match joined {
            Err(e) => return Err(InputError::ProducerPanicked { source: e }),
            Ok(Err(e)) => return Err(InputError::ProducerFailed { source: e }),
            Ok(Ok(())) => {}
        }

        encoder.try_finish().context(WriteInputSnafu)?;
        drain(&mut encoder, out).await?;
        out.flush().await.context(WriteInputSnafu)?;
        debug!("Streamed {} bytes of {} into archive", streamed, entry_name);
        Ok(())
    }
}
