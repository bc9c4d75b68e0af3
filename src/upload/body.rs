//! Multipart bodies for the software image.
//!
//! Streamed and chunked bodies own the file handle and never hold more than
//! one buffer of the image in memory.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, TryStreamExt, stream};
use reqwest::Body;
use reqwest::multipart::{Form, Part};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use super::progress::TransferProgress;
use super::{CHUNK_SIZE, STREAM_BUFFER, TransferStrategy};
use crate::api::SoftwareImage;

pub const FORM_FIELD: &str = "Filedata";
const OCTET_STREAM: &str = "application/octet-stream";

/// Build the multipart form for one transfer attempt.
///
/// Buffered bodies do not report progress; the caller records the whole
/// image once the controller has accepted it.
pub async fn software_form(
    image: &SoftwareImage,
    strategy: TransferStrategy,
    progress: Arc<TransferProgress>,
) -> std::io::Result<Form> {
    let part = match strategy {
        TransferStrategy::Buffered => Part::bytes(tokio::fs::read(&image.path).await?),
        TransferStrategy::Streamed => {
            let file = File::open(&image.path).await?;
            Part::stream_with_length(Body::wrap_stream(streamed(file, progress)), image.size)
        }
        TransferStrategy::Chunked => {
            let file = File::open(&image.path).await?;
            Part::stream_with_length(Body::wrap_stream(chunked(file, progress)), image.size)
        }
    };

    let part = part
        .file_name(image.file_name())
        .mime_str(OCTET_STREAM)
        .map_err(std::io::Error::other)?;
    Ok(Form::new().part(FORM_FIELD, part))
}

/// File contents as a stream of `STREAM_BUFFER`-sized reads.
pub fn streamed(
    file: File,
    progress: Arc<TransferProgress>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static {
    ReaderStream::with_capacity(file, STREAM_BUFFER).inspect_ok(move |chunk| {
        progress.record(chunk.len() as u64);
    })
}

/// File contents as fixed `CHUNK_SIZE` pieces (the last one may be shorter).
pub fn chunked(
    file: File,
    progress: Arc<TransferProgress>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static {
    stream::try_unfold((file, progress), |(mut file, progress)| async move {
        let chunk = fill_chunk(&mut file, CHUNK_SIZE).await?;
        if chunk.is_empty() {
            return Ok(None);
        }
        progress.record(chunk.len() as u64);
        Ok(Some((Bytes::from(chunk), (file, progress))))
    })
}

/// Read until `size` bytes are buffered or EOF is reached.
async fn fill_chunk(file: &mut File, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
