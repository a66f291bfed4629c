//! HTTP/1.1 chunked transfer coding
//!
use crate::errors::{new_io_error, Peer, Result};
use crate::CR_LF;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames bytes written to `W` as chunks.
///
/// Every non-empty [`ChunkedWriter::write`] becomes one `<hex-len>\r\n<data>\r\n`
/// chunk. Only [`ChunkedWriter::close`] emits the `0\r\n` terminator; the blank
/// line ending the trailer section is left to the caller.
#[derive(Debug)]
pub struct ChunkedWriter<W> {
  inner: W,
  closed: bool,
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
  /// Wrap an output stream.
  pub fn new(inner: W) -> Self {
    ChunkedWriter {
      inner,
      closed: false,
    }
  }

  /// Write `data` as a single chunk. Empty input writes nothing.
  pub async fn write(&mut self, data: &[u8]) -> Result<()> {
    if self.closed {
      return Err(new_io_error(
        std::io::ErrorKind::BrokenPipe,
        "write after chunked body was closed",
      ));
    }
    if data.is_empty() {
      return Ok(());
    }
    let mut frame = Vec::with_capacity(data.len() + 12);
    frame.extend(format!("{:x}", data.len()).as_bytes());
    frame.extend(CR_LF);
    frame.extend(data);
    frame.extend(CR_LF);
    self.inner.write_all(&frame).await?;
    Ok(())
  }

  /// Emit the terminating zero-length chunk.
  pub async fn close(&mut self) -> Result<()> {
    if !self.closed {
      self.inner.write_all(b"0\r\n").await?;
      self.closed = true;
    }
    Ok(())
  }

  /// Give back the wrapped stream.
  pub fn into_inner(self) -> W {
    self.inner
  }
}

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: u64 = 8 * 1024;

/// Read a chunked body up to and including its trailer section.
///
/// Chunk extensions and trailer fields are discarded. The decoded body may not
/// exceed `max_body_size` bytes.
pub(crate) async fn read_chunked<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  max_body_size: usize,
  peer: Peer,
) -> Result<Vec<u8>> {
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    read_line(reader, &mut line, peer).await?;
    if line.is_empty() {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "chunked body ended before the last chunk",
      ));
    }
    let size = chunk_size(&line, peer)?;
    if size == 0 {
      break;
    }
    body
      .len()
      .checked_add(size)
      .filter(|total| *total <= max_body_size)
      .ok_or_else(|| peer.invalid(format!("chunked body exceeds the {} byte limit", max_body_size)))?;
    let read = (&mut *reader).take(size as u64).read_to_end(&mut body).await?;
    if read < size {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside a chunk",
      ));
    }
    read_line(reader, &mut line, peer).await?;
    if line != CR_LF && line != b"\n" {
      return Err(peer.invalid("missing CRLF after chunk data"));
    }
  }
  // trailers
  loop {
    read_line(reader, &mut line, peer).await?;
    if line.is_empty() || line == CR_LF || line == b"\n" {
      break;
    }
  }
  Ok(body)
}

/// Read one line into `line`, which is left empty at end of stream.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, line: &mut Vec<u8>, peer: Peer) -> Result<()> {
  line.clear();
  (&mut *reader).take(MAX_LINE).read_until(b'\n', line).await?;
  if line.len() as u64 == MAX_LINE && !line.ends_with(b"\n") {
    return Err(peer.invalid("chunk line too long"));
  }
  Ok(())
}

fn chunk_size(line: &[u8], peer: Peer) -> Result<usize> {
  let text = std::str::from_utf8(line).map_err(|_| peer.invalid("chunk size is not ascii"))?;
  let hex = text.split(';').next().unwrap_or_default().trim();
  usize::from_str_radix(hex, 16).map_err(|e| peer.invalid(format!("invalid chunk size {:?}: {}", hex, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::Error;
  use tokio::io::BufReader;

  const LIMIT: usize = 1024;

  #[tokio::test]
  async fn test_write_frames_and_terminator() {
    let mut writer = ChunkedWriter::new(Vec::new());
    writer.write(b"hello").await.unwrap();
    writer.write(b"").await.unwrap();
    writer.write(&[b'x'; 26]).await.unwrap();
    writer.close().await.unwrap();
    let out = writer.into_inner();
    let mut expected = b"5\r\nhello\r\n1a\r\n".to_vec();
    expected.extend([b'x'; 26]);
    expected.extend(b"\r\n0\r\n");
    assert_eq!(out, expected);
  }

  #[tokio::test]
  async fn test_empty_body_is_only_terminator() {
    let mut writer = ChunkedWriter::new(Vec::new());
    writer.write(b"").await.unwrap();
    writer.close().await.unwrap();
    writer.close().await.unwrap();
    assert!(writer.write(b"late").await.is_err());
    assert_eq!(writer.into_inner(), b"0\r\n");
  }

  #[tokio::test]
  async fn test_read_chunked_with_extensions_and_trailers() {
    let raw: &[u8] = b"4;name=v\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\nNEXT";
    let mut reader = BufReader::new(raw);
    let body = read_chunked(&mut reader, LIMIT, Peer::Origin).await.unwrap();
    assert_eq!(body, b"Wikipedia");
    let mut rest = String::new();
    reader.read_to_string(&mut rest).await.unwrap();
    assert_eq!(rest, "NEXT");
  }

  #[tokio::test]
  async fn test_read_chunked_rejects_truncated_and_garbage() {
    let mut truncated = BufReader::new(&b"a\r\nshort"[..]);
    assert!(read_chunked(&mut truncated, LIMIT, Peer::Origin).await.is_err());
    let mut garbage = BufReader::new(&b"zz\r\n"[..]);
    assert!(read_chunked(&mut garbage, LIMIT, Peer::Origin).await.is_err());
    let mut eof = BufReader::new(&b""[..]);
    assert!(read_chunked(&mut eof, LIMIT, Peer::Origin).await.unwrap_err().is_eof());
  }

  #[tokio::test]
  async fn test_writer_output_reads_back() {
    let mut writer = ChunkedWriter::new(Vec::new());
    for part in ["<html>", "", "<body>x</body>", "</html>"] {
      writer.write(part.as_bytes()).await.unwrap();
    }
    writer.close().await.unwrap();
    let mut framed = writer.into_inner();
    framed.extend(CR_LF);
    let body = read_chunked(&mut BufReader::new(&framed[..]), LIMIT, Peer::Origin).await.unwrap();
    assert_eq!(body, b"<html><body>x</body></html>");
  }

  #[tokio::test]
  async fn test_read_chunked_enforces_body_limit() {
    let mut huge = BufReader::new(&b"ffffffffffffffff\r\nabc\r\n0\r\n\r\n"[..]);
    let err = read_chunked(&mut huge, LIMIT, Peer::Client).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    // the running total counts every chunk
    let mut many = BufReader::new(&b"3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n"[..]);
    let err = read_chunked(&mut many, 5, Peer::Origin).await.unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));

    let mut exact = BufReader::new(&b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"[..]);
    assert_eq!(read_chunked(&mut exact, 5, Peer::Origin).await.unwrap(), b"abcde");
  }

  #[tokio::test]
  async fn test_read_chunked_rejects_endless_size_line() {
    let line = vec![b'1'; 2 * MAX_LINE as usize];
    let mut reader = BufReader::new(&line[..]);
    assert!(read_chunked(&mut reader, LIMIT, Peer::Origin).await.is_err());
  }
}
