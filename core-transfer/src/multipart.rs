//! # Multipart Codec
//!
//! Streaming `multipart/related` framing for DICOMweb.
//!
//! ## Encoding
//!
//! One part per upload:
//!
//! ```text
//! --{boundary}\r\n
//! Content-Type: application/dicom\r\n
//! Content-Disposition: form-data; name="stowrs"; filename="{name}"\r\n   (optional)
//! \r\n
//! {payload}\r\n
//! --{boundary}--
//! ```
//!
//! The payload is streamed from an `AsyncRead`; it is never held in memory.
//!
//! ## Decoding
//!
//! [`MultipartReader`] walks a response body part by part. Header lines are
//! read up to the blank line, then the body is copied to any `AsyncWrite`
//! until the next delimiter. Bare `\n` line endings are accepted. A stream
//! that ends before the closing delimiter is a [`TransferError::Protocol`].

use crate::error::{Result, TransferError};
use bridge_traits::http::BodyStream;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;

/// MIME type of each DICOM part.
pub const DICOM_PART_TYPE: &str = "application/dicom";

const READ_CHUNK: usize = 64 * 1024;
const MAX_HEADER_LINE: usize = 8 * 1024;
const MAX_HEADERS_PER_PART: usize = 64;

/// Builds the request body for one STOW-RS upload.
#[derive(Debug, Clone)]
pub struct MultipartEncoder {
    boundary: String,
}

impl Default for MultipartEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartEncoder {
    /// Encoder with a fresh random boundary.
    pub fn new() -> Self {
        Self {
            boundary: format!("DICOMwebBoundary{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!(
            "multipart/related; type=\"{}\"; boundary={}",
            DICOM_PART_TYPE, self.boundary
        )
    }

    /// Everything before the payload.
    pub fn head(&self, filename: Option<&str>) -> Bytes {
        let mut head = format!(
            "--{}\r\nContent-Type: {}\r\n",
            self.boundary, DICOM_PART_TYPE
        );
        if let Some(name) = filename {
            head.push_str(&format!(
                "Content-Disposition: form-data; name=\"stowrs\"; filename=\"{}\"\r\n",
                escape_quoted(name)
            ));
        }
        head.push_str("\r\n");
        Bytes::from(head)
    }

    /// Everything after the payload.
    pub fn tail(&self) -> Bytes {
        Bytes::from(format!("\r\n--{}--", self.boundary))
    }

    /// Framed body that pulls the payload from `reader` as it is sent.
    pub fn encode_reader<R>(&self, reader: R, filename: Option<&str>) -> BodyStream
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let head = stream::iter(std::iter::once(Ok(self.head(filename))));
        let tail = stream::iter(std::iter::once(Ok(self.tail())));
        let payload = ReaderStream::with_capacity(reader, READ_CHUNK);

        Box::pin(head.chain(payload).chain(tail))
    }

    /// Framed body for an in-memory payload.
    pub fn encode_bytes(&self, payload: &[u8], filename: Option<&str>) -> Bytes {
        let head = self.head(filename);
        let tail = self.tail();
        let mut out = BytesMut::with_capacity(head.len() + payload.len() + tail.len());
        out.extend_from_slice(&head);
        out.extend_from_slice(payload);
        out.extend_from_slice(&tail);
        out.freeze()
    }
}

fn escape_quoted(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' { '\'' } else { c })
        .collect()
}

/// Header block of one part, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    entries: Vec<(String, String)>,
}

impl PartHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    /// `filename` parameter of the part's Content-Disposition, if any.
    pub fn filename(&self) -> Option<String> {
        self.get("Content-Disposition")
            .and_then(filename_from_content_disposition)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One fully buffered part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub headers: PartHeaders,
    pub body: Bytes,
}

/// A fully buffered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartMessage {
    pub boundary: String,
    pub parts: Vec<MultipartPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Preamble,
    Headers,
    Body,
    Finished,
}

/// Incremental multipart decoder.
///
/// ```ignore
/// let mut parts = MultipartReader::new(response.body, Some(boundary));
/// while let Some(headers) = parts.next_part().await? {
///     let mut file = tokio::fs::File::create(path).await?;
///     parts.copy_body(&mut file).await?;
/// }
/// ```
pub struct MultipartReader<R> {
    reader: R,
    buf: BytesMut,
    boundary: Option<String>,
    state: ReaderState,
    eof: bool,
}

impl<R: AsyncRead + Unpin> MultipartReader<R> {
    /// With `boundary` unset, the first `--` line of the stream defines it.
    pub fn new(reader: R, boundary: Option<String>) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            boundary: boundary.filter(|b| !b.is_empty()),
            state: ReaderState::Preamble,
            eof: false,
        }
    }

    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    /// Advance to the next part and return its headers.
    ///
    /// An unread body of the current part is skipped. Returns `None` after
    /// the closing delimiter.
    pub async fn next_part(&mut self) -> Result<Option<PartHeaders>> {
        loop {
            match self.state {
                ReaderState::Preamble => {
                    if !self.skip_preamble().await? {
                        return Ok(None);
                    }
                }
                ReaderState::Headers => {
                    let headers = self.read_headers().await?;
                    self.state = ReaderState::Body;
                    return Ok(Some(headers));
                }
                ReaderState::Body => {
                    self.copy_body(&mut tokio::io::sink()).await?;
                }
                ReaderState::Finished => return Ok(None),
            }
        }
    }

    /// Copy the current part's body into `writer`. Returns the byte count.
    pub async fn copy_body<W>(&mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        if self.state != ReaderState::Body {
            return Err(TransferError::Protocol(
                "no part body is pending".to_string(),
            ));
        }

        let delimiter = format!("\n--{}", self.boundary.as_deref().unwrap_or_default()).into_bytes();
        let mut written = 0u64;
        let mut search_from = 0;

        loop {
            if let Some(pos) = find(&self.buf[search_from..], &delimiter).map(|p| p + search_from) {
                let after = pos + delimiter.len();

                // Need two bytes past the boundary to tell a delimiter from a
                // longer token that merely starts with it.
                while self.buf.len() < after + 2 && !self.eof {
                    self.fill().await?;
                }
                if self.buf.len() < after + 2 {
                    return Err(TransferError::Protocol(
                        "stream ended inside a boundary line".to_string(),
                    ));
                }

                let closing = &self.buf[after..after + 2] == b"--";
                let is_delimiter = closing || matches!(self.buf[after], b'\r' | b'\n' | b' ' | b'\t');

                if !is_delimiter {
                    search_from = pos + 1;
                    continue;
                }

                let body_end = if pos > 0 && self.buf[pos - 1] == b'\r' {
                    pos - 1
                } else {
                    pos
                };
                writer.write_all(&self.buf[..body_end]).await?;
                written += body_end as u64;
                self.buf.advance(after);

                if closing {
                    self.buf.clear();
                    self.state = ReaderState::Finished;
                } else {
                    // Rest of the boundary line is padding.
                    self.read_line()
                        .await?
                        .ok_or_else(|| TransferError::Protocol("stream ended after boundary".to_string()))?;
                    self.state = ReaderState::Headers;
                }

                writer.flush().await?;
                return Ok(written);
            }

            if self.eof {
                return Err(TransferError::Protocol(
                    "stream ended before the closing boundary".to_string(),
                ));
            }

            // Keep enough to match a delimiter split across reads, plus a
            // preceding '\r'.
            let keep = delimiter.len() + 1;
            if self.buf.len() > keep {
                let flush = self.buf.len() - keep;
                writer.write_all(&self.buf[..flush]).await?;
                written += flush as u64;
                self.buf.advance(flush);
            }
            search_from = 0;

            self.fill().await?;
        }
    }

    /// Returns `false` on a closing delimiter that precedes every part.
    async fn skip_preamble(&mut self) -> Result<bool> {
        loop {
            let Some(line) = self.read_line().await? else {
                return Err(TransferError::Protocol(
                    "no multipart boundary found".to_string(),
                ));
            };
            let line = line.trim_end();

            let Some(marker) = line.strip_prefix("--") else {
                continue;
            };

            match &self.boundary {
                Some(boundary) => {
                    if marker == boundary {
                        self.state = ReaderState::Headers;
                        return Ok(true);
                    }
                    if marker.strip_suffix("--") == Some(boundary.as_str()) {
                        self.state = ReaderState::Finished;
                        return Ok(false);
                    }
                }
                None if !marker.is_empty() => {
                    self.boundary = Some(marker.to_string());
                    self.state = ReaderState::Headers;
                    return Ok(true);
                }
                None => {}
            }
        }
    }

    async fn read_headers(&mut self) -> Result<PartHeaders> {
        let mut headers = PartHeaders::default();

        loop {
            let line = self.read_line().await?.ok_or_else(|| {
                TransferError::Protocol("stream ended inside part headers".to_string())
            })?;
            let line = line.trim_end();

            if line.is_empty() {
                return Ok(headers);
            }

            if headers.entries.len() >= MAX_HEADERS_PER_PART {
                return Err(TransferError::Protocol("too many part headers".to_string()));
            }

            if let Some((name, value)) = line.split_once(':') {
                headers
                    .entries
                    .push((name.trim().to_string(), value.trim().to_string()));
            }
        }
    }

    /// Next line without its terminator. `None` at end of stream.
    async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let mut text = String::from_utf8_lossy(&line[..pos]).into_owned();
                if text.ends_with('\r') {
                    text.pop();
                }
                return Ok(Some(text));
            }

            if self.buf.len() > MAX_HEADER_LINE {
                return Err(TransferError::Protocol("header line too long".to_string()));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let rest = self.buf.split();
                return Ok(Some(String::from_utf8_lossy(&rest).trim_end().to_string()));
            }

            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        self.buf.reserve(READ_CHUNK);
        let read = self.reader.read_buf(&mut self.buf).await?;
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }
}

/// Buffer a whole message. Only for small bodies.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: R,
    boundary: Option<String>,
) -> Result<MultipartMessage> {
    let mut parts_reader = MultipartReader::new(reader, boundary);
    let mut parts = Vec::new();

    while let Some(headers) = parts_reader.next_part().await? {
        let mut body = Vec::new();
        parts_reader.copy_body(&mut body).await?;
        parts.push(MultipartPart {
            headers,
            body: Bytes::from(body),
        });
    }

    Ok(MultipartMessage {
        boundary: parts_reader.boundary.unwrap_or_default(),
        parts,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// `boundary` parameter of a `multipart/*` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
}

/// `filename` parameter of a Content-Disposition value.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("filename"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

/// Last non-empty path segment of a URL, ignoring query and fragment.
pub fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_string)
}

/// Make a remote-supplied name safe to use as a single path component.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        "object".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn collect(body: BodyStream) -> Vec<u8> {
        body.try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_encode_exact_framing() {
        let encoder = MultipartEncoder::with_boundary("b0undary");
        let body = collect(encoder.encode_reader(&b"DICM"[..], None)).await;

        assert_eq!(
            body,
            b"--b0undary\r\nContent-Type: application/dicom\r\n\r\nDICM\r\n--b0undary--".to_vec()
        );
        assert_eq!(
            encoder.content_type(),
            "multipart/related; type=\"application/dicom\"; boundary=b0undary"
        );
    }

    #[tokio::test]
    async fn test_encode_with_content_disposition() {
        let encoder = MultipartEncoder::with_boundary("b");
        let body = encoder.encode_bytes(b"x", Some("CT0001.dcm"));

        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(
            "Content-Disposition: form-data; name=\"stowrs\"; filename=\"CT0001.dcm\"\r\n\r\nx"
        ));
    }

    #[tokio::test]
    async fn test_single_byte_payload_round_trip() {
        let encoder = MultipartEncoder::new();
        let body = collect(encoder.encode_reader(&b"\x00"[..], Some("one.dcm"))).await;

        let message = read_message(&body[..], Some(encoder.boundary().to_string()))
            .await
            .unwrap();

        assert_eq!(message.parts.len(), 1);
        assert_eq!(&message.parts[0].body[..], b"\x00");
        assert_eq!(message.parts[0].headers.filename().as_deref(), Some("one.dcm"));
        assert_eq!(
            message.parts[0].headers.content_type(),
            Some("application/dicom")
        );
    }

    #[test]
    fn test_random_boundaries_differ() {
        assert_ne!(
            MultipartEncoder::new().boundary(),
            MultipartEncoder::new().boundary()
        );
    }

    #[tokio::test]
    async fn test_decode_single_part() {
        let raw = b"--abc\r\nContent-Type: application/dicom\r\nContent-Disposition: attachment; filename=\"img.dcm\"\r\n\r\nPAYLOAD\r\n--abc--\r\n";
        let message = read_message(&raw[..], Some("abc".to_string())).await.unwrap();

        assert_eq!(message.parts.len(), 1);
        let part = &message.parts[0];
        assert_eq!(part.headers.content_type(), Some("application/dicom"));
        assert_eq!(part.headers.filename().as_deref(), Some("img.dcm"));
        assert_eq!(&part.body[..], b"PAYLOAD");
    }

    #[tokio::test]
    async fn test_decode_multiple_parts_with_preamble() {
        let raw = b"preamble text\r\n--abc\r\nContent-Type: application/dicom\r\n\r\nONE\r\n--abc\r\nContent-Type: application/dicom\r\n\r\nTWO\r\n--abc--";
        let message = read_message(&raw[..], Some("abc".to_string())).await.unwrap();

        let bodies: Vec<&[u8]> = message.parts.iter().map(|p| &p.body[..]).collect();
        assert_eq!(bodies, vec![&b"ONE"[..], &b"TWO"[..]]);
    }

    #[tokio::test]
    async fn test_decode_infers_boundary_and_accepts_lf() {
        let raw = b"--xyz\nContent-Type: application/dicom\n\nLF body\n--xyz--\n";
        let message = read_message(&raw[..], None).await.unwrap();

        assert_eq!(message.boundary, "xyz");
        assert_eq!(&message.parts[0].body[..], b"LF body");
    }

    #[tokio::test]
    async fn test_body_containing_boundary_prefix() {
        let raw = b"--abc\r\n\r\nline\r\n--abcdef not a delimiter\r\n--abc--";
        let message = read_message(&raw[..], Some("abc".to_string())).await.unwrap();

        assert_eq!(
            &message.parts[0].body[..],
            b"line\r\n--abcdef not a delimiter"
        );
    }

    #[tokio::test]
    async fn test_premature_end_is_protocol_error() {
        let raw = b"--abc\r\nContent-Type: application/dicom\r\n\r\ntruncated payload";
        let result = read_message(&raw[..], Some("abc".to_string())).await;

        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_end_inside_headers_is_protocol_error() {
        let raw = b"--abc\r\nContent-Type: application/dicom\r\n";
        let result = read_message(&raw[..], Some("abc".to_string())).await;

        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_missing_boundary_is_protocol_error() {
        let result = read_message(&b"just some bytes"[..], Some("abc".to_string())).await;
        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_skips_unread_body() {
        let raw = b"--abc\r\nX-Id: 1\r\n\r\nskipped\r\n--abc\r\nX-Id: 2\r\n\r\nkept\r\n--abc--";
        let mut reader = MultipartReader::new(&raw[..], Some("abc".to_string()));

        let first = reader.next_part().await.unwrap().unwrap();
        assert_eq!(first.get("x-id"), Some("1"));

        let second = reader.next_part().await.unwrap().unwrap();
        assert_eq!(second.get("X-ID"), Some("2"));

        let mut body = Vec::new();
        reader.copy_body(&mut body).await.unwrap();
        assert_eq!(body, b"kept");
        assert!(reader.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delimiter_split_across_reads() {
        // A one-byte-at-a-time reader forces every split position.
        let raw = b"--abc\r\n\r\n0123456789\r\n--abc--".to_vec();
        let (client, mut server) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            server.write_all(&raw).await.unwrap();
        });

        let message = read_message(client, Some("abc".to_string())).await.unwrap();
        writer.await.unwrap();

        assert_eq!(&message.parts[0].body[..], b"0123456789");
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type(
                "multipart/related; type=\"application/dicom\"; boundary=\"quoted\""
            )
            .as_deref(),
            Some("quoted")
        );
        assert_eq!(
            boundary_from_content_type("multipart/related; Boundary=plain").as_deref(),
            Some("plain")
        );
        assert_eq!(boundary_from_content_type("application/dicom"), None);
    }

    #[test]
    fn test_filename_helpers() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename=\"a b.dcm\"").as_deref(),
            Some("a b.dcm")
        );
        assert_eq!(filename_from_content_disposition("inline"), None);

        assert_eq!(
            filename_from_url("https://h/v1/x/dicomWeb/studies/1.2.3?x=1").as_deref(),
            Some("1.2.3")
        );
        assert_eq!(filename_from_url("https://h/studies/1.2/").as_deref(), Some("1.2"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("ok.dcm"), "ok.dcm");
        assert_eq!(sanitize_filename(""), "object");
        assert_eq!(sanitize_filename("..."), "object");
    }
}
