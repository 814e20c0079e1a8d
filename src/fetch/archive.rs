//! Gzipped request/response record bundles per fetch.
//!
//! Record markers and target-URI lines are byte-exact with the Web-Archive
//! convention (`WARC/1.0`, `WARC-Type: request|response`,
//! `WARC-Target-URI: <url>`) so external WARC readers can iterate the
//! records. One bundle per fetch: a headers-only request record followed by
//! a response record carrying status line, headers, and body.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use uuid::Uuid;

/// Record types in a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveRecordKind {
    Request,
    Response,
}

impl ArchiveRecordKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// One parsed record, as read back by [`read_archive_records`].
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub kind: ArchiveRecordKind,
    pub target_uri: String,
    pub date: String,
    pub block: Vec<u8>,
}

fn record_header(kind: ArchiveRecordKind, url: &str, date: &str, block_len: usize) -> String {
    format!(
        "WARC/1.0\r\n\
         WARC-Type: {}\r\n\
         WARC-Record-ID: <urn:uuid:{}>\r\n\
         WARC-Target-URI: {}\r\n\
         WARC-Date: {}\r\n\
         Content-Length: {}\r\n\
         \r\n",
        kind.as_str(),
        Uuid::new_v4(),
        url,
        date,
        block_len,
    )
}

fn http_header_block(first_line: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut block = String::new();
    block.push_str(first_line);
    block.push_str("\r\n");
    for (name, value) in headers {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    block.push_str("\r\n");
    block.into_bytes()
}

/// Write one gzipped archive bundle and return its path.
///
/// The bundle holds a request record (headers only) and a response record
/// (status line + headers + body).
pub fn write_archive(
    dir: &Path,
    url: &str,
    status: u16,
    request_headers: &[(String, String)],
    response_headers: &[(String, String)],
    body: &[u8],
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).context("failed to create archive directory")?;

    let date = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let path = dir.join(format!("{}.warc.gz", Uuid::new_v4()));

    let mut request_block = http_header_block(&format!("GET {url} HTTP/1.1"), request_headers);
    // the request block carries no body; terminate the record
    request_block.extend_from_slice(b"\r\n");

    let mut response_block =
        http_header_block(&format!("HTTP/1.1 {status} {}", status_text(status)), response_headers);
    response_block.extend_from_slice(body);
    response_block.extend_from_slice(b"\r\n\r\n");

    let file = std::fs::File::create(&path).context("failed to create archive file")?;
    let mut encoder = GzEncoder::new(file, Compression::default());

    encoder.write_all(record_header(ArchiveRecordKind::Request, url, &date, request_block.len()).as_bytes())?;
    encoder.write_all(&request_block)?;
    encoder.write_all(b"\r\n\r\n")?;
    encoder.write_all(record_header(ArchiveRecordKind::Response, url, &date, response_block.len()).as_bytes())?;
    encoder.write_all(&response_block)?;
    encoder.write_all(b"\r\n\r\n")?;
    encoder.finish().context("failed to finish archive gzip stream")?;

    Ok(path)
}

/// Iterate the records of a bundle written by [`write_archive`].
pub fn read_archive_records(path: &Path) -> Result<Vec<ArchiveRecord>> {
    let file = std::fs::File::open(path).context("failed to open archive file")?;
    let mut decoder = GzDecoder::new(file);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .context("failed to decompress archive")?;

    let mut records = Vec::new();
    let mut cursor = 0usize;

    while let Some(start) = find(&raw[cursor..], b"WARC/1.0\r\n").map(|i| cursor + i) {
        let header_end = match find(&raw[start..], b"\r\n\r\n") {
            Some(i) => start + i + 4,
            None => break,
        };
        let header_text = String::from_utf8_lossy(&raw[start..header_end]);

        let mut kind = None;
        let mut target_uri = String::new();
        let mut date = String::new();
        let mut content_length = 0usize;
        for line in header_text.lines() {
            if let Some(v) = line.strip_prefix("WARC-Type: ") {
                kind = match v {
                    "request" => Some(ArchiveRecordKind::Request),
                    "response" => Some(ArchiveRecordKind::Response),
                    _ => None,
                };
            } else if let Some(v) = line.strip_prefix("WARC-Target-URI: ") {
                target_uri = v.to_string();
            } else if let Some(v) = line.strip_prefix("WARC-Date: ") {
                date = v.to_string();
            } else if let Some(v) = line.strip_prefix("Content-Length: ") {
                content_length = v.trim().parse().unwrap_or(0);
            }
        }

        let block_end = (header_end + content_length).min(raw.len());
        if let Some(kind) = kind {
            records.push(ArchiveRecord {
                kind,
                target_uri,
                date,
                block: raw[header_end..block_end].to_vec(),
            });
        }
        cursor = block_end;
    }

    Ok(records)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

const fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_round_trips_with_exact_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(
            dir.path(),
            "https://example.com/article",
            200,
            &[("User-Agent".to_string(), "Mozilla/5.0".to_string())],
            &[("Content-Type".to_string(), "text/html".to_string())],
            b"<html>hello</html>",
        )
        .unwrap();

        let records = read_archive_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, ArchiveRecordKind::Request);
        assert_eq!(records[1].kind, ArchiveRecordKind::Response);
        assert_eq!(records[0].target_uri, "https://example.com/article");
        assert_eq!(records[1].target_uri, "https://example.com/article");

        let response_text = String::from_utf8_lossy(&records[1].block);
        assert!(response_text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response_text.contains("Content-Type: text/html"));
        assert!(response_text.contains("<html>hello</html>"));
    }

    #[test]
    fn raw_bytes_carry_warc_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), "https://example.com/", 200, &[], &[], b"x").unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let mut decoder = GzDecoder::new(file);
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).unwrap();

        assert!(raw.contains("WARC/1.0\r\n"));
        assert!(raw.contains("WARC-Type: request\r\n"));
        assert!(raw.contains("WARC-Type: response\r\n"));
        assert!(raw.contains("WARC-Target-URI: https://example.com/\r\n"));
    }
}
