//! Plain-text exchange at the start of the reliable stream.
//!
//! To port scanners and middleboxes the connection looks like an HTTP
//! request answered with `418 I'm a teapot`. The only payload is the
//! connection token in a header line.

use crate::error::{TransportError, TransportResult};
use std::io::{self, BufRead, Read, Write};

pub const TOKEN_MARKER: &str = "Relay-Connection-Token: ";

const TEAPOT_STATUS: &str = "HTTP/1.1 418 I'm a teapot";
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Read header lines up to the blank line. Returns the status/request line
/// and the token, `0` when no token header was present.
fn read_head<R: BufRead + ?Sized>(input: &mut R) -> TransportResult<(String, u32)> {
    let mut first: Option<String> = None;
    let mut token = 0u32;
    let mut total = 0usize;
    let mut line = String::new();

    loop {
        line.clear();
        // one byte past the budget, so an unterminated line still trips the cap
        let budget = (MAX_HEADER_BYTES - total + 1) as u64;
        let n = (&mut *input).take(budget).read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        total += n;
        if total > MAX_HEADER_BYTES {
            return Err(TransportError::Handshake(format!(
                "header exceeds {MAX_HEADER_BYTES} bytes"
            )));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            break;
        }
        if first.is_none() {
            first = Some(trimmed.to_string());
            continue;
        }
        if let Some(value) = trimmed.strip_prefix(TOKEN_MARKER) {
            token = value
                .trim()
                .parse()
                .map_err(|_| TransportError::Handshake(format!("bad token {:?}", value.trim())))?;
        }
    }

    Ok((first.unwrap_or_default(), token))
}

/// Server side: consume the peer's request head, returning its token (0 if
/// it carried none).
pub fn read_request<R: BufRead + ?Sized>(input: &mut R) -> TransportResult<u32> {
    read_head(input).map(|(_, token)| token)
}

/// Client side: consume the teapot response and return the assigned token.
pub fn read_response<R: BufRead + ?Sized>(input: &mut R) -> TransportResult<u32> {
    let (status, token) = read_head(input)?;
    if !status.starts_with("HTTP/1.1 418") {
        return Err(TransportError::Handshake(format!("unexpected status {status:?}")));
    }
    if token == 0 {
        return Err(TransportError::Handshake("response carries no token".into()));
    }
    Ok(token)
}

pub fn write_request<W: Write + ?Sized>(out: &mut W, token: u32) -> io::Result<()> {
    write!(
        out,
        "GET /relay HTTP/1.1\r\n\
         Connection: keep-alive\r\n\
         {TOKEN_MARKER}{token}\r\n\
         \r\n"
    )?;
    out.flush()
}

pub fn write_response<W: Write + ?Sized>(out: &mut W, token: u32) -> io::Result<()> {
    write!(
        out,
        "{TEAPOT_STATUS}\r\n\
         Connection: keep-alive\r\n\
         Content-Length: 0\r\n\
         {TOKEN_MARKER}{token}\r\n\
         \r\n"
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Read};

    #[test]
    fn teapot_exchange() {
        let mut wire = Vec::new();
        write_response(&mut wire, 48_151).unwrap();
        wire.extend_from_slice(b"tail");

        let mut reader = BufReader::new(wire.as_slice());
        assert_eq!(read_response(&mut reader).unwrap(), 48_151);

        // bytes after the blank line stay in the stream
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "tail");
    }

    #[test]
    fn request_without_token_reads_zero() {
        let wire = b"GET / HTTP/1.1\r\nHost: example\r\n\r\n";
        assert_eq!(read_request(&mut wire.as_slice()).unwrap(), 0);

        let mut wire = Vec::new();
        write_request(&mut wire, 7).unwrap();
        assert_eq!(read_request(&mut wire.as_slice()).unwrap(), 7);
    }

    #[test]
    fn malformed_heads() {
        let bad_token = format!("HTTP/1.1 418 I'm a teapot\r\n{TOKEN_MARKER}abc\r\n\r\n");
        assert!(matches!(
            read_response(&mut bad_token.as_bytes()),
            Err(TransportError::Handshake(_))
        ));

        let wrong_status = format!("HTTP/1.1 200 OK\r\n{TOKEN_MARKER}5\r\n\r\n");
        assert!(matches!(
            read_response(&mut wrong_status.as_bytes()),
            Err(TransportError::Handshake(_))
        ));

        let truncated = b"HTTP/1.1 418 I'm a teapot\r\n";
        let err = read_response(&mut truncated.as_slice()).unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn oversized_head_is_cut_off() {
        let endless = io::repeat(b'A').take(32 * 1024 * 1024);
        let mut reader = BufReader::new(endless);
        assert!(matches!(
            read_request(&mut reader),
            Err(TransportError::Handshake(_))
        ));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(rest.len() as u64 >= 32 * 1024 * 1024 - 2 * MAX_HEADER_BYTES as u64);

        let mut many = String::from("GET / HTTP/1.1\r\n");
        while many.len() <= MAX_HEADER_BYTES {
            many.push_str("X-Filler: 0123456789abcdef\r\n");
        }
        many.push_str("\r\n");
        assert!(matches!(
            read_request(&mut many.as_bytes()),
            Err(TransportError::Handshake(_))
        ));
    }
}
