//! The wire protocol engine: request framing, name
//! normalization, and response emission over a `tokio::net::UnixStream`.

use payproc_api_core::error::{ErrorKind, PayprocError};
use payproc_api_core::kv::{KvList, Name};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// No physical line may exceed this many bytes; a longer
/// line surfaces `Truncated` rather than growing the read buffer unbounded.
pub const MAX_LINE_LEN: usize = 2048;

/// A parsed request: the command line's first token, its remaining
/// whitespace-delimited arguments, and the data-line dict.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: String,
    pub args: Vec<String>,
    pub dict: KvList,
}

/// Reads one LF-terminated line (tolerating a trailing `\r`) into `buf`,
/// up to [`MAX_LINE_LEN`]. Returns `Ok(None)` on a clean EOF with nothing
/// read, `Err(Eof)` on EOF mid-line, `Err(Truncated)` if the cap is hit
/// before a newline appears.
async fn read_line_capped<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>, PayprocError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader
            .read(&mut byte)
            .await
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("reading from peer: {e}")))?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(PayprocError::new(ErrorKind::Eof, "peer closed before the blank terminator"));
        }
        if byte[0] == b'\n' {
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            let line = String::from_utf8_lossy(&buf).into_owned();
            return Ok(Some(line));
        }
        buf.push(byte[0]);
        if buf.len() > MAX_LINE_LEN {
            return Err(PayprocError::new(ErrorKind::Truncated, "line exceeds the 2048-byte limit"));
        }
    }
}

/// Parses one request off `reader`: a command line, then zero or more
/// data lines (with continuation and `#`-comment handling), terminated by
/// a blank line. Returns `Ok(None)` if the peer closed the connection
/// cleanly before sending anything (the ordinary way a connection ends).
pub async fn parse_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Request>, PayprocError> {
    let Some(command_line) = read_line_capped(reader).await? else {
        return Ok(None);
    };
    let mut tokens = command_line.split_whitespace();
    let command = tokens
        .next()
        .ok_or_else(|| PayprocError::new(ErrorKind::UnknownCommand, "empty command line"))?
        .to_ascii_uppercase();
    let args: Vec<String> = tokens.map(str::to_owned).collect();

    let mut dict = KvList::new();
    let mut last_name: Option<Name> = None;
    loop {
        let line = read_line_capped(reader).await?.ok_or_else(|| PayprocError::new(ErrorKind::Eof, "peer closed mid-request"))?;
        if line.is_empty() {
            break;
        }
        if line.starts_with('#') {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let Some(name) = &last_name else {
                return Err(PayprocError::new(ErrorKind::ProtocolViolation, "continuation line with no preceding data line"));
            };
            let continuation = line.trim_start_matches([' ', '\t']);
            let existing = dict.get(name).unwrap_or_default().to_owned();
            dict.put(name.clone(), format!("{existing}\n{continuation}"));
            continue;
        }
        let Some((raw_name, raw_value)) = line.split_once(':') else {
            return Err(PayprocError::new(ErrorKind::ProtocolViolation, "data line missing ':'"));
        };
        let name = Name::parse_normalizing(raw_name.trim())?;
        let value = raw_value.strip_prefix(' ').unwrap_or(raw_value);
        dict.insert(name.clone(), value)?;
        last_name = Some(name);
    }

    Ok(Some(Request { command, args, dict }))
}

/// Writes a response: `OK[ extra]` or `ERR <code> (<description>)`,
/// wire-allowed data lines, then a blank terminator line. A value
/// containing embedded `\n` is emitted as a space-indented continuation per
/// line.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    result: &Result<KvList, PayprocError>,
    ok_extra: Option<&str>,
) -> std::io::Result<()> {
    match result {
        Ok(dict) => {
            match ok_extra {
                Some(extra) => writer.write_all(format!("OK {extra}\n").as_bytes()).await?,
                None => writer.write_all(b"OK\n").await?,
            }
            for (name, value) in dict.iter() {
                if !name.is_wire_allowed() {
                    continue;
                }
                write_data_line(writer, name.as_str(), value).await?;
            }
        }
        Err(err) => {
            writer.write_all(format!("ERR {} ({})\n", err.code, err.message).as_bytes()).await?;
            if let Some(failure) = &err.failure {
                write_data_line(writer, "failure", failure).await?;
            }
            if let Some(failure_mesg) = &err.failure_mesg {
                write_data_line(writer, "failure-mesg", failure_mesg).await?;
            }
        }
    }
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn write_data_line<W: AsyncWrite + Unpin>(writer: &mut W, name: &str, value: &str) -> std::io::Result<()> {
    let mut lines = value.split('\n');
    let first = lines.next().unwrap_or_default();
    writer.write_all(format!("{name}: {first}\n").as_bytes()).await?;
    for cont in lines {
        writer.write_all(format!(" {cont}\n").as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_command_and_args() {
        let mut input = Cursor::new(b"SESSION create 60\n\n".to_vec());
        let req = parse_request(&mut input).await.unwrap().unwrap();
        assert_eq!(req.command, "SESSION");
        assert_eq!(req.args, vec!["create", "60"]);
        assert!(req.dict.is_empty());
    }

    #[tokio::test]
    async fn normalizes_data_line_names_and_lowercases_command() {
        let mut input = Cursor::new(b"ping\ncontent-type: text/plain\n\n".to_vec());
        let req = parse_request(&mut input).await.unwrap().unwrap();
        assert_eq!(req.command, "PING");
        assert_eq!(req.dict.get_str("Content-Type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn continuation_line_appends_with_lf() {
        let mut input = Cursor::new(b"PING\nDesc: first\n second\n\n".to_vec());
        let req = parse_request(&mut input).await.unwrap().unwrap();
        assert_eq!(req.dict.get_str("Desc"), Some("first\nsecond"));
    }

    #[tokio::test]
    async fn comment_lines_are_ignored() {
        let mut input = Cursor::new(b"PING\n# a comment\nDesc: x\n\n".to_vec());
        let req = parse_request(&mut input).await.unwrap().unwrap();
        assert_eq!(req.dict.get_str("Desc"), Some("x"));
    }

    #[tokio::test]
    async fn duplicate_name_is_protocol_violation() {
        let mut input = Cursor::new(b"PING\nDesc: x\nDesc: y\n\n".to_vec());
        let err = parse_request(&mut input).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ProtocolViolation));
    }

    #[tokio::test]
    async fn truncates_overlong_line() {
        let mut long_line = vec![b'a'; MAX_LINE_LEN + 10];
        long_line.push(b'\n');
        let err = parse_request(&mut Cursor::new(long_line)).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Truncated));
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_is_none() {
        let mut input = Cursor::new(Vec::new());
        assert!(parse_request(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_request_is_an_error() {
        let mut input = Cursor::new(b"PING\nDesc: x\n".to_vec());
        let err = parse_request(&mut input).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Eof));
    }

    #[tokio::test]
    async fn write_response_ok_suppresses_internal_fields() {
        let mut dict = KvList::new();
        dict.put(Name::new("Token").unwrap(), "tok_1");
        dict.put(Name::new("_SESSID").unwrap(), "abc");
        dict.put(Name::new("_secret").unwrap(), "hidden");
        let mut out = Vec::new();
        write_response(&mut out, &Ok(dict), None).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("OK\n"));
        assert!(text.contains("Token: tok_1\n"));
        assert!(text.contains("_SESSID: abc\n"));
        assert!(!text.contains("_secret"));
        assert!(text.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn write_response_err_includes_failure_lines() {
        let err = PayprocError::new(ErrorKind::NotFound, "no such session").with_failure(Some("f1".to_owned()), Some("m1".to_owned()));
        let mut out = Vec::new();
        write_response(&mut out, &Err(err), None).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("ERR 11 (no such session)\n"));
        assert!(text.contains("failure: f1\n"));
        assert!(text.contains("failure-mesg: m1\n"));
    }

    #[tokio::test]
    async fn write_response_continuation_for_embedded_newline() {
        let mut dict = KvList::new();
        dict.put(Name::new("Desc").unwrap(), "first\nsecond");
        let mut out = Vec::new();
        write_response(&mut out, &Ok(dict), None).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Desc: first\n second\n"));
    }
}
