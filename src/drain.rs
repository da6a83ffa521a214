//! Line-by-line draining of a child's output pipe into a text buffer.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Accumulated output of one launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Read `stream` until EOF, keeping every non-empty line followed by `\n`.
///
/// A trailing `\r` is stripped and invalid UTF-8 is replaced. A read error
/// ends the drain early with whatever was collected so far.
pub async fn drain_lines<R>(stream: R, name: &'static str) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = trim_line_ending(&line);
                if !text.is_empty() {
                    buf.push_str(&String::from_utf8_lossy(text));
                    buf.push('\n');
                }
            }
            Err(e) => {
                tracing::debug!(stream = name, error = %e, "output drain stopped on read error");
                break;
            }
        }
    }

    buf
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_keeps_line_order() {
        let input: &[u8] = b"one\ntwo\nthree\n";
        assert_eq!(drain_lines(input, "stdout").await, "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_drain_skips_empty_lines() {
        let input: &[u8] = b"\nfirst\n\n\nsecond\n\n";
        assert_eq!(drain_lines(input, "stdout").await, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_drain_terminates_final_unterminated_line() {
        let input: &[u8] = b"alpha\nbeta";
        assert_eq!(drain_lines(input, "stdout").await, "alpha\nbeta\n");
    }

    #[tokio::test]
    async fn test_drain_strips_carriage_returns() {
        let input: &[u8] = b"dos\r\nline\r\n\r\n";
        assert_eq!(drain_lines(input, "stderr").await, "dos\nline\n");
    }

    #[tokio::test]
    async fn test_drain_replaces_invalid_utf8() {
        let input: &[u8] = b"ok\n\xff\xfe\n";
        let out = drain_lines(input, "stdout").await;
        assert!(out.starts_with("ok\n"));
        assert!(out.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn test_drain_empty_stream() {
        let input: &[u8] = b"";
        assert_eq!(drain_lines(input, "stdout").await, "");
    }

    #[test]
    fn test_output_default_is_empty() {
        let out = ProcessOutput::default();
        assert!(out.stdout.is_empty());
        assert!(out.stderr.is_empty());
    }
}
