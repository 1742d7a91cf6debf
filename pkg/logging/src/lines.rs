use pkg_constants::logging::{MAX_LOG_LINE, PARTIAL_LINE_MARKER};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::throttle::ThrottledLogger;

/// Copy container output into `logger` one line at a time. Lines longer than
/// the maximum are cut into pieces, each cut marked with `[...]` at the end
/// of one piece and the start of the next.
pub async fn copy_lines<R: AsyncRead + Unpin>(reader: R, logger: &ThrottledLogger) -> std::io::Result<()> {
    let mut reader = BufReader::with_capacity(MAX_LOG_LINE, reader);
    let mut continued = false;
    let mut piece = Vec::with_capacity(MAX_LOG_LINE);
    loop {
        piece.clear();
        if let Err(e) = read_piece(&mut reader, &mut piece).await {
            logger.println(format!("error reading container log: {}", e));
            return Err(e);
        }
        if piece.is_empty() {
            return Ok(());
        }
        let complete = piece.last() == Some(&b'\n');
        if complete {
            piece.pop();
        }
        let cut = !complete && piece.len() >= MAX_LOG_LINE;

        let mut line = Vec::with_capacity(piece.len() + 2 * PARTIAL_LINE_MARKER.len());
        if continued {
            line.extend_from_slice(PARTIAL_LINE_MARKER.as_bytes());
        }
        line.extend_from_slice(&piece);
        if cut {
            line.extend_from_slice(PARTIAL_LINE_MARKER.as_bytes());
        }
        line.push(b'\n');
        logger.write(&line);
        continued = cut;
    }
}

/// Read up to and including the next newline, or `MAX_LOG_LINE` bytes,
/// whichever comes first. Empty at EOF.
async fn read_piece<R: AsyncRead + Unpin>(reader: &mut BufReader<R>, out: &mut Vec<u8>) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        let room = MAX_LOG_LINE - out.len();
        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) if i < room => {
                out.extend_from_slice(&available[..=i]);
                (i + 1, true)
            }
            _ => {
                let n = available.len().min(room);
                out.extend_from_slice(&available[..n]);
                (n, out.len() >= MAX_LOG_LINE)
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ThrottleParams;
    use crate::sink::LogSink;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Capture(Mutex<Vec<u8>>);

    #[async_trait]
    impl LogSink for Capture {
        async fn write(&self, data: &[u8]) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
    }

    /// Copy `input` and return the logged messages without timestamps.
    async fn copy(input: Vec<u8>) -> Vec<String> {
        let cap = Arc::new(Capture::default());
        let logger = ThrottledLogger::new(cap.clone(), &ThrottleParams::default());
        copy_lines(&input[..], &logger).await.unwrap();
        logger.close().await.unwrap();
        let text = String::from_utf8(cap.0.lock().unwrap().clone()).unwrap();
        text.lines()
            .map(|l| l.split_once(' ').unwrap().1.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_short_lines() {
        let got = copy(b"one\ntwo\n\nlast without newline".to_vec()).await;
        assert_eq!(got, vec!["one", "two", "", "last without newline"]);
    }

    #[tokio::test]
    async fn test_long_line_is_split() {
        let mut input = vec![b'x'; MAX_LOG_LINE * 2 + 10];
        input.push(b'\n');
        input.extend_from_slice(b"next\n");
        let got = copy(input).await;
        assert_eq!(got.len(), 4);
        assert_eq!(got[0], format!("{}[...]", "x".repeat(MAX_LOG_LINE)));
        assert_eq!(got[1], format!("[...]{}[...]", "x".repeat(MAX_LOG_LINE)));
        assert_eq!(got[2], format!("[...]{}", "x".repeat(10)));
        assert_eq!(got[3], "next");
    }

    #[tokio::test]
    async fn test_exact_length_line() {
        let mut input = vec![b'y'; MAX_LOG_LINE];
        input.push(b'\n');
        let got = copy(input).await;
        assert_eq!(got, vec![format!("{}[...]", "y".repeat(MAX_LOG_LINE)), "[...]".to_string()]);
    }
}
