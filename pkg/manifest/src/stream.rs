use crate::escape::unescape_name;
use crate::locator::{is_locator, locator_size};
use crate::ManifestError;

/// A file token within a stream: `pos:len:name`, positions relative to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSegment {
    pub pos: u64,
    pub len: u64,
    pub name: String,
}

/// A contiguous region of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub locator: String,
    pub offset: u64,
    pub len: u64,
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    /// Unescaped stream name, `.` or `./...`
    pub name: String,
    pub blocks: Vec<String>,
    pub files: Vec<StreamSegment>,
    block_ends: Vec<u64>,
}

impl Stream {
    pub fn parse(line: &str) -> Result<Self, ManifestError> {
        let mut tokens = line.split(' ');
        let name_token = tokens.next().unwrap_or_default();
        if name_token != "." && !name_token.starts_with("./") {
            return Err(ManifestError::InvalidStreamName(name_token.to_string()));
        }

        let mut blocks = Vec::new();
        let mut block_ends = Vec::new();
        let mut files = Vec::new();
        let mut end = 0u64;
        for tok in tokens {
            if files.is_empty() && is_locator(tok) {
                end = locator_size(tok)
                    .and_then(|size| end.checked_add(size))
                    .ok_or_else(|| ManifestError::InvalidLocator(tok.to_string()))?;
                blocks.push(tok.to_string());
                block_ends.push(end);
                continue;
            }
            if blocks.is_empty() {
                return Err(ManifestError::NoBlockLocators);
            }
            files.push(parse_file_token(tok)?);
        }
        if blocks.is_empty() {
            return Err(ManifestError::NoBlockLocators);
        }
        if files.is_empty() {
            return Err(ManifestError::NoFileTokens);
        }
        for seg in &files {
            if seg.pos.checked_add(seg.len).is_none_or(|seg_end| seg_end > end) {
                return Err(ManifestError::SegmentPastEnd {
                    pos: seg.pos,
                    len: seg.len,
                    name: seg.name.clone(),
                    size: end,
                });
            }
        }
        Ok(Self {
            name: unescape_name(name_token),
            blocks,
            files,
            block_ends,
        })
    }

    /// Total size of the stream's blocks.
    pub fn size(&self) -> u64 {
        self.block_ends.last().copied().unwrap_or(0)
    }

    /// Block-level pieces of one file token, computed lazily.
    pub fn block_segments<'a>(&'a self, seg: &StreamSegment) -> BlockSegments<'a> {
        BlockSegments {
            stream: self,
            pos: seg.pos,
            remaining: seg.len,
            idx: 0,
        }
    }
}

fn parse_file_token(tok: &str) -> Result<StreamSegment, ManifestError> {
    let invalid = || ManifestError::InvalidFileToken(tok.to_string());
    let mut parts = tok.splitn(3, ':');
    let (Some(pos), Some(len), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(pos) || !digits(len) || name.is_empty() {
        return Err(invalid());
    }
    Ok(StreamSegment {
        pos: pos.parse().map_err(|_| invalid())?,
        len: len.parse().map_err(|_| invalid())?,
        name: unescape_name(name),
    })
}

/// Pull-based iterator mapping a stream range onto the blocks that hold it.
/// Zero-length ranges yield nothing.
pub struct BlockSegments<'a> {
    stream: &'a Stream,
    pos: u64,
    remaining: u64,
    idx: usize,
}

impl Iterator for BlockSegments<'_> {
    type Item = FileSegment;

    fn next(&mut self) -> Option<FileSegment> {
        if self.remaining == 0 {
            return None;
        }
        let ends = &self.stream.block_ends;
        while self.idx < ends.len() && ends[self.idx] <= self.pos {
            self.idx += 1;
        }
        let end = *ends.get(self.idx)?;
        let start = if self.idx == 0 { 0 } else { ends[self.idx - 1] };
        let take = self.remaining.min(end - self.pos);
        let seg = FileSegment {
            locator: self.stream.blocks[self.idx].clone(),
            offset: self.pos - start,
            len: take,
        };
        self.pos += take;
        self.remaining -= take;
        Some(seg)
    }
}

/// Lazy iterator over the streams of a manifest text.
pub struct Streams<'a> {
    lines: std::str::Split<'a, char>,
}

impl<'a> Streams<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self {
            lines: text.split('\n'),
        }
    }
}

impl Iterator for Streams<'_> {
    type Item = Result<Stream, ManifestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            if !line.is_empty() {
                return Some(Stream::parse(line));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream() {
        let s = Stream::parse(
            ". acbd18db4cc2f85cedef654fccc4a4d8+3 37b51d194a7513e45b56f6524f2d51f2+3 0:1:f 1:4:ooba",
        )
        .unwrap();
        assert_eq!(s.name, ".");
        assert_eq!(s.size(), 6);
        let ooba: Vec<_> = s.block_segments(&s.files[1]).collect();
        assert_eq!(
            ooba,
            vec![
                FileSegment {
                    locator: "acbd18db4cc2f85cedef654fccc4a4d8+3".to_string(),
                    offset: 1,
                    len: 2
                },
                FileSegment {
                    locator: "37b51d194a7513e45b56f6524f2d51f2+3".to_string(),
                    offset: 0,
                    len: 2
                },
            ]
        );
    }

    #[test]
    fn test_bad_streams() {
        let cases = [
            ("badstream acbd18db4cc2f85cedef654fccc4a4d8+3 0:1:file1.txt", "Invalid stream name: badstream"),
            ("/badstream acbd18db4cc2f85cedef654fccc4a4d8+3 0:1:file1.txt", "Invalid stream name: /badstream"),
            (". acbd18db4cc2f85cedef654fccc4a4d8+3 file1.txt", "Invalid file token: file1.txt"),
            (". acbd18db4cc2f85cedef654fccc4a4+3 0:1:file1.txt", "No block locators found"),
            (". acbd18db4cc2f85cedef654fccc4a4d8 0:1:file1.txt", "No block locators found"),
            (
                ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:1:file1.txt file2.txt 1:2:file3.txt",
                "Invalid file token: file2.txt",
            ),
            (
                ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:1:file1.txt. bcde18db4cc2f85cedef654fccc4a4d8+3 1:2:file3.txt",
                "Invalid file token: bcde18db4cc2f85cedef654fccc4a4d8+3",
            ),
            (". acbd18db4cc2f85cedef654fccc4a4d8+3 ::file2.txt", "Invalid file token: ::file2.txt"),
            (
                ". acbd18db4cc2f85cedef654fccc4a4d8+3 bcde18db4cc2f85cedef654fccc4a4d8+3",
                "No file tokens found",
            ),
            (". acbd18db4cc2f85cedef654fccc4a4d8+3 ", "Invalid file token: "),
            (". acbd18db4cc2f85cedef654fccc4a4d8+3", "No file tokens found"),
            (". 0:1:file1.txt", "No block locators found"),
            (".", "No block locators found"),
        ];
        for (line, want) in cases {
            let err = Stream::parse(line).unwrap_err();
            assert_eq!(err.to_string(), want, "line {:?}", line);
        }
    }

    #[test]
    fn test_segment_past_end() {
        let err = Stream::parse("./foo 204e43b8a1185621ca55a94839582e6f+67108864 67108863:3:bar")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "File segment 67108863:3:bar extends past end of stream 67108864"
        );
    }

    #[test]
    fn test_segment_bounds() {
        // Ending exactly at the stream size is fine; one byte more is not.
        let s = Stream::parse(". acbd18db4cc2f85cedef654fccc4a4d8+3 37b51d194a7513e45b56f6524f2d51f2+3 2:4:f")
            .unwrap();
        assert_eq!(s.block_segments(&s.files[0]).map(|seg| seg.len).sum::<u64>(), 4);
        let err = Stream::parse(". acbd18db4cc2f85cedef654fccc4a4d8+3 37b51d194a7513e45b56f6524f2d51f2+3 2:5:f")
            .unwrap_err();
        assert!(matches!(err, ManifestError::SegmentPastEnd { size: 6, .. }), "{}", err);
        let err = Stream::parse(". acbd18db4cc2f85cedef654fccc4a4d8+3 0:4:f").unwrap_err();
        assert!(matches!(err, ManifestError::SegmentPastEnd { size: 3, .. }), "{}", err);
    }

    #[test]
    fn test_segment_overflow_is_an_error() {
        let err = Stream::parse(". acbd18db4cc2f85cedef654fccc4a4d8+3 18446744073709551615:1:x").unwrap_err();
        assert!(matches!(err, ManifestError::SegmentPastEnd { pos: u64::MAX, len: 1, .. }), "{}", err);
        let err = Stream::parse(". acbd18db4cc2f85cedef654fccc4a4d8+3 1:18446744073709551615:x").unwrap_err();
        assert!(matches!(err, ManifestError::SegmentPastEnd { .. }), "{}", err);
    }

    #[test]
    fn test_locator_size_overflow_is_an_error() {
        // Too wide for u64.
        let err = Stream::parse(". acbd18db4cc2f85cedef654fccc4a4d8+18446744073709551616 0:1:x").unwrap_err();
        assert!(matches!(err, ManifestError::InvalidLocator(_)), "{}", err);
        // Each fits, the sum doesn't.
        let err = Stream::parse(
            ". acbd18db4cc2f85cedef654fccc4a4d8+18446744073709551615 37b51d194a7513e45b56f6524f2d51f2+1 0:1:x",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid block locator: 37b51d194a7513e45b56f6524f2d51f2+1"
        );
    }

    #[test]
    fn test_streams_skip_blank_lines() {
        let text = ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:foo\n\n./x acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:bar\n";
        let names: Vec<String> = Streams::new(text).map(|s| s.unwrap().name).collect();
        assert_eq!(names, vec![".", "./x"]);
    }
}
