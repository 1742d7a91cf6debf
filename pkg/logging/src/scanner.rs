use std::collections::HashSet;

type Report = Box<dyn FnMut(&str, &str) + Send>;

/// Watches a byte stream for lines containing any of a set of substrings,
/// calling `report(pattern, line)` the first time each pattern is seen.
pub struct LogScanner {
    patterns: Vec<String>,
    report: Report,
    reported: HashSet<usize>,
    pending: Vec<u8>,
}

impl LogScanner {
    pub fn new<F>(patterns: &[&str], report: F) -> Self
    where
        F: FnMut(&str, &str) + Send + 'static,
    {
        Self {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            report: Box::new(report),
            reported: HashSet::new(),
            pending: Vec::new(),
        }
    }

    /// Feed more of the stream. Lines end at `\n` or `\r`.
    pub fn scan(&mut self, data: &[u8]) {
        if self.reported.len() == self.patterns.len() {
            return;
        }
        self.pending.extend_from_slice(data);
        let mut start = 0;
        while let Some(eol) = self.pending[start..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
        {
            let line = String::from_utf8_lossy(&self.pending[start..start + eol]).into_owned();
            self.check(&line);
            start += eol + 1;
        }
        self.pending.drain(..start);
    }

    fn check(&mut self, line: &str) {
        for (i, pat) in self.patterns.iter().enumerate() {
            if !self.reported.contains(&i) && line.contains(pat.as_str()) {
                self.reported.insert(i);
                (self.report)(pat, line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn scanner() -> (LogScanner, Arc<Mutex<Vec<(String, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let s = LogScanner::new(&["Keep write error", "Block not found error"], move |p, l| {
            sink.lock().unwrap().push((p.to_string(), l.to_string()));
        });
        (s, seen)
    }

    #[test]
    fn test_reports_once_per_pattern() {
        let (mut s, seen) = scanner();
        s.scan(b"ok\nfoo Keep write error: 503\nKeep write error again\n");
        s.scan(b"Block not found error abc\n");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("Keep write error".to_string(), "foo Keep write error: 503".to_string()));
        assert_eq!(seen[1].0, "Block not found error");
    }

    #[test]
    fn test_line_split_across_writes() {
        let (mut s, seen) = scanner();
        s.scan(b"xx Keep wr");
        assert!(seen.lock().unwrap().is_empty());
        s.scan(b"ite error\r\n");
        assert_eq!(seen.lock().unwrap()[0].1, "xx Keep write error");
    }

    #[test]
    fn test_unterminated_line_not_reported() {
        let (mut s, seen) = scanner();
        s.scan(b"Block not found error");
        assert!(seen.lock().unwrap().is_empty());
    }
}
