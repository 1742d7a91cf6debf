//! Octal escaping of stream and file names.

/// Escape a name for use as a manifest token.
pub fn escape_name(name: &str) -> String {
    if name == "." {
        return "\\056".to_string();
    }
    let mut out = String::with_capacity(name.len());
    let mut buf = [0u8; 4];
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            // C0 and C1 controls, space, DEL and ':' (the file token separator)
            // are written byte by byte in octal.
            c if (c as u32) <= 32 || c == ':' || c.is_control() => {
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\{:03o}", b));
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Reverse `escape_name`. Malformed escapes are kept verbatim.
pub fn unescape_name(token: &str) -> String {
    let raw = token.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'\\' {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        if raw.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
            continue;
        }
        if i + 3 < raw.len() && raw[i + 1..i + 4].iter().all(|d| (b'0'..=b'7').contains(d)) {
            let v = (raw[i + 1] - b'0') as u32 * 64 + (raw[i + 2] - b'0') as u32 * 8
                + (raw[i + 3] - b'0') as u32;
            // \400 and up don't fit a byte and stay as written.
            if let Ok(b) = u8::try_from(v) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(b'\\');
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape() {
        for (input, want) in [
            (r"\040", " "),
            (r"\009", r"\009"),
            (r"\\\040\\", r"\ \"),
            (r"\\040\", r"\040\"),
            (r"a\040b\040c", "a b c"),
            (r"\377", "\u{fffd}"),
            (r"\400", r"\400"),
            (r"x\777y", r"x\777y"),
            (r"\302\205", "\u{85}"),
        ] {
            assert_eq!(unescape_name(input), want, "input {}", input);
        }
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_name("hello world.txt"), r"hello\040world.txt");
        assert_eq!(escape_name("tab\there"), r"tab\011here");
        assert_eq!(escape_name(r"back\slash"), r"back\\slash");
        assert_eq!(escape_name("."), r"\056");
        assert_eq!(escape_name("caf\u{e9} ok"), "caf\u{e9}\\040ok");
        assert_eq!(escape_name("a:b"), r"a\072b");
        assert_eq!(escape_name("del\u{7f}"), r"del\177");
        assert_eq!(escape_name("nel\u{85}"), r"nel\302\205");
        for name in ["a b\\c", "a:b", "nel\u{85}x", "\u{9f}\u{a0}"] {
            assert_eq!(unescape_name(&escape_name(name)), name);
        }
    }
}
