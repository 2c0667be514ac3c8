use anyhow::Result;
use anyhow::bail;
use bstr::BString;
use bstr::ByteSlice as _;
use std::ops::Deref;
use std::ops::DerefMut;
use std::process::Command;
use std::process::ExitStatus;

/// Removes trailing lines containing just whitespaces. A line is defined here
/// as a sequence of characters ending with `\n`. Adds `\n` if missing from the
/// last line.
///
/// # Examples
/// ```
/// use git_surgeon::util::ensure_one_trailing_newline;
///
/// assert_eq!(&ensure_one_trailing_newline("foo".to_owned()), "foo\n");
/// assert_eq!(&ensure_one_trailing_newline("foo\n".to_owned()), "foo\n");
/// assert_eq!(
///     &ensure_one_trailing_newline("foo\n  \n\r\n".to_owned()),
///     "foo\n"
/// );
/// assert_eq!(&ensure_one_trailing_newline(" \n  \n\r\n".to_owned()), "");
/// ```
pub fn ensure_one_trailing_newline(mut s: String) -> String {
    let mut ret_len = s.len();
    for (idx, c) in s.char_indices().rev() {
        if c == '\n' {
            // Include the one byte LF.
            ret_len = idx + 1;
        } else if c.is_whitespace() {
            // Continue
        } else {
            // This line should not be removed.
            if ret_len == s.len() && !s.ends_with('\n') {
                s.push('\n');
            } else {
                s.truncate(ret_len);
            }
            return s;
        }
    }
    // The whole string contained just whitespaces and newlines.
    s.clear();
    s
}

/// Removes trailing LF or CRLF from a string.
///
/// # Examples
/// ```
/// use git_surgeon::util::trim_newline_suffix;
///
/// assert_eq!(trim_newline_suffix("foo"), "foo");
/// assert_eq!(trim_newline_suffix("foo\n"), "foo");
/// assert_eq!(trim_newline_suffix("foo\r\n"), "foo");
/// assert_eq!(trim_newline_suffix("foo\nbar\n"), "foo\nbar");
/// ```
pub fn trim_newline_suffix(line: &str) -> &str {
    let Some(line) = line.strip_suffix('\n') else {
        return line;
    };
    let Some(line) = line.strip_suffix('\r') else {
        return line;
    };
    line
}

/// Removes trailing LF or CRLF from a byte string.
pub fn trim_bytes_newline_suffix(s: &[u8]) -> &[u8] {
    let Some(s) = s.strip_suffix(b"\n") else {
        return s;
    };
    let Some(s) = s.strip_suffix(b"\r") else {
        return s;
    };
    s
}

/// True if the path needs the quoted form on a fileop line, i.e. it contains
/// bytes that git-fast-import cannot take bare.
pub fn path_needs_quoting(path: &[u8]) -> bool {
    path.first() == Some(&b'"')
        || path
            .iter()
            .any(|&b| b == b'\n' || b == b'\\' || b == b'"' || b == b' ' || b == b'\t')
}

/// Quotes a path with C-style escapes the way git-fast-export does.
pub fn quote_path(path: &[u8]) -> BString {
    let mut out = Vec::with_capacity(path.len() + 2);
    out.push(b'"');
    for &b in path {
        match b {
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'"' => out.extend_from_slice(b"\\\""),
            _ => out.push(b),
        }
    }
    out.push(b'"');
    out.into()
}

/// Unquotes a C-style string literal starting at `s[0] == '"'`. Returns the
/// unescaped content and the remainder of the input after the closing quote.
pub fn unquote_c_style(s: &[u8]) -> Result<(BString, &[u8])> {
    if s.first() != Some(&b'"') {
        bail!("not a quoted string");
    }
    let mut out = Vec::new();
    let mut i = 1;
    while i < s.len() {
        match s[i] {
            b'"' => return Ok((out.into(), &s[i + 1..])),
            b'\\' => {
                i += 1;
                let Some(&esc) = s.get(i) else {
                    bail!("string not terminated");
                };
                let ch = match esc {
                    b'a' => 0x07,
                    b'b' => 0x08,
                    b'f' => 0x0c,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'v' => 0x0b,
                    b'\\' | b'"' => esc,
                    o1 @ b'0'..=b'3' => {
                        let (Some(&o2), Some(&o3)) = (s.get(i + 1), s.get(i + 2)) else {
                            bail!("string not terminated");
                        };
                        if !(b'0'..=b'7').contains(&o2) || !(b'0'..=b'7').contains(&o3) {
                            bail!("invalid digit in octal escape sequence");
                        }
                        i += 2;
                        ((o1 - b'0') << 6) | ((o2 - b'0') << 3) | (o3 - b'0')
                    }
                    b'4'..=b'7' => bail!("octal escape sequence overflows"),
                    _ => bail!("invalid escape sequence"),
                };
                out.push(ch);
            }
            b => out.push(b),
        }
        i += 1;
    }
    bail!("string not terminated");
}

/// Splits a fileop operand field: either a quoted token or everything up to
/// the next space (or the whole rest for final path operands).
pub fn take_path_token(s: &[u8], rest_is_path: bool) -> Result<(BString, &[u8])> {
    if s.first() == Some(&b'"') {
        let (path, rest) = unquote_c_style(s)?;
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        Ok((path, rest))
    } else if rest_is_path {
        Ok((s.into(), b""))
    } else {
        match s.find_byte(b' ') {
            Some(idx) => Ok((s[..idx].into(), &s[idx + 1..])),
            None => Ok((s.into(), b"")),
        }
    }
}

pub trait NewlineTrimmer {
    fn trim_newline_suffix(&self) -> &Self;
}

impl NewlineTrimmer for str {
    fn trim_newline_suffix(&self) -> &Self {
        trim_newline_suffix(self)
    }
}

impl NewlineTrimmer for [u8] {
    fn trim_newline_suffix(&self) -> &[u8] {
        trim_bytes_newline_suffix(self)
    }
}

pub trait CommandExtension {
    fn safe_output(&mut self) -> std::io::Result<SafeOutput>;

    fn check_success_with_stderr(&mut self) -> anyhow::Result<SafeOutput> {
        let ret = self.safe_output()?;
        ret.check_success_with_stderr()?;
        Ok(ret)
    }
}

impl CommandExtension for Command {
    fn safe_output(&mut self) -> std::io::Result<SafeOutput> {
        self.output().map(|output| {
            let status = output.status;
            SafeOutput { output, status }
        })
    }
}

pub struct SafeOutput {
    output: std::process::Output,
    pub status: ExitStatus,
}

impl SafeOutput {
    /// Checks that the command was successful and otherwise returns an error
    /// with the exit status together with the stderr content.
    pub fn check_success_with_stderr(&self) -> anyhow::Result<&Self> {
        if !self.status.success() {
            if self.stderr.is_empty() {
                bail!("{}", self.status);
            } else if !self.stderr.trim_ascii().contains(&b'\n') {
                bail!("{}: {}", self.status, String::from_utf8_lossy(&self.stderr));
            } else {
                bail!("{}:\n{}", self.status, String::from_utf8_lossy(&self.stderr));
            }
        }
        Ok(self)
    }
}

impl Deref for SafeOutput {
    type Target = std::process::Output;

    fn deref(&self) -> &Self::Target {
        &self.output
    }
}

impl DerefMut for SafeOutput {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_unquote_identity() {
        for path in [
            b"plain/path.txt".as_slice(),
            b"with space.txt",
            b"tab\there",
            b"new\nline",
            b"back\\slash",
            b"quo\"te",
        ] {
            let quoted = quote_path(path);
            let (unquoted, rest) = unquote_c_style(&quoted).unwrap();
            assert_eq!(unquoted.as_slice(), path);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_unquote_octal() {
        let (s, rest) = unquote_c_style(b"\"\\303\\251\" tail").unwrap();
        assert_eq!(s.as_slice(), "\u{e9}".as_bytes());
        assert_eq!(rest, b" tail");
    }

    #[test]
    fn test_unquote_unterminated() {
        assert!(unquote_c_style(b"\"abc").is_err());
        assert!(unquote_c_style(b"\"abc\\").is_err());
    }

    #[test]
    fn test_take_path_token() {
        let (tok, rest) = take_path_token(b"a/b c/d", false).unwrap();
        assert_eq!(tok.as_slice(), b"a/b");
        assert_eq!(rest, b"c/d");
        let (tok, rest) = take_path_token(b"a b c", true).unwrap();
        assert_eq!(tok.as_slice(), b"a b c");
        assert!(rest.is_empty());
        let (tok, rest) = take_path_token(b"\"a b\" c", false).unwrap();
        assert_eq!(tok.as_slice(), b"a b");
        assert_eq!(rest, b"c");
    }
}
