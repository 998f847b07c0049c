//! Control-channel reply framing per RFC 959 section 4.2.
//!
//! Single-line replies are `CODE TEXT\r\n`. Multi-line replies open with
//! `CODE-first\r\n`, continue with freely formatted lines, and terminate
//! with `CODE last\r\n`. The session writes the rendered bytes before the
//! first byte of the next command is processed, which is what gives the
//! per-session reply ordering guarantee.

use std::fmt;

use smallvec::SmallVec;

/// A rendered or renderable control-channel reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: SmallVec<[String; 2]>,
}

impl Reply {
    /// Single-line reply.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        let mut lines = SmallVec::new();
        lines.push(text.into());
        Reply { code, lines }
    }

    /// Multi-line reply. With fewer than two lines this degrades to the
    /// single-line form.
    pub fn multi(code: u16, lines: impl IntoIterator<Item = String>) -> Self {
        let lines: SmallVec<[String; 2]> = lines.into_iter().collect();
        if lines.is_empty() {
            return Reply::new(code, "");
        }
        Reply { code, lines }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// First (or only) text line, used by tests and logging.
    pub fn text(&self) -> &str {
        &self.lines[0]
    }

    /// Whether the code indicates a positive completion or intermediate
    /// state (1xx/2xx/3xx).
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// Renders the reply with CRLF framing, ready to be written to the
    /// control socket.
    pub fn to_wire(&self) -> String {
        if self.lines.len() == 1 {
            return format!("{} {}\r\n", self.code, self.lines[0]);
        }
        let mut out = String::new();
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            if i == 0 {
                out.push_str(&format!("{}-{}\r\n", self.code, line));
            } else if i == last {
                out.push_str(&format!("{} {}\r\n", self.code, line));
            } else {
                out.push_str(&format!(" {}\r\n", line));
            }
        }
        out
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_framing() {
        let r = Reply::new(230, "User logged in.");
        assert_eq!(r.to_wire(), "230 User logged in.\r\n");
        assert!(r.is_positive());
    }

    #[test]
    fn multi_line_framing() {
        let r = Reply::multi(
            211,
            ["Features:", "MLST type*;size*;modify*;perm*;", "End"].map(String::from),
        );
        assert_eq!(
            r.to_wire(),
            "211-Features:\r\n MLST type*;size*;modify*;perm*;\r\n211 End\r\n"
        );
    }

    #[test]
    fn two_line_reply_has_open_and_close() {
        let r = Reply::multi(214, ["HELP", "Done"].map(String::from));
        assert_eq!(r.to_wire(), "214-HELP\r\n214 Done\r\n");
    }

    #[test]
    fn negative_codes() {
        assert!(!Reply::new(530, "Login incorrect").is_positive());
        assert!(!Reply::new(421, "Timeout").is_positive());
    }
}
