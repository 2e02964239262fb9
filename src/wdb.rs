//! Streaming writer for the `key: value[, value]*\n` record format read by
//! [`crate::rdb`].
//!
//! Every call is all-or-nothing: on [`WdbRes::Syntax`] or
//! [`WdbRes::Overflow`] the output length is rolled back to what it was
//! before the call, so a rejected write never leaves a partial token in the
//! buffer (this is the one place in this crate's codecs where overflow
//! rolls back — [`crate::wjson`] deliberately does not, see its module
//! docs).

/// Result of a single writer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WdbRes {
    Ok,
    /// Called out of order (a value with no preceding key, two keys with
    /// no value between them, a key containing a disallowed character).
    Syntax,
    /// The output buffer has no room left for this call.
    Overflow,
}

/// A streaming record writer appending into a caller-sized buffer of `CAP`
/// bytes.
pub struct WdbWriter<const CAP: usize> {
    out: [u8; CAP],
    len: usize,
    got_key: bool,
    is_first_val: bool,
}

impl<const CAP: usize> WdbWriter<CAP> {
    pub fn new() -> Self {
        WdbWriter {
            out: [0; CAP],
            len: 0,
            got_key: false,
            is_first_val: false,
        }
    }

    /// The bytes written so far, as UTF-8 text.
    pub fn out_str(&self) -> &str {
        std::str::from_utf8(&self.out[..self.len]).unwrap_or("")
    }

    pub fn key(&mut self, v: &str) -> WdbRes {
        let last_len = self.len;

        if self.got_key && self.is_first_val {
            return WdbRes::Syntax;
        }

        if self.got_key {
            if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(b'\n') {
                self.len = last_len;
                return r;
            }
        }

        if !v
            .bytes()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == b'.' || ch == b'_' || ch == b'-')
        {
            self.len = last_len;
            return WdbRes::Syntax;
        }

        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_literal(v) {
            self.len = last_len;
            return r;
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_literal(": ") {
            self.len = last_len;
            return r;
        }

        self.got_key = true;
        self.is_first_val = true;
        WdbRes::Ok
    }

    pub fn str(&mut self, v: &str) -> WdbRes {
        let last_len = self.len;
        if !self.got_key {
            return WdbRes::Syntax;
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.maybe_arr() {
            self.len = last_len;
            return r;
        }
        self.is_first_val = false;

        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(b'"') {
            self.len = last_len;
            return r;
        }
        for ch in v.bytes() {
            let (ch, is_escape) = match ch {
                b'"' => (b'"', true),
                b'\n' => (b'n', true),
                b'\r' => (b'r', true),
                other => {
                    if (other <= 31 || other >= 127) && other != b'\t' {
                        self.len = last_len;
                        return WdbRes::Syntax;
                    }
                    (other, false)
                }
            };
            if is_escape {
                if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(b'\\') {
                    self.len = last_len;
                    return r;
                }
            }
            if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(ch) {
                self.len = last_len;
                return r;
            }
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(b'"') {
            self.len = last_len;
            return r;
        }

        WdbRes::Ok
    }

    pub fn long_str(&mut self, v: &str) -> WdbRes {
        let last_len = self.len;
        if !self.got_key {
            return WdbRes::Syntax;
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.maybe_arr() {
            self.len = last_len;
            return r;
        }
        self.is_first_val = false;

        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_literal("<\n") {
            self.len = last_len;
            return r;
        }
        for ch in v.bytes() {
            let (ch, is_escape) = match ch {
                b'<' | b'>' => (ch, true),
                b'\r' => (b'r', true),
                other => {
                    if (other <= 31 || other >= 127) && other != b'\t' && other != b'\n' {
                        self.len = last_len;
                        return WdbRes::Syntax;
                    }
                    (other, false)
                }
            };
            if is_escape {
                if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(b'\\') {
                    self.len = last_len;
                    return r;
                }
            }
            if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(ch) {
                self.len = last_len;
                return r;
            }
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_literal("\n>") {
            self.len = last_len;
            return r;
        }

        WdbRes::Ok
    }

    pub fn int(&mut self, v: i64) -> WdbRes {
        let last_len = self.len;
        if !self.got_key {
            return WdbRes::Syntax;
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.maybe_arr() {
            self.len = last_len;
            return r;
        }
        self.is_first_val = false;

        let s = v.to_string();
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_literal(&s) {
            self.len = last_len;
            return r;
        }
        WdbRes::Ok
    }

    pub fn num(&mut self, v: f64) -> WdbRes {
        let last_len = self.len;
        if !self.got_key {
            return WdbRes::Syntax;
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.maybe_arr() {
            self.len = last_len;
            return r;
        }
        self.is_first_val = false;

        let s = format!("{v:.6}");
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_literal(&s) {
            self.len = last_len;
            return r;
        }
        WdbRes::Ok
    }

    pub fn bool(&mut self, v: bool) -> WdbRes {
        let last_len = self.len;
        if !self.got_key {
            return WdbRes::Syntax;
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.maybe_arr() {
            self.len = last_len;
            return r;
        }
        self.is_first_val = false;

        if let r @ (WdbRes::Syntax | WdbRes::Overflow) =
            self.add_literal(if v { "true" } else { "false" })
        {
            self.len = last_len;
            return r;
        }
        WdbRes::Ok
    }

    pub fn fin(&mut self) -> WdbRes {
        let last_len = self.len;
        if self.got_key && self.is_first_val {
            self.len = last_len;
            return WdbRes::Syntax;
        }
        if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(b'\n') {
            self.len = last_len;
            return r;
        }
        WdbRes::Ok
    }

    fn maybe_arr(&mut self) -> WdbRes {
        if !self.is_first_val {
            self.add_literal(", ")
        } else {
            WdbRes::Ok
        }
    }

    fn add_literal(&mut self, s: &str) -> WdbRes {
        for ch in s.bytes() {
            if let r @ (WdbRes::Syntax | WdbRes::Overflow) = self.add_ch(ch) {
                return r;
            }
        }
        WdbRes::Ok
    }

    fn add_ch(&mut self, ch: u8) -> WdbRes {
        if self.len < CAP {
            self.out[self.len] = ch;
            self.len += 1;
            WdbRes::Ok
        } else {
            WdbRes::Overflow
        }
    }
}

impl<const CAP: usize> Default for WdbWriter<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs() {
        let mut w: WdbWriter<128> = WdbWriter::new();
        assert_eq!(w.key("id"), WdbRes::Ok);
        assert_eq!(w.int(42), WdbRes::Ok);
        assert_eq!(w.key("name"), WdbRes::Ok);
        assert_eq!(w.str("hi\n"), WdbRes::Ok);
        assert_eq!(w.fin(), WdbRes::Ok);
        assert_eq!(w.out_str(), "id: 42\nname: \"hi\\n\"\n");
    }

    #[test]
    fn list_values_get_comma_separated() {
        let mut w: WdbWriter<128> = WdbWriter::new();
        assert_eq!(w.key("xs"), WdbRes::Ok);
        assert_eq!(w.int(1), WdbRes::Ok);
        assert_eq!(w.int(2), WdbRes::Ok);
        assert_eq!(w.bool(true), WdbRes::Ok);
        assert_eq!(w.fin(), WdbRes::Ok);
        assert_eq!(w.out_str(), "xs: 1, 2, true\n");
    }

    #[test]
    fn long_string_escapes_brackets() {
        let mut w: WdbWriter<128> = WdbWriter::new();
        assert_eq!(w.key("blob"), WdbRes::Ok);
        assert_eq!(w.long_str("a<b>c"), WdbRes::Ok);
        assert_eq!(w.fin(), WdbRes::Ok);
        assert_eq!(w.out_str(), "blob: <\na\\<b\\>c\n>\n");
    }

    #[test]
    fn value_without_key_is_syntax_error() {
        let mut w: WdbWriter<128> = WdbWriter::new();
        assert_eq!(w.int(1), WdbRes::Syntax);
    }

    #[test]
    fn key_without_value_rejected_by_fin() {
        let mut w: WdbWriter<128> = WdbWriter::new();
        assert_eq!(w.key("k"), WdbRes::Ok);
        assert_eq!(w.fin(), WdbRes::Syntax);
    }

    #[test]
    fn overflow_rolls_back_to_pre_call_length() {
        let mut w: WdbWriter<8> = WdbWriter::new();
        assert_eq!(w.key("k"), WdbRes::Ok);
        let before = w.out_str().len();
        assert_eq!(w.str("way too long for this buffer"), WdbRes::Overflow);
        assert_eq!(w.out_str().len(), before);
    }

    #[test]
    fn key_with_invalid_character_is_rejected() {
        let mut w: WdbWriter<128> = WdbWriter::new();
        assert_eq!(w.key("bad key!"), WdbRes::Syntax);
        assert_eq!(w.out_str(), "");
    }
}
