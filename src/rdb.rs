//! Streaming reader for the line-oriented `key: value[, value]*\n` record
//! format used to persist module state to disk.
//!
//! Like [`crate::rjson`], this is a byte-at-a-time push parser with no
//! dynamic allocation: the caller supplies the output buffer via the `CAP`
//! const generic and feeds one byte per [`RdbReader::next`] call, including
//! a final `0` byte to signal end-of-input.

const BOOL_WORD_CAP: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdbNextRes {
    Ok,
    Fin,
    Syntax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdbTy {
    Incomplete,
    Key,
    Str,
    Num,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum St {
    Idle,
    Key,
    Str,
    LongStr,
    Num,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumPart {
    Int,
    Frac,
    Exp,
}

/// A streaming record reader over a caller-sized string buffer of `CAP`
/// bytes.
pub struct RdbReader<const CAP: usize> {
    str_out: [u8; CAP],
    str_len: usize,
    /// Scratch length shared by the key/str/long-str states while a value
    /// is being accumulated; committed to `str_len` on completion.
    len: usize,

    pos: usize,
    ty: RdbTy,
    st: St,

    is_in_arr: bool,
    got_key: bool,
    expect_colon: bool,
    got_first_val: bool,

    is_escape: bool,
    skip_whitespace: bool,
    keep_last_newline: bool,

    num: f64,
    num_is_negative: bool,
    num_got_sign: bool,
    num_got_int_explicit: bool,
    exp: i32,
    exp_is_negative: bool,
    num_pos: i32,
    num_part: NumPart,

    bool_word: [u8; BOOL_WORD_CAP],
    bool_wlen: usize,
}

impl<const CAP: usize> RdbReader<CAP> {
    pub fn new() -> Self {
        RdbReader {
            str_out: [0; CAP],
            str_len: 0,
            len: 0,
            pos: 0,
            ty: RdbTy::Incomplete,
            st: St::Idle,
            is_in_arr: false,
            got_key: false,
            expect_colon: false,
            got_first_val: false,
            is_escape: false,
            skip_whitespace: false,
            keep_last_newline: false,
            num: 0.0,
            num_is_negative: false,
            num_got_sign: false,
            num_got_int_explicit: false,
            exp: 0,
            exp_is_negative: false,
            num_pos: 0,
            num_part: NumPart::Int,
            bool_word: [0; BOOL_WORD_CAP],
            bool_wlen: 0,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn cur_ty(&self) -> RdbTy {
        self.ty
    }

    pub fn cur_str(&self) -> &str {
        std::str::from_utf8(&self.str_out[..self.str_len]).unwrap_or("")
    }

    pub fn cur_num(&self) -> f64 {
        let exponent = if self.exp_is_negative { -self.exp } else { self.exp };
        let sign = if self.num_is_negative { -1.0 } else { 1.0 };
        sign * (self.num * 10f64.powi(exponent))
    }

    pub fn cur_is_true(&self) -> bool {
        &self.bool_word[..self.bool_wlen] == b"true"
    }

    pub fn next(&mut self, ch: u8) -> RdbNextRes {
        self.ty = RdbTy::Incomplete;
        let r = match self.st {
            St::Idle => self.next_idle(ch),
            St::Key => self.next_key(ch),
            St::Str => self.next_str(ch),
            St::LongStr => self.next_long_str(ch),
            St::Num => self.next_num(ch),
            St::Bool => self.next_bool(ch),
        };
        if r != RdbNextRes::Syntax {
            self.pos += 1;
        }
        r
    }

    fn is_val_expected(&self) -> bool {
        self.got_key && (self.is_in_arr || !self.got_first_val) && !self.expect_colon
    }

    fn next_idle(&mut self, ch: u8) -> RdbNextRes {
        let is_val_expected = self.is_val_expected();

        if ch.is_ascii_digit() || ch == b'-' || ch == b'+' || ch == b'.' {
            if is_val_expected {
                self.set_st(St::Num);
                self.next_num(ch)
            } else {
                RdbNextRes::Syntax
            }
        } else if ch == b':' {
            if self.expect_colon {
                self.expect_colon = false;
                RdbNextRes::Ok
            } else {
                RdbNextRes::Syntax
            }
        } else if ch == b'"' {
            if is_val_expected {
                self.set_st(St::Str);
                RdbNextRes::Ok
            } else {
                RdbNextRes::Syntax
            }
        } else if ch == b'<' {
            if is_val_expected {
                self.set_st(St::LongStr);
                RdbNextRes::Ok
            } else {
                RdbNextRes::Syntax
            }
        } else if ch == b',' {
            self.is_in_arr = true;
            RdbNextRes::Ok
        } else if ch == b'\n' {
            self.is_in_arr = false;
            self.got_key = false;
            self.got_first_val = false;
            RdbNextRes::Ok
        } else if ch == 0 {
            self.is_in_arr = false;
            self.got_key = false;
            self.got_first_val = false;
            RdbNextRes::Fin
        } else if ch == b' ' || ch == b'\t' {
            RdbNextRes::Ok
        } else if !self.got_key {
            self.set_st(St::Key);
            self.next_key(ch)
        } else if is_val_expected {
            self.set_st(St::Bool);
            self.next_bool(ch)
        } else {
            RdbNextRes::Syntax
        }
    }

    fn next_key(&mut self, ch: u8) -> RdbNextRes {
        if ch == b':' || ch == b' ' || ch == b'\t' {
            if self.len > 0 {
                self.str_len = self.len;
                self.ty = RdbTy::Key;
                self.set_st(St::Idle);
                self.expect_colon = ch != b':';
                self.got_key = true;
                self.got_first_val = false;
                self.is_in_arr = false;
                return RdbNextRes::Ok;
            } else {
                return RdbNextRes::Syntax;
            }
        }

        if !(ch.is_ascii_alphanumeric() || ch == b'.' || ch == b'_' || ch == b'-') {
            return RdbNextRes::Syntax;
        }

        if self.len < CAP {
            self.str_out[self.len] = ch;
            self.len += 1;
            RdbNextRes::Ok
        } else {
            RdbNextRes::Syntax
        }
    }

    fn next_str(&mut self, mut ch: u8) -> RdbNextRes {
        if (ch <= 31 || ch >= 127) && ch != b'\t' {
            return RdbNextRes::Syntax;
        }

        if !self.is_escape {
            if ch == b'"' {
                self.str_len = self.len;
                self.ty = RdbTy::Str;
                self.set_st(St::Idle);
                self.got_key = true;
                self.got_first_val = true;
                return RdbNextRes::Ok;
            } else if ch == b'\\' {
                self.is_escape = true;
                return RdbNextRes::Ok;
            }
        } else {
            ch = escape_ch(ch);
            self.is_escape = false;
        }

        if self.len < CAP {
            self.str_out[self.len] = ch;
            self.len += 1;
            RdbNextRes::Ok
        } else {
            RdbNextRes::Syntax
        }
    }

    fn next_long_str(&mut self, mut ch: u8) -> RdbNextRes {
        if (ch <= 31 || ch >= 127) && ch != b'\t' && ch != b'\n' {
            return RdbNextRes::Syntax;
        }

        if !self.is_escape {
            if ch == b'>' {
                if self.len > 0 && self.str_out[self.len - 1] == b'\n' && !self.keep_last_newline
                {
                    self.len -= 1;
                }
                self.str_len = self.len;
                self.ty = RdbTy::Str;
                self.set_st(St::Idle);
                self.got_key = true;
                self.got_first_val = true;
                return RdbNextRes::Ok;
            } else if ch == b'\\' {
                self.is_escape = true;
                self.skip_whitespace = false;
                return RdbNextRes::Ok;
            } else if ch == b' ' || ch == b'\t' || ch == b'\n' {
                if self.skip_whitespace {
                    if ch == b'\n' {
                        self.skip_whitespace = false;
                    }
                    self.keep_last_newline = true;
                    return RdbNextRes::Ok;
                }
            }
            self.keep_last_newline = false;
        } else {
            ch = escape_ch(ch);
            self.is_escape = false;
            self.keep_last_newline = ch == b'\n';
        }

        if self.len < CAP {
            self.str_out[self.len] = ch;
            self.len += 1;
            self.skip_whitespace = false;
            RdbNextRes::Ok
        } else {
            RdbNextRes::Syntax
        }
    }

    fn next_num(&mut self, ch: u8) -> RdbNextRes {
        match self.num_part {
            NumPart::Int => self.next_num_int(ch),
            NumPart::Frac => self.next_num_frac(ch),
            NumPart::Exp => self.next_num_exp(ch),
        }
    }

    fn next_num_int(&mut self, ch: u8) -> RdbNextRes {
        if ch.is_ascii_digit() {
            self.num_got_int_explicit = true;
            if self.num_pos == 0 && ch == b'0' {
                RdbNextRes::Ok
            } else {
                self.num = self.num * 10.0 + (ch - b'0') as f64;
                self.num_pos += 1;
                RdbNextRes::Ok
            }
        } else if ch == b'-' || ch == b'+' {
            if self.num_pos == 0 && !self.num_got_sign {
                self.num_is_negative = ch == b'-';
                self.num_got_sign = true;
                RdbNextRes::Ok
            } else {
                RdbNextRes::Syntax
            }
        } else if ch == b'.' {
            if self.num_got_int_explicit || !self.num_got_sign {
                self.num_pos = 1;
                self.num_part = NumPart::Frac;
                RdbNextRes::Ok
            } else {
                RdbNextRes::Syntax
            }
        } else if ch == b'e' || ch == b'E' {
            if self.num_pos > 0 || !self.num_got_sign {
                self.start_exp();
                RdbNextRes::Ok
            } else {
                RdbNextRes::Syntax
            }
        } else if is_separator(ch) {
            if self.num_pos > 0 || !self.num_got_sign {
                self.finish_num(ch)
            } else {
                RdbNextRes::Syntax
            }
        } else {
            RdbNextRes::Syntax
        }
    }

    fn next_num_frac(&mut self, ch: u8) -> RdbNextRes {
        if ch.is_ascii_digit() {
            self.num += (ch - b'0') as f64 * 10f64.powi(-self.num_pos);
            self.num_pos += 1;
            RdbNextRes::Ok
        } else if ch == b'e' || ch == b'E' {
            if self.num_pos >= 2 {
                self.start_exp();
                RdbNextRes::Ok
            } else {
                RdbNextRes::Syntax
            }
        } else if is_separator(ch) {
            if self.num_pos >= 2 || self.num_got_int_explicit {
                self.finish_num(ch)
            } else {
                RdbNextRes::Syntax
            }
        } else {
            RdbNextRes::Syntax
        }
    }

    fn next_num_exp(&mut self, ch: u8) -> RdbNextRes {
        if ch.is_ascii_digit() {
            self.num_got_int_explicit = true;
            if self.num_pos == 0 && ch == b'0' {
                RdbNextRes::Ok
            } else {
                self.exp = self.exp * 10 + (ch - b'0') as i32;
                self.num_pos += 1;
                RdbNextRes::Ok
            }
        } else if ch == b'-' || ch == b'+' {
            if self.num_pos == 0 && !self.num_got_sign {
                self.exp_is_negative = ch == b'-';
                self.num_got_sign = true;
                RdbNextRes::Ok
            } else {
                RdbNextRes::Syntax
            }
        } else if is_separator(ch) {
            if self.num_pos > 0 {
                self.finish_num(ch)
            } else {
                RdbNextRes::Syntax
            }
        } else {
            RdbNextRes::Syntax
        }
    }

    fn start_exp(&mut self) {
        self.num_pos = 0;
        self.exp = 0;
        self.exp_is_negative = false;
        self.num_got_sign = false;
        self.num_got_int_explicit = false;
        self.num_part = NumPart::Exp;
    }

    fn finish_num(&mut self, ch: u8) -> RdbNextRes {
        self.ty = RdbTy::Num;
        self.set_st(St::Idle);
        self.is_in_arr = ch == b',';
        self.got_key = ch != b'\n';
        self.got_first_val = true;
        if ch == 0 {
            RdbNextRes::Fin
        } else {
            RdbNextRes::Ok
        }
    }

    fn next_bool(&mut self, ch: u8) -> RdbNextRes {
        if is_separator(ch) {
            let word = &self.bool_word[..self.bool_wlen];
            if word == b"true" || word == b"false" {
                self.ty = RdbTy::Bool;
                self.set_st(St::Idle);
                self.is_in_arr = ch == b',';
                self.got_key = ch != b'\n';
                self.got_first_val = true;
                if ch == 0 {
                    RdbNextRes::Fin
                } else {
                    RdbNextRes::Ok
                }
            } else {
                RdbNextRes::Syntax
            }
        } else if self.bool_wlen < BOOL_WORD_CAP {
            self.bool_word[self.bool_wlen] = ch;
            self.bool_wlen += 1;
            RdbNextRes::Ok
        } else {
            RdbNextRes::Syntax
        }
    }

    fn set_st(&mut self, st: St) {
        self.st = st;
        match self.st {
            St::Idle => {
                self.expect_colon = false;
            }
            St::Key => {
                self.is_in_arr = false;
                self.got_key = false;
                self.expect_colon = false;
                self.got_first_val = false;
                self.len = 0;
            }
            St::Str => {
                self.got_first_val = true;
                self.len = 0;
                self.is_escape = false;
            }
            St::LongStr => {
                self.got_first_val = true;
                self.len = 0;
                self.is_escape = false;
                self.skip_whitespace = true;
                self.keep_last_newline = false;
            }
            St::Num => {
                self.got_first_val = true;
                self.num_is_negative = false;
                self.num_got_sign = false;
                self.num_got_int_explicit = false;
                self.num = 0.0;
                self.exp = 0;
                self.exp_is_negative = false;
                self.num_pos = 0;
                self.num_part = NumPart::Int;
            }
            St::Bool => {
                self.got_first_val = true;
                self.bool_wlen = 0;
            }
        }
    }
}

impl<const CAP: usize> Default for RdbReader<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_ch(ch: u8) -> u8 {
    match ch {
        b'n' => b'\n',
        b'r' => b'\r',
        b't' => b'\t',
        other => other,
    }
}

fn is_separator(ch: u8) -> bool {
    ch == b' ' || ch == b'\t' || ch == b',' || ch == b'\n' || ch == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed<const CAP: usize>(r: &mut RdbReader<CAP>, s: &[u8]) -> Vec<(RdbTy, String)> {
        let mut out = Vec::new();
        for &ch in s {
            let res = r.next(ch);
            assert_ne!(res, RdbNextRes::Syntax, "unexpected syntax error");
            if r.cur_ty() != RdbTy::Incomplete {
                let v = match r.cur_ty() {
                    RdbTy::Num => r.cur_num().to_string(),
                    RdbTy::Bool => r.cur_is_true().to_string(),
                    _ => r.cur_str().to_string(),
                };
                out.push((r.cur_ty(), v));
            }
            if res == RdbNextRes::Fin {
                break;
            }
        }
        out
    }

    #[test]
    fn key_and_number() {
        let mut r: RdbReader<64> = RdbReader::new();
        let events = feed(&mut r, b"id: 228337\n\0");
        assert_eq!(events[0], (RdbTy::Key, "id".to_string()));
        assert_eq!(events[1].0, RdbTy::Num);
        assert!((events[1].1.parse::<f64>().unwrap() - 228337.0).abs() < 1e-6);
    }

    #[test]
    fn quoted_string_with_escapes() {
        let mut r: RdbReader<64> = RdbReader::new();
        let events = feed(&mut r, b"key: \"hello\\tworld!\\n\"\n\0");
        assert_eq!(events[0], (RdbTy::Key, "key".to_string()));
        assert_eq!(events[1], (RdbTy::Str, "hello\tworld!\n".to_string()));
    }

    #[test]
    fn long_string_strips_trailing_newline_before_close() {
        let mut r: RdbReader<64> = RdbReader::new();
        let events = feed(&mut r, b"multiline: <blah\nblah>\n\0");
        assert_eq!(events[1], (RdbTy::Str, "blah\nblah".to_string()));
    }

    #[test]
    fn list_of_strings_and_numbers() {
        let mut r: RdbReader<64> = RdbReader::new();
        let events = feed(&mut r, b"numbers: 1, 2, -3.5\n\0");
        assert_eq!(events.len(), 4);
        assert!((events[3].1.parse::<f64>().unwrap() + 3.5).abs() < 1e-6);
    }

    #[test]
    fn bools() {
        let mut r: RdbReader<64> = RdbReader::new();
        let events = feed(&mut r, b"bools: true,false\n\0");
        assert_eq!(events[1], (RdbTy::Bool, "true".to_string()));
        assert_eq!(events[2], (RdbTy::Bool, "false".to_string()));
    }

    #[test]
    fn colon_without_expecting_one_is_syntax_error() {
        let mut r: RdbReader<64> = RdbReader::new();
        assert_eq!(r.next(b':'), RdbNextRes::Syntax);
    }
}
