//! Streaming, allocation-free JSON reader.
//!
//! `RjsonReader` is fed one byte at a time through [`RjsonReader::next`] and
//! reports what it parsed through a small set of accessors (`cur_ty`,
//! `cur_str`, `cur_num`, `cur_is_true`). There is no tree, no heap
//! allocation, and no backtracking beyond a single byte of lookahead used
//! exclusively to notice where a number ends (see §4.4.2).
//!
//! Grounded on the original `rjson.c` push parser; translated state for
//! state rather than reshaped, since the lookahead handling and the exact
//! double-accumulation arithmetic for numbers are both externally
//! observable (round-trip laws in the testable-properties section depend on
//! bit-for-bit reproduction of the accumulator).

const MAX_DEPTH: usize = 24;

/// Result of feeding one byte to [`RjsonReader::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextResult {
    /// Byte accepted; parsing continues. Check [`RjsonReader::cur_ty`] for
    /// whether a value completed.
    Ok,
    /// The top-level object closed. The document is complete.
    Fin,
    /// The byte violates the grammar. [`RjsonReader::pos`] locates it.
    Syntax,
}

/// What [`RjsonReader::cur_ty`] reports after a call to `next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Incomplete,
    Str,
    Num,
    Bool,
    Null,
    ObjStart,
    ObjEnd,
    ArrStart,
    ArrEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Obj,
    Arr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WantKey,
    WantColon,
    Str,
    Num,
    True,
    False,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumPart {
    LeadingZero,
    Int,
    Frac,
    Exp,
}

/// A streaming JSON reader with a caller-sized string buffer of `CAP` bytes.
pub struct RjsonReader<const CAP: usize> {
    str_buf: [u8; CAP],
    str_len: usize,
    is_key: bool,
    is_escape: bool,

    num: f64,
    digit_pos: u32,
    is_neg: bool,
    exp: i32,
    num_part: NumPart,

    word_pos: usize,
    bool_is_true: bool,

    st: State,
    lvls: [Level; MAX_DEPTH],
    lvls_len: usize,

    buffered_ch: Option<u8>,
    cur: ValueType,
    is_val_expected: bool,
    pos: usize,
}

impl<const CAP: usize> Default for RjsonReader<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> RjsonReader<CAP> {
    pub fn new() -> Self {
        RjsonReader {
            str_buf: [0; CAP],
            str_len: 0,
            is_key: false,
            is_escape: false,
            num: 0.0,
            digit_pos: 0,
            is_neg: false,
            exp: 0,
            num_part: NumPart::Int,
            word_pos: 0,
            bool_is_true: false,
            st: State::Idle,
            lvls: [Level::Obj; MAX_DEPTH],
            lvls_len: 0,
            buffered_ch: None,
            cur: ValueType::Incomplete,
            // Otherwise the top-level `{` would be rejected as "no value
            // expected".
            is_val_expected: true,
            pos: 0,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn cur_ty(&self) -> ValueType {
        self.cur
    }

    pub fn cur_str(&self) -> &str {
        std::str::from_utf8(&self.str_buf[..self.str_len]).unwrap_or("")
    }

    pub fn cur_num(&self) -> f64 {
        self.num
    }

    pub fn cur_is_true(&self) -> bool {
        self.bool_is_true
    }

    /// Feeds one byte. Feed `b'\0'` to terminate the document.
    pub fn next(&mut self, mut ch: u8) -> NextResult {
        loop {
            let mut processed_buffered = false;
            if let Some(b) = self.buffered_ch {
                let prev_ch = ch;
                ch = b;
                self.buffered_ch = Some(prev_ch);
                processed_buffered = true;
            }

            if ch == 0 {
                return if self.lvl() == None_ {
                    NextResult::Fin
                } else {
                    NextResult::Syntax
                };
            }

            let r = match self.st {
                State::Idle => self.next_idle(ch),
                State::WantKey => self.next_want_key(ch),
                State::WantColon => self.next_want_colon(ch),
                State::Str => self.next_str(ch),
                State::Num => self.next_num(ch),
                State::True => self.next_bool(ch, b"true"),
                State::False => self.next_bool(ch, b"false"),
                State::Null => self.next_null(ch),
            };

            if processed_buffered || self.buffered_ch.is_none() {
                if r != NextResult::Syntax {
                    self.pos += 1;
                }
            }

            if let Some(b) = self.buffered_ch {
                if r == NextResult::Ok && self.cur == ValueType::Incomplete {
                    // Nothing to report; process the buffered byte now so we
                    // don't keep falling further behind.
                    self.buffered_ch = None;
                    ch = b;
                    continue;
                } else if r == NextResult::Ok && b == 0 {
                    // e.g. `{"a": [42]\0` — `]` is emitted at the `\0`
                    // lookahead step, so this is the only chance to notice
                    // the missing `}`.
                    if self.lvl() != None_ {
                        return NextResult::Syntax;
                    }
                }
            }

            return r;
        }
    }

    fn lvl(&self) -> Option<Level> {
        if self.lvls_len == 0 {
            None
        } else {
            Some(self.lvls[self.lvls_len - 1])
        }
    }

    fn push_lvl(&mut self, lvl: Level) {
        if self.lvls_len == MAX_DEPTH {
            bug!("rjson: max nesting depth ({MAX_DEPTH}) reached");
        }
        self.lvls[self.lvls_len] = lvl;
        self.lvls_len += 1;
    }

    fn pop_lvl(&mut self) {
        if self.lvls_len == 0 {
            bug!("rjson: pop_lvl with no levels");
        }
        self.lvls_len -= 1;
    }

    fn set_st(&mut self, st: State) {
        if self.st != st {
            match st {
                State::Str => {
                    self.str_len = 0;
                    self.is_escape = false;
                    self.is_key = false;
                }
                State::Num => {
                    self.num = 0.0;
                    self.digit_pos = 0;
                    self.is_neg = false;
                    self.exp = 0;
                    self.num_part = NumPart::Int;
                }
                State::True => {
                    self.bool_is_true = true;
                    self.word_pos = 0;
                }
                State::False => {
                    self.bool_is_true = false;
                    self.word_pos = 0;
                }
                State::Null => {
                    self.word_pos = 0;
                }
                State::Idle | State::WantKey | State::WantColon => {}
            }
        }
        self.st = st;
    }

    fn next_idle(&mut self, ch: u8) -> NextResult {
        self.cur = ValueType::Incomplete;

        if is_whitespace(ch) {
            return NextResult::Ok;
        }

        if self.lvl().is_none() && ch != b'{' {
            return NextResult::Syntax;
        }

        if self.is_val_expected {
            if ch == b't' {
                self.set_st(State::True);
                return self.next_bool(ch, b"true");
            } else if ch == b'f' {
                self.set_st(State::False);
                return self.next_bool(ch, b"false");
            } else if ch == b'n' {
                self.set_st(State::Null);
                return self.next_null(ch);
            } else if is_num_start(ch) {
                self.set_st(State::Num);
                return self.next_num(ch);
            }
        }

        match ch {
            b'{' => {
                if self.is_val_expected && self.lvls_len < MAX_DEPTH {
                    self.is_val_expected = true;
                    self.push_lvl(Level::Obj);
                    self.set_st(State::WantKey);
                    self.cur = ValueType::ObjStart;
                    NextResult::Ok
                } else {
                    NextResult::Syntax
                }
            }
            b'[' => {
                if self.is_val_expected && self.lvls_len < MAX_DEPTH {
                    self.push_lvl(Level::Arr);
                    self.set_st(State::Idle);
                    self.cur = ValueType::ArrStart;
                    self.is_val_expected = true;
                    NextResult::Ok
                } else {
                    NextResult::Syntax
                }
            }
            b'}' => {
                if self.lvl() == Some(Level::Obj) {
                    if !self.is_val_expected {
                        self.pop_lvl();
                        self.set_st(State::Idle);
                        self.cur = ValueType::ObjEnd;
                        if self.lvl().is_none() {
                            NextResult::Fin
                        } else {
                            NextResult::Ok
                        }
                    } else {
                        NextResult::Syntax
                    }
                } else {
                    NextResult::Syntax
                }
            }
            b']' => {
                if self.lvl() == Some(Level::Arr) {
                    if !self.is_val_expected {
                        self.pop_lvl();
                        self.set_st(State::Idle);
                        self.cur = ValueType::ArrEnd;
                        NextResult::Ok
                    } else {
                        NextResult::Syntax
                    }
                } else {
                    NextResult::Syntax
                }
            }
            b'"' => {
                if self.is_val_expected {
                    self.set_st(State::Str);
                    self.cur = ValueType::Incomplete;
                    self.is_val_expected = false;
                    NextResult::Ok
                } else {
                    NextResult::Syntax
                }
            }
            b',' => {
                if !self.is_val_expected {
                    self.is_val_expected = true;
                    match self.lvl() {
                        Some(Level::Obj) => {
                            self.set_st(State::WantKey);
                            self.cur = ValueType::Incomplete;
                            NextResult::Ok
                        }
                        Some(Level::Arr) => {
                            self.cur = ValueType::Incomplete;
                            NextResult::Ok
                        }
                        None => NextResult::Syntax,
                    }
                } else {
                    NextResult::Syntax
                }
            }
            _ => NextResult::Syntax,
        }
    }

    fn next_want_key(&mut self, ch: u8) -> NextResult {
        if is_whitespace(ch) {
            return NextResult::Ok;
        }

        match ch {
            b'"' => {
                self.set_st(State::Str);
                self.is_key = true;
                self.cur = ValueType::Incomplete;
                NextResult::Ok
            }
            b'}' => {
                self.set_st(State::Idle);
                self.pop_lvl();
                self.cur = ValueType::ObjEnd;
                self.is_val_expected = false;
                if self.lvl().is_none() {
                    NextResult::Fin
                } else {
                    NextResult::Ok
                }
            }
            _ => NextResult::Syntax,
        }
    }

    fn next_want_colon(&mut self, ch: u8) -> NextResult {
        if is_whitespace(ch) {
            return NextResult::Ok;
        }

        match ch {
            b':' => {
                self.set_st(State::Idle);
                self.cur = ValueType::Incomplete;
                self.is_val_expected = true;
                NextResult::Ok
            }
            _ => NextResult::Syntax,
        }
    }

    fn next_str(&mut self, mut ch: u8) -> NextResult {
        self.cur = ValueType::Incomplete;

        if ch <= 31 || ch >= 127 {
            return NextResult::Syntax;
        }

        if self.is_escape {
            match escape_byte(ch) {
                Some(EscapeOutcome::Resolved(escaped)) => {
                    self.is_escape = false;
                    ch = escaped;
                }
                Some(EscapeOutcome::Utf16) => return NextResult::Syntax,
                None => return NextResult::Syntax,
            }
        } else if ch == b'\\' {
            self.is_escape = true;
            return NextResult::Ok;
        } else if ch == b'"' {
            self.cur = ValueType::Str;
            self.is_val_expected = false;
            if self.is_key {
                self.set_st(State::WantColon);
            } else {
                self.set_st(State::Idle);
            }
            return NextResult::Ok;
        }

        if self.str_len == CAP {
            return NextResult::Syntax;
        }
        self.str_buf[self.str_len] = ch;
        self.str_len += 1;
        NextResult::Ok
    }

    fn next_num(&mut self, ch: u8) -> NextResult {
        if is_whitespace(ch) || ch == b'}' || ch == b']' || ch == b',' {
            if self.digit_pos > 0 {
                if self.num_part == NumPart::Exp {
                    self.num *= 10f64.powi(self.exp);
                }
                self.cur = ValueType::Num;
                if self.buffered_ch.is_some() {
                    bug!("rjson: buffered_ch should've been consumed before a number");
                }
                self.buffered_ch = Some(ch);
                self.is_val_expected = false;
                self.set_st(State::Idle);
                return NextResult::Ok;
            } else {
                return NextResult::Syntax;
            }
        }

        if self.num_part == NumPart::Int && ch == b'0' && self.digit_pos == 0 {
            self.num_part = NumPart::LeadingZero;
            return NextResult::Ok;
        }

        match self.num_part {
            NumPart::LeadingZero => {
                if ch == b'.' {
                    self.num_part = NumPart::Frac;
                    NextResult::Ok
                } else {
                    NextResult::Syntax
                }
            }
            NumPart::Int => {
                if ch == b'-' {
                    if self.digit_pos == 0 {
                        self.is_neg = true;
                        NextResult::Ok
                    } else {
                        NextResult::Syntax
                    }
                } else if ch == b'.' {
                    if self.digit_pos > 0 {
                        self.digit_pos = 0;
                        self.num_part = NumPart::Frac;
                        NextResult::Ok
                    } else {
                        NextResult::Syntax
                    }
                } else if ch == b'e' || ch == b'E' {
                    if self.digit_pos > 0 {
                        self.digit_pos = 0;
                        self.num_part = NumPart::Exp;
                        NextResult::Ok
                    } else {
                        NextResult::Syntax
                    }
                } else if ch.is_ascii_digit() {
                    self.num *= 10.0;
                    self.num += f64::from(ch - b'0') * if self.is_neg { -1.0 } else { 1.0 };
                    self.digit_pos += 1;
                    NextResult::Ok
                } else {
                    NextResult::Syntax
                }
            }
            NumPart::Frac => {
                if ch == b'e' || ch == b'E' {
                    if self.digit_pos > 0 {
                        self.digit_pos = 0;
                        self.is_neg = false;
                        self.exp = 0;
                        self.num_part = NumPart::Exp;
                        NextResult::Ok
                    } else {
                        NextResult::Syntax
                    }
                } else if ch.is_ascii_digit() {
                    self.num += f64::from(ch - b'0')
                        * 10f64.powi(-(self.digit_pos as i32 + 1))
                        * if self.is_neg { -1.0 } else { 1.0 };
                    self.digit_pos += 1;
                    NextResult::Ok
                } else {
                    NextResult::Syntax
                }
            }
            NumPart::Exp => {
                if ch == b'+' {
                    if self.digit_pos == 0 {
                        self.is_neg = false;
                        NextResult::Ok
                    } else {
                        NextResult::Syntax
                    }
                } else if ch == b'-' {
                    if self.digit_pos == 0 {
                        self.is_neg = true;
                        NextResult::Ok
                    } else {
                        NextResult::Syntax
                    }
                } else if ch.is_ascii_digit() {
                    self.exp *= 10;
                    self.exp += i32::from(ch - b'0') * if self.is_neg { -1 } else { 1 };
                    self.digit_pos += 1;
                    NextResult::Ok
                } else {
                    NextResult::Syntax
                }
            }
        }
    }

    fn next_bool(&mut self, ch: u8, word: &'static [u8]) -> NextResult {
        if ch != word[self.word_pos] {
            return NextResult::Syntax;
        }
        if self.word_pos == word.len() - 1 {
            self.cur = ValueType::Bool;
            self.is_val_expected = false;
            self.set_st(State::Idle);
        } else {
            self.word_pos += 1;
        }
        NextResult::Ok
    }

    fn next_null(&mut self, ch: u8) -> NextResult {
        const WORD: &[u8] = b"null";
        if ch != WORD[self.word_pos] {
            return NextResult::Syntax;
        }
        if self.word_pos == WORD.len() - 1 {
            self.cur = ValueType::Null;
            self.is_val_expected = false;
            self.set_st(State::Idle);
        } else {
            self.word_pos += 1;
        }
        NextResult::Ok
    }
}

// `None` shadowed by `Option::None` above reads oddly at a glance; spell it
// out once so `lvl() == None_` is unambiguous at call sites.
#[allow(non_upper_case_globals)]
const None_: Option<Level> = Option::None;

enum EscapeOutcome {
    Resolved(u8),
    Utf16,
}

fn escape_byte(ch: u8) -> Option<EscapeOutcome> {
    match ch {
        b'u' => Some(EscapeOutcome::Utf16),
        b'"' => Some(EscapeOutcome::Resolved(b'"')),
        b'\\' => Some(EscapeOutcome::Resolved(b'\\')),
        b'/' => Some(EscapeOutcome::Resolved(b'/')),
        b'b' => Some(EscapeOutcome::Resolved(0x08)),
        b'f' => Some(EscapeOutcome::Resolved(0x0c)),
        b'n' => Some(EscapeOutcome::Resolved(b'\n')),
        b'r' => Some(EscapeOutcome::Resolved(b'\r')),
        b't' => Some(EscapeOutcome::Resolved(b'\t')),
        _ => None,
    }
}

fn is_whitespace(ch: u8) -> bool {
    matches!(ch, b' ' | b'\n' | b'\r' | b'\t')
}

fn is_num_start(ch: u8) -> bool {
    ch.is_ascii_digit() || ch == b'-'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(r: &mut RjsonReader<64>, s: &str) -> Vec<(NextResult, ValueType)> {
        let mut out = Vec::new();
        for &b in s.as_bytes() {
            let res = r.next(b);
            out.push((res, r.cur_ty()));
            if res == NextResult::Fin {
                break;
            }
        }
        out
    }

    #[test]
    fn empty_object() {
        let mut r: RjsonReader<64> = RjsonReader::new();
        assert_eq!(r.next(b'{'), NextResult::Ok);
        assert_eq!(r.cur_ty(), ValueType::ObjStart);
        assert_eq!(r.next(b'}'), NextResult::Fin);
        assert_eq!(r.cur_ty(), ValueType::ObjEnd);
    }

    #[test]
    fn nested_values() {
        let mut r: RjsonReader<64> = RjsonReader::new();
        let events = feed(&mut r, "{\"a\":[1,2,3]}\0");
        let tys: Vec<ValueType> = events.iter().map(|(_, t)| *t).collect();
        assert!(tys.contains(&ValueType::ObjStart));
        assert!(tys.contains(&ValueType::ArrStart));
        assert!(tys.contains(&ValueType::ArrEnd));
        assert!(tys.contains(&ValueType::ObjEnd));
        assert_eq!(events.last().unwrap().0, NextResult::Fin);
    }

    #[test]
    fn rejects_leading_zero() {
        let mut r: RjsonReader<64> = RjsonReader::new();
        for &b in b"{\"a\":0" {
            assert_eq!(r.next(b), NextResult::Ok);
        }
        assert_eq!(r.next(b'1'), NextResult::Syntax);
    }

    #[test]
    fn trailing_comma_before_close_is_syntax_error() {
        let mut r: RjsonReader<64> = RjsonReader::new();
        for &b in b"{\"a\":1," {
            assert_eq!(r.next(b), NextResult::Ok);
        }
        assert_eq!(r.next(b'}'), NextResult::Syntax);
    }

    #[test]
    fn depth_beyond_24_is_syntax_error() {
        // `{` opens depth 1; 23 further `[` reach depth 24 (the bound).
        // The 24th `[` would push depth 25, which is untrusted input
        // overflowing a fixed-capacity stack, so it is a syntax error at
        // the `[` rather than a panic.
        let mut r: RjsonReader<64> = RjsonReader::new();
        assert_eq!(r.next(b'{'), NextResult::Ok);
        assert_eq!(r.next(b'"'), NextResult::Ok);
        assert_eq!(r.next(b'"'), NextResult::Ok);
        assert_eq!(r.next(b':'), NextResult::Ok);
        for _ in 0..23 {
            assert_eq!(r.next(b'['), NextResult::Ok);
        }
        assert_eq!(r.next(b'['), NextResult::Syntax);
    }

    #[test]
    fn string_buffer_overflow_is_syntax() {
        let mut r: RjsonReader<2> = RjsonReader::new();
        assert_eq!(r.next(b'{'), NextResult::Ok);
        assert_eq!(r.next(b'"'), NextResult::Ok);
        assert_eq!(r.next(b'a'), NextResult::Ok);
        assert_eq!(r.next(b'b'), NextResult::Ok);
        assert_eq!(r.next(b'c'), NextResult::Syntax);
    }

    #[test]
    fn negative_exponent_number() {
        let mut r: RjsonReader<64> = RjsonReader::new();
        for &b in b"{\"a\":420228e-03" {
            assert_eq!(r.next(b), NextResult::Ok);
        }
        assert_eq!(r.next(b'}'), NextResult::Ok);
        assert_eq!(r.cur_ty(), ValueType::Num);
        assert!((r.cur_num() - 420.228).abs() < 1e-6);
    }
}
