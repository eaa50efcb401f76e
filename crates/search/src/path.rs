//! Field paths: syntax, parsing and lookup.
//!
//! Syntax: segments separated by `/` or `.`, each optionally followed by `[n]` indexes,
//! several paths separated by `,`. Escapes inside names: `~0` `~`, `~1` `/`, `~a` `,`, `~b` `.`.

use std::fmt;
use std::str::FromStr;

use o2ims_core::{O2Error, O2Result, Object};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Path(pub Vec<Segment>);

impl Path {
    /// Path made only of field names.
    pub fn fields<S: AsRef<str>>(names: &[S]) -> Self {
        Self(names.iter().map(|n| Segment::Field(n.as_ref().to_string())).collect())
    }

    pub fn segments(&self) -> &[Segment] { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                Segment::Field(name) => {
                    if i > 0 { f.write_str("/")?; }
                    f.write_str(&escape_name(name))?;
                }
                Segment::Index(n) => write!(f, "[{}]", n)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = O2Error;

    fn from_str(s: &str) -> O2Result<Self> {
        let mut cur = Cursor::new(s);
        cur.skip_ws();
        let path = cur.path()?;
        cur.skip_ws();
        match cur.peek() {
            None => Ok(path),
            Some(c) => Err(cur.error(&format!("unexpected character '{}' after path", c))),
        }
    }
}

pub(crate) fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '~' => out.push_str("~0"),
            '/' => out.push_str("~1"),
            ',' => out.push_str("~a"),
            '.' => out.push_str("~b"),
            c => out.push(c),
        }
    }
    out
}

/// Parse one or more comma separated path lists, as found in repeated `fields` parameters.
pub fn parse_paths<I, S>(inputs: I) -> O2Result<Vec<Path>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for input in inputs {
        let mut cur = Cursor::new(input.as_ref());
        loop {
            cur.skip_ws();
            out.push(cur.path()?);
            cur.skip_ws();
            match cur.bump() {
                None => break,
                Some(',') => continue,
                Some(c) => return Err(cur.error(&format!("unexpected character '{}' while expecting ','", c))),
            }
        }
    }
    Ok(out)
}

/// Resolve a path inside a JSON value. Missing keys, out of range indexes and type
/// mismatches along the way all resolve to `None`.
pub fn lookup_value<'a>(path: &Path, value: &'a JsonValue) -> Option<&'a JsonValue> {
    walk(path.segments(), value)
}

fn walk<'a>(segs: &[Segment], value: &'a JsonValue) -> Option<&'a JsonValue> {
    let mut cur = value;
    for seg in segs {
        cur = match (seg, cur) {
            (Segment::Field(name), JsonValue::Object(map)) => map.get(name)?,
            (Segment::Index(i), JsonValue::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Resolve a path inside an object. See [`lookup_value`].
pub fn lookup<'a>(path: &Path, object: &'a Object) -> Option<&'a JsonValue> {
    let (first, rest) = path.segments().split_first()?;
    let start = match first {
        Segment::Field(name) => object.get(name)?,
        Segment::Index(_) => return None,
    };
    walk(rest, start)
}

// ---------------- cursor shared with the selector parser ----------------

pub(crate) struct Cursor<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(src: &'a str) -> Self { Self { src, chars: src.chars().collect(), pos: 0 } }

    pub(crate) fn peek(&self) -> Option<char> { self.chars.get(self.pos).copied() }

    pub(crate) fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    pub(crate) fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) { self.pos += 1; }
    }

    pub(crate) fn expect(&mut self, want: char) -> O2Result<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.error(&format!("expected '{}' but found '{}'", want, c))),
            None => Err(self.error(&format!("expected '{}' but reached end of input", want))),
        }
    }

    pub(crate) fn error(&self, msg: &str) -> O2Error {
        O2Error::Validation(format!("syntax error in '{}' at offset {}: {}", self.src, self.pos, msg))
    }

    fn is_name_start(c: char) -> bool { c.is_alphabetic() || c == '_' || c == '@' || c == '~' }
    fn is_name_char(c: char) -> bool { c.is_alphanumeric() || matches!(c, '_' | '-' | '@' | '~') }

    /// Name with escapes decoded.
    pub(crate) fn name(&mut self) -> O2Result<String> {
        match self.peek() {
            Some(c) if Self::is_name_start(c) => {}
            Some(c) => return Err(self.error(&format!("unexpected character '{}' while expecting start of identifier", c))),
            None => return Err(self.error("expected identifier but reached end of input")),
        }
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !Self::is_name_char(c) { break; }
            self.pos += 1;
            if c != '~' { out.push(c); continue; }
            match self.bump() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                Some('a') => out.push(','),
                Some('b') => out.push('.'),
                Some(e) => return Err(self.error(&format!("unknown escape sequence '~{}', valid ones are '~0', '~1', '~a' and '~b'", e))),
                None => return Err(self.error("incomplete escape sequence")),
            }
        }
        Ok(out)
    }

    fn index(&mut self) -> O2Result<usize> {
        self.expect('[')?;
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) { self.pos += 1; }
        if start == self.pos { return Err(self.error("expected array index digits")); }
        let digits: String = self.chars[start..self.pos].iter().collect();
        let n = digits.parse::<usize>().map_err(|e| self.error(&format!("bad array index: {}", e)))?;
        self.expect(']')?;
        Ok(n)
    }

    /// One path; stops before any character that can't continue it.
    pub(crate) fn path(&mut self) -> O2Result<Path> {
        let mut segs = Vec::new();
        loop {
            segs.push(Segment::Field(self.name()?));
            while self.peek() == Some('[') { segs.push(Segment::Index(self.index()?)); }
            match self.peek() {
                Some('/') | Some('.') => { self.pos += 1; }
                _ => return Ok(Path(segs)),
            }
        }
    }
}
