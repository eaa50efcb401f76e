//! Selector grammar: `(op,path,value[,value...])[;(op,path,value...)...]`.
//!
//! Unquoted values run up to the next `,` or `)`; quoted values use `'` with `''` for a literal
//! quote. Terms combine with AND.

use std::fmt;
use std::str::FromStr;

use o2ims_core::{O2Error, O2Result};
use tracing::debug;

use crate::path::{Cursor, Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Cont,
    Ncont,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
}

impl Operator {
    pub const ALL: [Operator; 10] = [
        Operator::Eq, Operator::Neq, Operator::Cont, Operator::Ncont, Operator::Gt,
        Operator::Gte, Operator::Lt, Operator::Lte, Operator::In, Operator::Nin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Cont => "cont",
            Self::Ncont => "ncont",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Nin => "nin",
        }
    }

    /// Operators that compare against exactly one value.
    pub fn single_valued(&self) -> bool {
        matches!(self, Self::Eq | Self::Neq | Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Operator {
    type Err = O2Error;

    fn from_str(s: &str) -> O2Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| O2Error::Validation(format!(
                "unknown operator '{}', valid operators are 'cont', 'eq', 'gt', 'gte', 'in', 'lt', 'lte', 'ncont', 'neq' and 'nin'",
                s
            )))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub operator: Operator,
    pub path: Path,
    pub values: Vec<String>,
}

impl Term {
    pub fn new(operator: Operator, path: Path, values: Vec<String>) -> O2Result<Self> {
        let t = Self { operator, path, values };
        t.check_arity()?;
        Ok(t)
    }

    pub(crate) fn check_arity(&self) -> O2Result<()> {
        if self.operator.single_valued() && self.values.len() != 1 {
            return Err(O2Error::Validation(format!(
                "the '{}' operator expects exactly one value, but got {}", self.operator, self.values.len()
            )));
        }
        if self.values.is_empty() {
            return Err(O2Error::Validation(format!("the '{}' operator expects at least one value", self.operator)));
        }
        Ok(())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{}", self.operator, self.path)?;
        for v in &self.values {
            f.write_str(",")?;
            f.write_str(&quote_value(v))?;
        }
        f.write_str(")")
    }
}

/// Conjunction of terms. An empty selector accepts everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector {
    pub terms: Vec<Term>,
}

impl Selector {
    pub fn is_empty(&self) -> bool { self.terms.is_empty() }

    /// Append the terms of `other`; the result accepts what both accept.
    pub fn and(mut self, other: Selector) -> Self {
        self.terms.extend(other.terms);
        self
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, t) in self.terms.iter().enumerate() {
            if i > 0 { f.write_str(";")?; }
            write!(f, "{}", t)?;
        }
        Ok(())
    }
}

impl FromStr for Selector {
    type Err = O2Error;
    fn from_str(s: &str) -> O2Result<Self> { parse_selector(s) }
}

fn quote_value(v: &str) -> String {
    let plain = !v.is_empty()
        && !v.starts_with(char::is_whitespace)
        && !v.ends_with(char::is_whitespace)
        && !v.contains(&[',', '(', ')', ';', '\''][..]);
    if plain { return v.to_string(); }
    format!("'{}'", v.replace('\'', "''"))
}

/// Parse a selector expression.
pub fn parse_selector(src: &str) -> O2Result<Selector> {
    let mut cur = Cursor::new(src);
    let mut terms = Vec::new();
    loop {
        cur.skip_ws();
        terms.push(term(&mut cur)?);
        cur.skip_ws();
        match cur.bump() {
            None => break,
            Some(';') => continue,
            Some(c) => return Err(cur.error(&format!("unexpected character '{}' while expecting ';'", c))),
        }
    }
    let sel = Selector { terms };
    debug!(selector = %sel, "selector parsed");
    Ok(sel)
}

/// Parse every expression and AND them together, as for repeated `filter` parameters.
pub fn parse_selectors<I, S>(inputs: I) -> O2Result<Option<Selector>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Option<Selector> = None;
    for input in inputs {
        let sel = parse_selector(input.as_ref())?;
        out = Some(match out { Some(acc) => acc.and(sel), None => sel });
    }
    Ok(out)
}

fn term(cur: &mut Cursor<'_>) -> O2Result<Term> {
    cur.expect('(')?;
    cur.skip_ws();
    let mut op_text = String::new();
    while let Some(c) = cur.peek() {
        if !c.is_ascii_alphabetic() { break; }
        op_text.push(c);
        cur.bump();
    }
    let operator: Operator = op_text.parse().map_err(|e: O2Error| match e {
        O2Error::Validation(msg) => cur.error(&msg),
        other => other,
    })?;
    cur.skip_ws();
    cur.expect(',')?;
    cur.skip_ws();
    let path = cur.path()?;
    cur.skip_ws();
    cur.expect(',')?;
    let mut values = Vec::new();
    loop {
        values.push(value(cur)?);
        match cur.bump() {
            Some(',') => continue,
            Some(')') => break,
            Some(c) => return Err(cur.error(&format!("unexpected character '{}' after value", c))),
            None => return Err(cur.error("unterminated term, expected ')'")),
        }
    }
    let t = Term { operator, path, values };
    t.check_arity().map_err(|e| match e {
        O2Error::Validation(msg) => cur.error(&msg),
        other => other,
    })?;
    Ok(t)
}

/// Value up to, not including, the next `,` or `)`.
fn value(cur: &mut Cursor<'_>) -> O2Result<String> {
    cur.skip_ws();
    if cur.peek() == Some('\'') {
        cur.bump();
        let mut out = String::new();
        loop {
            match cur.bump() {
                Some('\'') if cur.peek() == Some('\'') => { cur.bump(); out.push('\''); }
                Some('\'') => break,
                Some(c) => out.push(c),
                None => return Err(cur.error("unterminated quoted value")),
            }
        }
        cur.skip_ws();
        return Ok(out);
    }
    let mut out = String::new();
    while let Some(c) = cur.peek() {
        if c == ',' || c == ')' { break; }
        out.push(c);
        cur.bump();
    }
    let trimmed = out.trim();
    if trimmed.is_empty() { return Err(cur.error("missing value")); }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Path { s.parse().unwrap() }

    #[test]
    fn parses_single_term() {
        let sel = parse_selector("(eq,MyField,myvalue)").unwrap();
        assert_eq!(sel.terms, vec![Term { operator: Operator::Eq, path: p("MyField"), values: vec!["myvalue".into()] }]);
    }

    #[test]
    fn parses_multi_values_and_multiple_terms() {
        let sel = parse_selector("(in,a/b,x,y,z);(NEQ, c.d , 'it''s, here')").unwrap();
        assert_eq!(sel.terms.len(), 2);
        assert_eq!(sel.terms[0].operator, Operator::In);
        assert_eq!(sel.terms[0].values, vec!["x", "y", "z"]);
        assert_eq!(sel.terms[1].operator, Operator::Neq);
        assert_eq!(sel.terms[1].path, p("c/d"));
        assert_eq!(sel.terms[1].values, vec!["it's, here"]);
    }

    #[test]
    fn rejects_unknown_operator_and_wrong_arity() {
        let err = parse_selector("(like,a,b)").unwrap_err();
        assert!(matches!(&err, O2Error::Validation(m) if m.contains("unknown operator 'like'")), "{:?}", err);
        assert!(parse_selector("(eq,a,b,c)").is_err());
        assert!(parse_selector("(gt,a,)").is_err());
        assert!(parse_selector("(eq,,b)").is_err());
        assert!(parse_selector("(eq,a,b").is_err());
        assert!(parse_selector("(eq,a,'b)").is_err());
        assert!(parse_selector("(eq,a,b)x").is_err());
    }

    #[test]
    fn display_reparses_to_same_selector() {
        let src = "(cont,extensions/note,'a,b');(in,x,1,2);(eq,y,'')";
        let sel = parse_selector(src).unwrap();
        let again = parse_selector(&sel.to_string()).unwrap();
        assert_eq!(sel, again);
    }

    #[test]
    fn repeated_filters_are_anded() {
        let sel = parse_selectors(["(eq,a,1)", "(eq,b,2);(eq,c,3)"]).unwrap().unwrap();
        assert_eq!(sel.terms.len(), 3);
        assert_eq!(parse_selectors(Vec::<String>::new()).unwrap(), None);
    }
}
