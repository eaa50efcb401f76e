//! `Link` header (RFC 5988) parsing and rendering, enough to replace the `next` relation.

use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub uri: String,
    /// Parameters in header order, `rel` included.
    pub params: Vec<(String, String)>,
}

impl Link {
    pub fn new(uri: impl Into<String>, rel: &str) -> Self {
        Self { uri: uri.into(), params: vec![("rel".into(), rel.into())] }
    }

    pub fn rel(&self) -> Option<&str> {
        self.params.iter().find(|(k, _)| k.eq_ignore_ascii_case("rel")).map(|(_, v)| v.as_str())
    }
}

/// Parse every link in the given header values. Malformed pieces are skipped.
pub fn parse_links<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<Link> {
    let mut out = Vec::new();
    for value in values {
        let mut it = value.chars().peekable();
        loop {
            skip(&mut it, |c| c.is_whitespace() || c == ',');
            match it.next() {
                Some('<') => {}
                Some(_) => { skip(&mut it, |c| c != ','); continue; }
                None => break,
            }
            let uri: String = take(&mut it, |c| c != '>');
            if it.next() != Some('>') { break; }
            let mut params = Vec::new();
            loop {
                skip(&mut it, char::is_whitespace);
                if it.peek() != Some(&';') { break; }
                it.next();
                skip(&mut it, char::is_whitespace);
                let name: String = take(&mut it, |c| !matches!(c, '=' | ';' | ','));
                let name = name.trim().to_string();
                let mut val = String::new();
                if it.peek() == Some(&'=') {
                    it.next();
                    skip(&mut it, char::is_whitespace);
                    if it.peek() == Some(&'"') {
                        it.next();
                        val = take(&mut it, |c| c != '"');
                        it.next();
                    } else {
                        val = take(&mut it, |c| !matches!(c, ';' | ',')).trim().to_string();
                    }
                }
                if !name.is_empty() { params.push((name, val)); }
            }
            out.push(Link { uri, params });
        }
    }
    out
}

fn skip(it: &mut Peekable<Chars<'_>>, pred: impl Fn(char) -> bool) {
    while matches!(it.peek(), Some(&c) if pred(c)) { it.next(); }
}

fn take(it: &mut Peekable<Chars<'_>>, pred: impl Fn(char) -> bool) -> String {
    let mut s = String::new();
    while let Some(&c) = it.peek() {
        if !pred(c) { break; }
        s.push(c);
        it.next();
    }
    s
}

/// `<uri>; rel="next", <uri>; rel="prev"; title="x"`
pub fn render_links(links: &[Link]) -> String {
    let mut out = String::new();
    for (i, l) in links.iter().enumerate() {
        if i > 0 { out.push_str(", "); }
        out.push('<');
        out.push_str(&l.uri);
        out.push('>');
        for (k, v) in &l.params {
            out.push_str("; ");
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(v);
            out.push('"');
        }
    }
    out
}

/// Drop any `next` relation and append a new one. Returns true when one was replaced.
pub fn replace_next(links: &mut Vec<Link>, uri: String) -> bool {
    let before = links.len();
    links.retain(|l| l.rel() != Some("next"));
    let replaced = links.len() != before;
    links.push(Link::new(uri, "next"));
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_links_and_params() {
        let links = parse_links(["<https://a/x?p=1,2>; rel=\"prev\"; title=\"t\", <https://a/y>;rel=next"]);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].uri, "https://a/x?p=1,2");
        assert_eq!(links[0].rel(), Some("prev"));
        assert_eq!(links[0].params[1], ("title".to_string(), "t".to_string()));
        assert_eq!(links[1].rel(), Some("next"));
    }

    #[test]
    fn replacing_next_keeps_other_relations() {
        let mut links = parse_links(["<https://a/1>; rel=\"next\"", "<https://a/0>; rel=\"first\""]);
        assert!(replace_next(&mut links, "https://a/2".into()));
        assert_eq!(render_links(&links), "<https://a/0>; rel=\"first\", <https://a/2>; rel=\"next\"");
        let mut none = Vec::new();
        assert!(!replace_next(&mut none, "u".into()));
    }

    #[test]
    fn garbage_is_skipped() {
        assert!(parse_links(["", "nonsense", "<unterminated"]).is_empty());
    }
}
