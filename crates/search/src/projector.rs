//! Field projection: include narrows first, exclude removes from what is left.

use o2ims_core::{O2Result, Object};
use serde_json::Value as JsonValue;

use crate::path::{lookup, parse_paths, Path, Segment};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projector {
    /// Paths to keep. Empty keeps every field.
    pub include: Vec<Path>,
    pub exclude: Vec<Path>,
}

impl Projector {
    pub fn new(include: Vec<Path>, exclude: Vec<Path>) -> Self { Self { include, exclude } }

    /// Build from raw `fields` / `exclude_fields` parameter values.
    pub fn parse<S: AsRef<str>>(include: &[S], exclude: &[S]) -> O2Result<Self> {
        Ok(Self { include: parse_paths(include)?, exclude: parse_paths(exclude)? })
    }

    pub fn is_identity(&self) -> bool { self.include.is_empty() && self.exclude.is_empty() }

    /// Shape a copy of `object`; the source is left untouched.
    pub fn apply(&self, object: &Object) -> Object {
        let mut root = if self.include.is_empty() {
            JsonValue::Object(object.clone())
        } else {
            let mut out = JsonValue::Object(Object::new());
            for path in &self.include {
                if !matches!(path.segments().first(), Some(Segment::Field(_))) { continue; }
                if let Some(v) = lookup(path, object) { set_in(&mut out, path.segments(), v.clone()); }
            }
            out
        };
        // Highest index first, so removing an element never shifts a later target.
        let mut exclude: Vec<&Path> = self.exclude.iter().collect();
        exclude.sort_unstable_by(|a, b| b.cmp(a));
        exclude.dedup();
        for path in exclude { clear_in(&mut root, path.segments()); }
        match root {
            JsonValue::Object(map) => map,
            _ => Object::new(),
        }
    }
}

/// Write `value` at `segs`, creating containers along the way. Arrays are padded with
/// nulls so that included elements keep their index.
fn set_in(target: &mut JsonValue, segs: &[Segment], value: JsonValue) {
    let Some((head, rest)) = segs.split_first() else {
        *target = value;
        return;
    };
    match head {
        Segment::Field(name) => {
            if !target.is_object() { *target = JsonValue::Object(Object::new()); }
            if let JsonValue::Object(map) = target {
                let slot = map.entry(name.clone()).or_insert(JsonValue::Null);
                set_in(slot, rest, value);
            }
        }
        Segment::Index(i) => {
            if !target.is_array() { *target = JsonValue::Array(Vec::new()); }
            if let JsonValue::Array(items) = target {
                if items.len() <= *i { items.resize(*i + 1, JsonValue::Null); }
                set_in(&mut items[*i], rest, value);
            }
        }
    }
}

fn clear_in(target: &mut JsonValue, segs: &[Segment]) {
    match (segs, target) {
        ([Segment::Field(name)], JsonValue::Object(map)) => { map.remove(name); }
        ([Segment::Index(i)], JsonValue::Array(items)) => { if *i < items.len() { items.remove(*i); } }
        ([Segment::Field(name), rest @ ..], JsonValue::Object(map)) => {
            if let Some(child) = map.get_mut(name) { clear_in(child, rest); }
        }
        ([Segment::Index(i), rest @ ..], JsonValue::Array(items)) => {
            if let Some(child) = items.get_mut(*i) { clear_in(child, rest); }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: JsonValue) -> Object { v.as_object().cloned().unwrap() }
    fn proj(inc: &[&str], exc: &[&str]) -> Projector { Projector::parse(inc, exc).unwrap() }

    fn sample() -> Object {
        obj(json!({
            "id": "a1",
            "name": "alarm",
            "extensions": {"cluster": "c1", "note": "n", "nested": {"x": 1, "y": 2}},
            "list": [{"k": 1}, {"k": 2}]
        }))
    }

    #[test]
    fn empty_projector_is_identity() {
        let src = sample();
        assert_eq!(Projector::default().apply(&src), src);
    }

    #[test]
    fn include_recreates_nested_containers() {
        let src = sample();
        let out = proj(&["id", "extensions/nested/x"], &[]).apply(&src);
        assert_eq!(JsonValue::Object(out), json!({"id": "a1", "extensions": {"nested": {"x": 1}}}));
        assert_eq!(src, sample(), "source must not change");
    }

    #[test]
    fn exclude_applies_after_include() {
        let out = proj(&["extensions"], &["extensions.note", "extensions/nested/y"]).apply(&sample());
        assert_eq!(JsonValue::Object(out), json!({"extensions": {"cluster": "c1", "nested": {"x": 1}}}));
    }

    #[test]
    fn exclude_only_drops_fields_from_everything() {
        let out = proj(&[], &["list", "missing/deep"]).apply(&sample());
        assert!(!out.contains_key("list"));
        assert_eq!(out.get("name"), Some(&json!("alarm")));
    }

    #[test]
    fn indexes_keep_their_position() {
        let out = proj(&["list[1].k"], &[]).apply(&sample());
        assert_eq!(JsonValue::Object(out), json!({"list": [null, {"k": 2}]}));
        let out = proj(&[], &["list[0]"]).apply(&sample());
        assert_eq!(out.get("list"), Some(&json!([{"k": 2}])));
    }

    #[test]
    fn several_index_excludes_address_the_original_positions() {
        let src = obj(json!({"list": ["a", "b", "c"], "rows": [{"k": 1, "v": 1}, {"k": 2}]}));
        let out = proj(&[], &["list[0]", "list[1]"]).apply(&src);
        assert_eq!(out.get("list"), Some(&json!(["c"])));
        let out = proj(&[], &["list[2]", "list[0]", "list[0]"]).apply(&src);
        assert_eq!(out.get("list"), Some(&json!(["b"])));
        let out = proj(&[], &["rows[0]", "rows[1].k"]).apply(&src);
        assert_eq!(out.get("rows"), Some(&json!([{}])));
    }

    #[test]
    fn missing_include_paths_are_skipped() {
        let out = proj(&["nope", "id"], &[]).apply(&sample());
        assert_eq!(JsonValue::Object(out), json!({"id": "a1"}));
    }
}
