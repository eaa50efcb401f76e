//! Selector evaluation over untyped objects.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use o2ims_core::{json_type_name, O2Error, O2Result, Object, Value};
use regex::Regex;

use crate::path::lookup;
use crate::selector::{Operator, Selector, Term};

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$").unwrap()
});

/// 8-4-4-4-12 hex shape.
pub fn looks_like_uuid(s: &str) -> bool { s.len() == 36 && UUID_RE.is_match(s) }

impl Selector {
    /// True when every term accepts the object. Stops at the first rejecting term.
    pub fn matches(&self, object: &Object) -> O2Result<bool> {
        for term in &self.terms {
            if !term.matches(object)? { return Ok(false); }
        }
        Ok(true)
    }
}

impl Term {
    /// Missing or null fields never match. A present field of the wrong type is an error.
    pub fn matches(&self, object: &Object) -> O2Result<bool> {
        self.check_arity()?;
        let raw = match lookup(&self.path, object) {
            Some(v) => v,
            None => return Ok(false),
        };
        let field = match Value::from_json(raw) {
            Some(Value::Null) => return Ok(false),
            Some(v) => v,
            None => {
                return Err(O2Error::Validation(format!(
                    "the '{}' operator can't be applied to {} attribute '{}'",
                    self.operator, json_type_name(raw), self.path
                )))
            }
        };
        let args = self.convert_args(&field)?;
        match self.operator {
            Operator::Eq => Ok(equals(&field, &args[0])),
            Operator::Neq => Ok(!equals(&field, &args[0])),
            Operator::In => Ok(args.iter().any(|a| equals(&field, a))),
            Operator::Nin => Ok(!args.iter().any(|a| equals(&field, a))),
            Operator::Cont | Operator::Ncont => {
                let hay = match &field {
                    Value::String(s) => s,
                    other => {
                        return Err(O2Error::Validation(format!(
                            "the '{}' operator requires a string attribute, but '{}' is {}",
                            self.operator, self.path, other.type_name()
                        )))
                    }
                };
                let found = args.iter().any(|a| matches!(a, Value::String(n) if hay.contains(n.as_str())));
                Ok(if self.operator == Operator::Cont { found } else { !found })
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let ord = self.order(&field, &args[0])?;
                Ok(match self.operator {
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Gte => ord != Ordering::Less,
                    Operator::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                })
            }
        }
    }

    /// Convert the textual values to the type of the field they are compared with.
    fn convert_args(&self, field: &Value) -> O2Result<Vec<Value>> {
        self.values
            .iter()
            .map(|text| match field {
                Value::String(_) => Ok(Value::String(text.clone())),
                Value::Number(_) => text.trim().parse::<f64>().map(Value::Number).map_err(|_| {
                    O2Error::Validation(format!("value '{}' for '{}' is not a number", text, self.path))
                }),
                Value::Bool(_) => match text.trim() {
                    t if t.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                    t if t.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                    _ => Err(O2Error::Validation(format!("value '{}' for '{}' is not a boolean", text, self.path))),
                },
                Value::Null => Ok(Value::Null),
            })
            .collect()
    }

    fn order(&self, field: &Value, arg: &Value) -> O2Result<Ordering> {
        match (field, arg) {
            (Value::String(a), Value::String(b)) => Ok(a.as_str().cmp(b.as_str())),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).ok_or_else(|| {
                O2Error::Validation(format!("can't order '{}' and '{}' for '{}'", a, b, self.path))
            }),
            _ => Err(O2Error::Validation(format!(
                "the '{}' operator supports string and number attributes, but '{}' is {}",
                self.operator, self.path, field.type_name()
            ))),
        }
    }
}

fn equals(field: &Value, arg: &Value) -> bool {
    match (field, arg) {
        (Value::String(a), Value::String(b)) if looks_like_uuid(a) && looks_like_uuid(b) => a.eq_ignore_ascii_case(b),
        _ => field == arg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::parse_selector;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> Object { v.as_object().cloned().unwrap() }
    fn eval(sel: &str, v: serde_json::Value) -> O2Result<bool> { parse_selector(sel).unwrap().matches(&obj(v)) }

    #[test]
    fn eq_and_neq_on_strings() {
        assert!(eval("(eq,MyField,myvalue)", json!({"MyField": "myvalue"})).unwrap());
        assert!(!eval("(eq,MyField,myvalue)", json!({"MyField": "othervalue"})).unwrap());
        assert!(eval("(neq,MyField,myvalue)", json!({"MyField": "othervalue"})).unwrap());
        assert!(!eval("(eq,MyField,MyValue)", json!({"MyField": "myvalue"})).unwrap());
    }

    #[test]
    fn uuid_shaped_values_ignore_case() {
        let lower = "0f3b6c2e-9a4d-4e8b-b1c2-7d5e6f708192";
        let upper = lower.to_ascii_uppercase();
        assert!(eval(&format!("(eq,id,{})", upper), json!({"id": lower})).unwrap());
        assert!(!eval(&format!("(neq,id,{})", upper), json!({"id": lower})).unwrap());
        assert!(eval(&format!("(in,id,x,{})", upper), json!({"id": lower})).unwrap());
    }

    #[test]
    fn in_and_nin_membership() {
        assert!(!eval("(in,MyField,a,b)", json!({"MyField": "c"})).unwrap());
        assert!(eval("(in,MyField,a,b)", json!({"MyField": "b"})).unwrap());
        assert!(eval("(nin,MyField,a,b)", json!({"MyField": "c"})).unwrap());
        assert!(eval("(in,n,1,2.5)", json!({"n": 2.5})).unwrap());
    }

    #[test]
    fn containment_requires_strings() {
        assert!(eval("(cont,name,ost)", json!({"name": "my-host"})).unwrap());
        assert!(eval("(ncont,name,zzz,yyy)", json!({"name": "my-host"})).unwrap());
        assert!(!eval("(ncont,name,my)", json!({"name": "my-host"})).unwrap());
        assert!(matches!(eval("(cont,n,1)", json!({"n": 12})), Err(O2Error::Validation(_))));
    }

    #[test]
    fn ordering_is_inclusive_only_for_e_variants() {
        let o = json!({"n": 5, "s": "m"});
        assert!(!eval("(gt,n,5)", o.clone()).unwrap());
        assert!(eval("(gte,n,5)", o.clone()).unwrap());
        assert!(!eval("(lt,n,5)", o.clone()).unwrap());
        assert!(eval("(lte,n,5)", o.clone()).unwrap());
        assert!(eval("(gt,n,4.5)", o.clone()).unwrap());
        assert!(eval("(lt,s,n)", o.clone()).unwrap());
        assert!(eval("(gte,s,m)", o).unwrap());
    }

    #[test]
    fn missing_fields_never_match() {
        for sel in ["(eq,a/b,x)", "(neq,a/b,x)", "(nin,a,x)", "(ncont,a,x)", "(gt,a,1)"] {
            assert!(!eval(sel, json!({"other": 1})).unwrap(), "{}", sel);
        }
        assert!(!eval("(neq,a,x)", json!({"a": null})).unwrap());
    }

    #[test]
    fn type_mismatch_on_present_field_is_error() {
        assert!(matches!(eval("(eq,n,abc)", json!({"n": 1})), Err(O2Error::Validation(_))));
        assert!(matches!(eval("(eq,o,x)", json!({"o": {"k": 1}})), Err(O2Error::Validation(_))));
        assert!(matches!(eval("(gt,b,true)", json!({"b": true})), Err(O2Error::Validation(_))));
        assert!(eval("(eq,b,TRUE)", json!({"b": true})).unwrap());
    }

    #[test]
    fn terms_are_anded() {
        let o = json!({"a": "x", "b": {"c": 2}});
        assert!(eval("(eq,a,x);(eq,b/c,2)", o.clone()).unwrap());
        assert!(!eval("(eq,a,x);(eq,b.c,3)", o).unwrap());
        assert!(Selector::default().matches(&Object::new()).unwrap());
    }
}
