use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use url::form_urlencoded;

use crate::error::PathError;
use crate::protocol::Properties;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Property(String),
    /// 1-based.
    Index(usize),
    Method(String),
    Parent,
    Standard(String),
}

pub type Params = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    raw: String,
    segments: Vec<Segment>,
    params: Params,
}

impl Path {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let (path_part, query) = match raw.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (raw, None),
        };

        let mut segments = Vec::new();
        let mut rest = path_part;
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("..") {
                segments.push(Segment::Parent);
                rest = after;
                continue;
            }
            if let Some(after) = rest.strip_prefix('.') {
                rest = after;
                continue;
            }

            let end = rest.find('.').unwrap_or(rest.len());
            let token = &rest[..end];
            rest = &rest[end..];
            segments.push(classify(token, segments.is_empty())?);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            params: query.map(parse_params).unwrap_or_default(),
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn base(&self) -> &str {
        self.raw.split_once('?').map_or(self.raw.as_str(), |(base, _)| base)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.params.get(key) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => text != "false",
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn params_as_properties(&self) -> Properties {
        self.params
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn classify(token: &str, first: bool) -> Result<Segment, PathError> {
    if let Some(name) = token.strip_prefix('@') {
        return if first {
            Ok(Segment::Standard(name.to_string()))
        } else {
            Err(PathError::MisplacedStandard(token.to_string()))
        };
    }

    if let Some(name) = token.strip_suffix("()") {
        let valid = !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        return if valid {
            Ok(Segment::Method(name.to_string()))
        } else {
            Err(PathError::InvalidMethod(token.to_string()))
        };
    }

    if token.chars().all(|c| c.is_ascii_digit()) {
        return match token.parse::<usize>() {
            Ok(0) | Err(_) => Err(PathError::ZeroIndex(token.to_string())),
            Ok(index) => Ok(Segment::Index(index)),
        };
    }

    Ok(Segment::Property(token.to_string()))
}

fn parse_params(query: &str) -> Params {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = form_urlencoded::parse(pair.as_bytes()).next()?;
            let value = if pair.contains('=') {
                Value::String(value.into_owned())
            } else {
                Value::Bool(true)
            };
            Some((key.into_owned(), value))
        })
        .collect()
}

pub fn step<'a>(value: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (segment, value) {
        (Segment::Property(name), Value::Object(map)) => map.get(name),
        (Segment::Index(index), Value::Array(items)) => {
            index.checked_sub(1).and_then(|at| items.get(at))
        }
        _ => None,
    }
}

pub fn resolve_json(root: &Value, segments: &[Segment]) -> Value {
    segments
        .iter()
        .try_fold(root, |current, segment| step(current, segment))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Writes through plain JSON, failing when an intermediate segment is nullish
/// or the target cannot hold the final segment.
pub fn assign_json(root: &mut Value, segments: &[Segment], value: Value) -> Result<(), String> {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for segment in parents {
        current = match (segment, current) {
            (Segment::Property(name), Value::Object(map)) => map
                .get_mut(name)
                .filter(|next| !next.is_null())
                .ok_or_else(|| format!("segment '{name}' is null"))?,
            (Segment::Index(index), Value::Array(items)) => index
                .checked_sub(1)
                .and_then(|at| items.get_mut(at))
                .filter(|next| !next.is_null())
                .ok_or_else(|| format!("index {index} is out of range"))?,
            (segment, _) => return Err(format!("cannot traverse {segment:?}")),
        };
    }

    match (last, current) {
        (Segment::Property(name), Value::Object(map)) => {
            map.insert(name.clone(), value);
            Ok(())
        }
        (Segment::Index(index), Value::Array(items)) if (1..=items.len()).contains(index) => {
            items[index - 1] = value;
            Ok(())
        }
        (segment, _) => Err(format!("cannot assign {segment:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_segment_kinds() {
        let path = Path::parse("@customers.2.getName()").expect("parse");
        assert_eq!(
            path.segments(),
            &[
                Segment::Standard("customers".into()),
                Segment::Index(2),
                Segment::Method("getName".into()),
            ]
        );

        let parent = Path::parse("..name").expect("parse parent");
        assert_eq!(
            parent.segments(),
            &[Segment::Parent, Segment::Property("name".into())]
        );

        let inner = Path::parse("a..b").expect("parse inner parent");
        assert_eq!(
            inner.segments(),
            &[
                Segment::Property("a".into()),
                Segment::Parent,
                Segment::Property("b".into()),
            ]
        );
    }

    #[test]
    fn rejects_bad_segments() {
        assert!(matches!(
            Path::parse("a.@b"),
            Err(PathError::MisplacedStandard(_))
        ));
        assert!(matches!(Path::parse("items.0"), Err(PathError::ZeroIndex(_))));
        assert!(matches!(Path::parse("9x()"), Err(PathError::InvalidMethod(_))));
    }

    #[test]
    fn bare_query_key_is_true() {
        let path = Path::parse("items?wrapper=ViewList&keypress&label=a%20b").expect("parse");

        assert_eq!(path.base(), "items");
        assert_eq!(path.param_str("wrapper"), Some("ViewList"));
        assert_eq!(path.params().get("keypress"), Some(&Value::Bool(true)));
        assert!(path.flag("keypress"));
        assert_eq!(path.param_str("label"), Some("a b"));
        assert_eq!(
            path.params_as_properties().get("keypress").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn read_through_null_is_silent() {
        let root = json!({"father": null, "items": [{"name": "a"}]});

        assert_eq!(
            resolve_json(&root, Path::parse("father.name").unwrap().segments()),
            Value::Null
        );
        assert_eq!(
            resolve_json(&root, Path::parse("items.1.name").unwrap().segments()),
            json!("a")
        );
    }

    #[test]
    fn write_through_null_fails() {
        let mut root = json!({"father": null, "items": [{"name": "a"}]});

        let err = assign_json(
            &mut root,
            Path::parse("father.name").unwrap().segments(),
            json!("x"),
        )
        .expect_err("null intermediate");
        assert!(err.contains("father"));

        assign_json(
            &mut root,
            Path::parse("items.1.name").unwrap().segments(),
            json!("b"),
        )
        .expect("assign");
        assert_eq!(root["items"][0]["name"], "b");
    }
}
