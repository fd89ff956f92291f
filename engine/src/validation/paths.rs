//! Dot-path addressing into candidate records.
//!
//! Grammar: dot-separated object keys; `key[]` addresses every element of
//! the array at `key`; `key[3]` addresses one element. A trailing `?`
//! marks a nullable field that must exist but may be `null`.

use serde_json::{Map, Value};

/// One step of a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key.
    Key(String),
    /// Every element of an array.
    Each,
    /// One array element.
    Index(usize),
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<Segment>,
    nullable: bool,
}

impl FieldPath {
    /// Parses a dot-path. Malformed brackets are treated as part of the key.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let (body, nullable) = trimmed
            .strip_suffix('?')
            .map_or((trimmed, false), |body| (body, true));

        let mut segments = Vec::new();
        for part in body.split('.').filter(|p| !p.is_empty()) {
            let (key, mut rest) = part.find('[').map_or((part, ""), |i| part.split_at(i));
            let mut brackets = Vec::new();
            let mut well_formed = true;
            while let Some(inner) = rest.strip_prefix('[') {
                let Some(end) = inner.find(']') else {
                    well_formed = false;
                    break;
                };
                let index = &inner[..end];
                if index.is_empty() {
                    brackets.push(Segment::Each);
                } else if let Ok(i) = index.parse() {
                    brackets.push(Segment::Index(i));
                } else {
                    well_formed = false;
                    break;
                }
                rest = &inner[end + 1..];
            }
            if !well_formed || !rest.is_empty() {
                segments.push(Segment::Key(part.to_string()));
                continue;
            }
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            segments.extend(brackets);
        }

        Self { segments, nullable }
    }

    /// Parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether `null` satisfies presence.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Every value the path reaches.
    #[must_use]
    pub fn resolve<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            current = current
                .into_iter()
                .flat_map(|value| step(value, segment))
                .collect();
        }
        current
    }

    /// Whether the path is absent, `null`, or blank in `root`.
    ///
    /// For paths through `[]` the field counts as present when any element has it.
    #[must_use]
    pub fn is_missing(&self, root: &Value) -> bool {
        !self.resolve(root).into_iter().any(|v| self.is_present(v))
    }

    fn is_present(&self, value: &Value) -> bool {
        match value {
            Value::Null => self.nullable,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        }
    }

    /// Removes the addressed values from `root`.
    pub fn remove(&self, root: &mut Value) {
        remove_at(root, &self.segments);
    }

    /// Copies the subtree addressed by this path's leading keys from
    /// `source` into `target`, creating intermediate objects as needed.
    ///
    /// Returns false when `source` has nothing at that prefix.
    pub fn copy_into(&self, source: &Value, target: &mut Value) -> bool {
        let keys: Vec<&str> = self
            .segments
            .iter()
            .map_while(|s| match s {
                Segment::Key(k) => Some(k.as_str()),
                _ => None,
            })
            .collect();
        let Some((last, parents)) = keys.split_last() else {
            return false;
        };
        let mut found = source;
        for key in &keys {
            match found.get(key) {
                Some(v) => found = v,
                None => return false,
            }
        }

        let mut slot = target;
        for key in parents {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Some(obj) = slot.as_object_mut() else {
                return false;
            };
            slot = obj
                .entry((*key).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        slot.as_object_mut()
            .map(|obj| obj.insert((*last).to_string(), found.clone()))
            .is_some()
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            match segment {
                Segment::Key(k) => {
                    if !first {
                        f.write_str(".")?;
                    }
                    f.write_str(k)?;
                }
                Segment::Each => f.write_str("[]")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
            first = false;
        }
        if self.nullable {
            f.write_str("?")?;
        }
        Ok(())
    }
}

fn step<'a>(value: &'a Value, segment: &Segment) -> Vec<&'a Value> {
    match (segment, value) {
        (Segment::Key(k), Value::Object(obj)) => obj.get(k).into_iter().collect(),
        (Segment::Each, Value::Array(items)) => items.iter().collect(),
        (Segment::Index(i), Value::Array(items)) => items.get(*i).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn remove_at(value: &mut Value, segments: &[Segment]) {
    let Some((head, tail)) = segments.split_first() else {
        return;
    };
    match (head, value) {
        (Segment::Key(k), Value::Object(obj)) => {
            if tail.is_empty() {
                obj.remove(k);
            } else if let Some(child) = obj.get_mut(k) {
                remove_at(child, tail);
            }
        }
        (Segment::Each, Value::Array(items)) => {
            if tail.is_empty() {
                items.clear();
            } else {
                for item in items {
                    remove_at(item, tail);
                }
            }
        }
        (Segment::Index(i), Value::Array(items)) => {
            if tail.is_empty() {
                if *i < items.len() {
                    items.remove(*i);
                }
            } else if let Some(item) = items.get_mut(*i) {
                remove_at(item, tail);
            }
        }
        _ => {}
    }
}

/// Derives required dot-paths from a JSON Schema's `required` keywords,
/// walking nested objects and array item schemas (`path[]`).
///
/// # Examples
///
/// ```
/// use docflow_engine::validation::paths::derive_required_fields;
/// use serde_json::json;
///
/// let schema = json!({
///     "type": "object",
///     "required": ["lines"],
///     "properties": {
///         "lines": {"type": "array", "items": {"type": "object", "required": ["amount"]}}
///     }
/// });
/// assert_eq!(derive_required_fields(&schema), vec!["lines", "lines[].amount"]);
/// ```
#[must_use]
pub fn derive_required_fields(schema: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk_object(schema, "", &mut out);
    out
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn walk_object(schema: &Value, prefix: &str, out: &mut Vec<String>) {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        out.extend(required.iter().filter_map(Value::as_str).map(|k| join(prefix, k)));
    }
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, sub) in props {
            walk_property(sub, &join(prefix, key), out);
        }
    }
}

fn walk_property(schema: &Value, path: &str, out: &mut Vec<String>) {
    if let Some(items) = schema.get("items").filter(|i| i.is_object()) {
        walk_property(items, &format!("{path}[]"), out);
    } else {
        walk_object(schema, path, out);
    }
}
