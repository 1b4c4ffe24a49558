//! JSON pointer helpers (RFC 6901) for reading and editing documents.

use serde_json::{Map, Value};

pub fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

fn segments(path: &str) -> Vec<String> {
    path.strip_prefix('/')
        .map(|rest| rest.split('/').map(unescape).collect())
        .unwrap_or_default()
}

pub fn join(base: &str, segment: &str) -> String {
    format!("{}/{}", base, escape(segment))
}

/// Sets the value at `path`, creating intermediate objects as needed.
pub fn set(doc: &mut Value, path: &str, value: Value) {
    let segs = segments(path);
    let Some((last, parents)) = segs.split_last() else {
        *doc = value;
        return;
    };
    let mut current = doc;
    for seg in parents {
        current = match current {
            Value::Array(items) => match seg.parse::<usize>() {
                Ok(i) if i < items.len() => &mut items[i],
                _ => return,
            },
            other => {
                if !other.is_object() {
                    *other = Value::Object(Map::new());
                }
                match other.as_object_mut() {
                    Some(map) => map
                        .entry(seg.clone())
                        .or_insert_with(|| Value::Object(Map::new())),
                    None => return,
                }
            }
        };
    }
    match current {
        Value::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items[i] = value;
                } else if i == items.len() {
                    items.push(value);
                }
            }
        }
        other => {
            if !other.is_object() {
                *other = Value::Object(Map::new());
            }
            if let Some(map) = other.as_object_mut() {
                map.insert(last.clone(), value);
            }
        }
    }
}

/// Removes the value at `path`, returning it if it existed.
pub fn remove(doc: &mut Value, path: &str) -> Option<Value> {
    let segs = segments(path);
    let (last, parents) = segs.split_last()?;
    let mut current = doc;
    for seg in parents {
        current = match current {
            Value::Object(map) => map.get_mut(seg)?,
            Value::Array(items) => items.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Object(map) => map.remove(last),
        Value::Array(items) => {
            let i = last.parse::<usize>().ok()?;
            (i < items.len()).then(|| items.remove(i))
        }
        _ => None,
    }
}
