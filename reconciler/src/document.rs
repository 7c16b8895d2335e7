//! Order-preserving configuration tree with path based editing.
//!
//! Paths are slices of segments. A segment addresses an object key, or an
//! array element when the parent is an array and the segment is a number.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("expected an array at {0}")]
    NotAnArray(String),

    #[error("cannot descend into a scalar at {0}")]
    NotAContainer(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DocumentFormat {
    #[default]
    Json,
    Yaml,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDocument {
    root: Value,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        ConfigDocument {
            root: Value::Object(Map::new()),
        }
    }
}

impl From<Value> for ConfigDocument {
    fn from(root: Value) -> Self {
        ConfigDocument { root }
    }
}

fn display(path: &[&str]) -> String {
    path.join(".")
}

impl ConfigDocument {
    pub fn parse(bytes: &[u8], format: DocumentFormat) -> Result<Self, DocumentError> {
        let root = match format {
            DocumentFormat::Json => serde_json::from_slice(bytes)?,
            DocumentFormat::Yaml => serde_yaml::from_slice(bytes)?,
        };
        Ok(ConfigDocument { root })
    }

    /// Pretty JSON (two-space indent, trailing newline) or YAML.
    pub fn serialize(&self, format: DocumentFormat) -> Result<Vec<u8>, DocumentError> {
        match format {
            DocumentFormat::Json => {
                let mut bytes = serde_json::to_vec_pretty(&self.root)?;
                bytes.push(b'\n');
                Ok(bytes)
            }
            DocumentFormat::Yaml => Ok(serde_yaml::to_string(&self.root)?.into_bytes()),
        }
    }

    /// Single-line JSON, as sent to the admin API.
    pub fn serialize_compact(&self) -> Result<Vec<u8>, DocumentError> {
        Ok(serde_json::to_vec(&self.root)?)
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get_at(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.root, |node, segment| match node {
            Value::Object(map) => map.get(*segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    fn get_at_mut(&mut self, path: &[&str]) -> Option<&mut Value> {
        path.iter().try_fold(&mut self.root, |node, segment| match node {
            Value::Object(map) => map.get_mut(*segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(move |i| items.get_mut(i)),
            _ => None,
        })
    }

    pub fn object_at(&self, path: &[&str]) -> Option<&Map<String, Value>> {
        self.get_at(path).and_then(Value::as_object)
    }

    /// Writes `value` at `path`, creating missing intermediate objects.
    /// Array elements can only be replaced, not created.
    pub fn set_at(&mut self, path: &[&str], value: Value) -> Result<(), DocumentError> {
        let Some((last, parents)) = path.split_last() else {
            self.root = value;
            return Ok(());
        };

        let mut node = &mut self.root;
        for (depth, segment) in parents.iter().enumerate() {
            if node.is_null() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| DocumentError::PathNotFound(display(&path[..=depth])))?,
                _ => return Err(DocumentError::NotAContainer(display(&path[..depth]))),
            };
        }

        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        match node {
            Value::Object(map) => {
                map.insert(last.to_string(), value);
                Ok(())
            }
            Value::Array(items) => {
                let slot = last
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| DocumentError::PathNotFound(display(path)))?;
                *slot = value;
                Ok(())
            }
            _ => Err(DocumentError::NotAContainer(display(parents))),
        }
    }

    /// Removes and returns the value at `path`. Object key order of the
    /// remaining entries is kept.
    pub fn delete_at(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        match self.get_at_mut(parents)? {
            Value::Object(map) => map.shift_remove(*last),
            Value::Array(items) => {
                let i = last.parse::<usize>().ok().filter(|i| *i < items.len())?;
                Some(items.remove(i))
            }
            _ => None,
        }
    }

    /// Keeps the elements of the array at `path` for which `keep` returns
    /// true. Returns how many were removed.
    pub fn filter_array_at<F>(&mut self, path: &[&str], mut keep: F) -> Result<usize, DocumentError>
    where
        F: FnMut(&Value) -> bool,
    {
        let node = self
            .get_at_mut(path)
            .ok_or_else(|| DocumentError::PathNotFound(display(path)))?;
        let items = node
            .as_array_mut()
            .ok_or_else(|| DocumentError::NotAnArray(display(path)))?;

        let before = items.len();
        items.retain(|item| keep(item));
        Ok(before - items.len())
    }

    /// Inserts `items` in front of the array at `path`, in order. A missing
    /// or null array is created.
    pub fn prepend_array_at(&mut self, path: &[&str], items: Vec<Value>) -> Result<(), DocumentError> {
        match self.get_at_mut(path) {
            Some(Value::Array(existing)) => {
                existing.splice(0..0, items);
                Ok(())
            }
            Some(Value::Null) | None => self.set_at(path, Value::Array(items)),
            Some(_) => Err(DocumentError::NotAnArray(display(path))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{
  "admin": {"listen": "unix//admin.sock"},
  "apps": {
    "http": {
      "servers": {
        "srv0": {"listen": [":443"], "routes": [{"a": 1}, {"b": 2}]}
      }
    }
  }
}"#;

    fn sample() -> ConfigDocument {
        ConfigDocument::parse(SAMPLE.as_bytes(), DocumentFormat::Json).unwrap()
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ConfigDocument::parse(b"{not json", DocumentFormat::Json),
            Err(DocumentError::Json(_))
        ));
        assert!(matches!(
            ConfigDocument::parse(b"a: [unclosed", DocumentFormat::Yaml),
            Err(DocumentError::Yaml(_))
        ));
    }

    #[test]
    fn test_key_order_survives_round_trip() {
        let doc = ConfigDocument::parse(br#"{"zeta": 1, "alpha": 2, "mid": {"b": 1, "a": 2}}"#, DocumentFormat::Json)
            .unwrap();
        let out = String::from_utf8(doc.serialize_compact().unwrap()).unwrap();
        assert_eq!(out, r#"{"zeta":1,"alpha":2,"mid":{"b":1,"a":2}}"#);

        let pretty = String::from_utf8(doc.serialize(DocumentFormat::Json).unwrap()).unwrap();
        assert!(pretty.starts_with("{\n  \"zeta\": 1,"));
        assert!(pretty.ends_with("}\n"));
    }

    #[test]
    fn test_yaml_input() {
        let doc = ConfigDocument::parse(b"apps:\n  http:\n    servers: {}\n", DocumentFormat::Yaml).unwrap();
        assert!(doc.object_at(&["apps", "http", "servers"]).unwrap().is_empty());
        let yaml = String::from_utf8(doc.serialize(DocumentFormat::Yaml).unwrap()).unwrap();
        assert!(yaml.contains("servers: {}"));
    }

    #[test]
    fn test_get_at() {
        let doc = sample();
        assert_eq!(doc.get_at(&["admin", "listen"]), Some(&json!("unix//admin.sock")));
        assert_eq!(
            doc.get_at(&["apps", "http", "servers", "srv0", "routes", "1", "b"]),
            Some(&json!(2))
        );
        assert_eq!(doc.get_at(&["apps", "http", "servers", "srv0", "routes", "7"]), None);
        assert_eq!(doc.get_at(&["admin", "listen", "deeper"]), None);
        assert_eq!(doc.get_at(&[]), Some(doc.root()));
    }

    #[test]
    fn test_set_at_creates_intermediate_objects() {
        let mut doc = sample();
        doc.set_at(&["apps", "outline", "shadowsocks", "replay_history"], json!(10000))
            .unwrap();
        assert_eq!(
            doc.get_at(&["apps", "outline", "shadowsocks"]),
            Some(&json!({"replay_history": 10000}))
        );

        doc.set_at(&["apps", "http", "servers", "srv0", "routes", "0"], json!({"c": 3}))
            .unwrap();
        assert_eq!(
            doc.get_at(&["apps", "http", "servers", "srv0", "routes", "0"]),
            Some(&json!({"c": 3}))
        );

        assert!(matches!(
            doc.set_at(&["apps", "http", "servers", "srv0", "routes", "9", "x"], json!(1)),
            Err(DocumentError::PathNotFound(_))
        ));
        assert!(matches!(
            doc.set_at(&["admin", "listen", "x"], json!(1)),
            Err(DocumentError::NotAContainer(_))
        ));
    }

    #[test]
    fn test_set_at_keeps_existing_key_position() {
        let mut doc = sample();
        doc.set_at(&["admin"], json!({"listen": "other"})).unwrap();
        let keys: Vec<&String> = doc.root().as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["admin", "apps"]);
    }

    #[test]
    fn test_delete_at() {
        let mut doc = sample();
        assert_eq!(doc.delete_at(&["admin", "listen"]), Some(json!("unix//admin.sock")));
        assert_eq!(doc.delete_at(&["admin", "listen"]), None);
        assert_eq!(
            doc.delete_at(&["apps", "http", "servers", "srv0", "routes", "0"]),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            doc.get_at(&["apps", "http", "servers", "srv0", "routes"]),
            Some(&json!([{"b": 2}]))
        );
    }

    #[test]
    fn test_filter_and_prepend() {
        let mut doc = sample();
        let routes = ["apps", "http", "servers", "srv0", "routes"];

        let removed = doc
            .filter_array_at(&routes, |route| route.get("a").is_none())
            .unwrap();
        assert_eq!(removed, 1);

        doc.prepend_array_at(&routes, vec![json!({"x": 1}), json!({"y": 2})])
            .unwrap();
        assert_eq!(
            doc.get_at(&routes),
            Some(&json!([{"x": 1}, {"y": 2}, {"b": 2}]))
        );

        assert!(matches!(
            doc.filter_array_at(&["admin"], |_| true),
            Err(DocumentError::NotAnArray(_))
        ));
        assert!(matches!(
            doc.filter_array_at(&["missing"], |_| true),
            Err(DocumentError::PathNotFound(_))
        ));

        doc.prepend_array_at(&["apps", "new"], vec![json!(1)]).unwrap();
        assert_eq!(doc.get_at(&["apps", "new"]), Some(&json!([1])));
    }
}
