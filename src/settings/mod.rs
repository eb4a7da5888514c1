//! Hierarchical settings tree with dotted-path lookup and deep merge.
//!
//! A `SettingsTree` is an immutable snapshot of configuration. The
//! `ConfigManager` replaces trees wholesale; nothing mutates a tree that
//! readers may already hold.

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

/// An in-memory hierarchical key/value store.
///
/// Values are YAML values: strings, numbers, booleans, sequences, and
/// nested mappings. Lookup uses dotted paths (`"http.port"`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsTree {
    root: Mapping,
}

impl SettingsTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a tree from YAML text. A non-mapping document is rejected.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: Value = serde_yaml::from_str(content)?;
        Ok(Self::from_value(value))
    }

    /// Wraps a YAML value. Non-mapping values produce an empty tree.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Mapping(root) => Self { root },
            _ => Self::new(),
        }
    }

    /// Returns the value at a dotted path, if present.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current: &Mapping = &self.root;
        let mut segments = path.split('.').peekable();

        while let Some(segment) = segments.next() {
            let key = Value::String(segment.to_string());
            let value = current.get(&key)?;

            if segments.peek().is_none() {
                return Some(value);
            }

            current = value.as_mapping()?;
        }

        None
    }

    /// Returns true if the path resolves to any value.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Returns the string at a path, if present and a string.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Returns the boolean at a path, if present and a boolean.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Returns the unsigned integer at a path, if present and numeric.
    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(Value::as_u64)
    }

    /// Returns a scoped sub-view at a dotted path.
    ///
    /// Missing paths and non-mapping values produce an empty tree, so
    /// callers can decode with serde defaults without special-casing.
    pub fn sub(&self, path: &str) -> SettingsTree {
        match self.get(path) {
            Some(Value::Mapping(m)) => Self { root: m.clone() },
            _ => Self::new(),
        }
    }

    /// Decodes the sub-view at a path into a typed options struct.
    ///
    /// An absent section decodes the empty mapping, letting `#[serde(default)]`
    /// fields take effect.
    pub fn decode<T: DeserializeOwned>(&self, path: &str) -> Result<T, serde_yaml::Error> {
        let value = match self.get(path) {
            Some(v) => v.clone(),
            None => Value::Mapping(Mapping::new()),
        };
        serde_yaml::from_value(value)
    }

    /// Returns a new tree with `overlay` deep-merged on top of `self`.
    ///
    /// Mappings merge recursively; scalars and sequences in the overlay
    /// replace the base value at the same path. Keys absent from the
    /// overlay retain their base value. Merging the same overlay twice
    /// yields the same tree as merging it once.
    pub fn merged(&self, overlay: &SettingsTree) -> SettingsTree {
        let mut root = self.root.clone();
        merge_mapping(&mut root, &overlay.root);
        Self { root }
    }

    /// Returns the whole tree as a YAML value.
    pub fn to_value(&self) -> Value {
        Value::Mapping(self.root.clone())
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Returns the number of top-level keys.
    pub fn len(&self) -> usize {
        self.root.len()
    }
}

fn merge_mapping(base: &mut Mapping, overlay: &Mapping) {
    for (key, overlay_value) in overlay {
        let both_mappings = matches!(base.get(key), Some(Value::Mapping(_)))
            && matches!(overlay_value, Value::Mapping(_));

        if both_mappings {
            if let (Some(Value::Mapping(base_child)), Value::Mapping(overlay_child)) =
                (base.get_mut(key), overlay_value)
            {
                merge_mapping(base_child, overlay_child);
            }
        } else {
            base.insert(key.clone(), overlay_value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(yaml: &str) -> SettingsTree {
        SettingsTree::from_yaml_str(yaml).expect("valid yaml")
    }

    #[test]
    fn dotted_path_lookup() {
        let t = tree("http:\n  port: 8080\n  addr: 0.0.0.0\n");

        assert_eq!(t.get_u64("http.port"), Some(8080));
        assert_eq!(t.get_str("http.addr"), Some("0.0.0.0"));
        assert!(t.get("http.missing").is_none());
        assert!(t.get("missing.port").is_none());
    }

    #[test]
    fn scalar_in_path_does_not_panic() {
        let t = tree("http:\n  port: 8080\n");
        assert!(t.get("http.port.deeper").is_none());
    }

    #[test]
    fn sub_view_scopes_lookups() {
        let t = tree("redis:\n  addr: 127.0.0.1:6379\n  db: 2\n");
        let redis = t.sub("redis");

        assert_eq!(redis.get_str("addr"), Some("127.0.0.1:6379"));
        assert_eq!(redis.get_u64("db"), Some(2));
        assert!(t.sub("absent").is_empty());
    }

    #[test]
    fn decode_applies_serde_defaults_for_missing_section() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Opts {
            #[serde(default = "default_port")]
            port: u16,
        }
        fn default_port() -> u16 {
            9090
        }

        let t = tree("http:\n  port: 8080\n");
        let present: Opts = t.decode("http").unwrap();
        let absent: Opts = t.decode("grpc").unwrap();

        assert_eq!(present.port, 8080);
        assert_eq!(absent.port, 9090);
    }

    #[test]
    fn merge_overlay_wins_and_absent_keys_retained() {
        let base = tree("http:\n  port: 8080\n  addr: 0.0.0.0\nlog:\n  level: info\n");
        let overlay = tree("http:\n  port: 9090\n");

        let merged = base.merged(&overlay);

        assert_eq!(merged.get_u64("http.port"), Some(9090));
        assert_eq!(merged.get_str("http.addr"), Some("0.0.0.0"));
        assert_eq!(merged.get_str("log.level"), Some("info"));
    }

    #[test]
    fn merge_is_idempotent() {
        let base = tree("a:\n  b: 1\n  c: [1, 2]\n");
        let overlay = tree("a:\n  b: 2\nd: x\n");

        let once = base.merged(&overlay);
        let twice = once.merged(&overlay);

        assert_eq!(once, twice);
    }

    #[test]
    fn overlay_sequence_replaces_base_sequence() {
        let base = tree("jobs: [a, b, c]\n");
        let overlay = tree("jobs: [d]\n");

        let merged = base.merged(&overlay);
        let jobs = merged.get("jobs").unwrap().as_sequence().unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn empty_content_is_an_empty_tree() {
        assert!(tree("").is_empty());
        assert!(tree("   \n").is_empty());
    }
}
