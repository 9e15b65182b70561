//! The flat metrics mapping written to the metrics summary JSON.

use serde::Serialize;
use serde_json::Value;
use std::collections::{btree_map, BTreeMap};

/// Convert an optional float to a JSON value under the summary convention:
/// a missing or non-finite value serializes as the string `"NaN"`, never
/// omitted and never JSON `null`.
pub fn optional_value(x: Option<f64>) -> Value {
    match x {
        Some(v) if v.is_finite() => Value::from(v),
        _ => Value::from("NaN"),
    }
}

/// Serde adapter for optional floats in metric summary JSON. Upstream
/// summaries use the same convention as [`optional_value`]: an undefined
/// metric is the string `"NaN"`. Accept that, JSON `null`, and (with
/// `#[serde(default)]`) a missing field as "no value"; write "no value"
/// back out as `"NaN"`.
pub mod nan_string {
    use super::optional_value;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawMetric {
        Number(f64),
        Text(String),
    }

    /// Deserialize an optional float, mapping `"NaN"` and `null` to `None`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<RawMetric>::deserialize(deserializer)? {
            None => Ok(None),
            Some(RawMetric::Number(x)) if x.is_finite() => Ok(Some(x)),
            Some(RawMetric::Number(_)) => Ok(None),
            Some(RawMetric::Text(s)) if s == "NaN" => Ok(None),
            Some(RawMetric::Text(s)) => {
                Err(D::Error::custom(format!("invalid metric value: {s:?}")))
            }
        }
    }

    /// Serialize an optional float, writing `None` as the string `"NaN"`.
    pub fn serialize<S>(x: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        optional_value(*x).serialize(serializer)
    }
}

/// A flat mapping from metric name to a scalar JSON value, backed by an
/// ordered map so that serialization of identical content is byte-identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct JsonReporter {
    map: BTreeMap<String, Value>,
}

impl JsonReporter {
    /// Insert a new (key, value) pair.
    ///
    /// # Panics
    /// Panics if the key is already present; metric keys are never
    /// duplicated, so a collision is a programming error.
    pub fn insert(&mut self, key: impl ToString, value: impl Into<Value>) {
        let key = key.to_string();
        let old = self.map.insert(key.clone(), value.into());
        assert!(old.is_none(), "duplicate metric key: {key}");
    }

    /// Insert an optional float under the "no value" convention of
    /// [`optional_value`].
    pub fn insert_optional(&mut self, key: impl ToString, value: Option<f64>) {
        self.insert(key, optional_value(value));
    }

    /// Merge another reporter into this one.
    ///
    /// # Panics
    /// The reporters must be disjoint; a shared key is a programming error.
    pub fn merge(&mut self, other: JsonReporter) {
        for (key, value) in other {
            self.insert(key, value);
        }
    }

    /// Look up a metric by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Number of metrics in the mapping.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if the mapping holds no metrics.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over (name, value) pairs in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.map.iter()
    }
}

impl IntoIterator for JsonReporter {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}

impl<'a> IntoIterator for &'a JsonReporter {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: ToString, V: Into<Value>> FromIterator<(K, V)> for JsonReporter {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> JsonReporter {
        let mut reporter = JsonReporter::default();
        for (key, value) in iter {
            reporter.insert(key, value);
        }
        reporter
    }
}
