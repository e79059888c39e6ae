//! Structural comparison of expected and actual responses.

use crate::verification::{is_metadata_record, CollectionVerificationConfig, Operator, Ordering};
use serde_json::{Map, Value};

/// Expected-side marker that accepts any value, as long as the field
/// is present.
pub const ANYTHING_PRESENT: &str = "[[ANYTHING_PRESENT]]";

/// Result of comparing one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    /// One line per mismatch, prefixed with the field path.
    pub diffs: Vec<String>,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.diffs.is_empty()
    }
}

/// Compares an expected response tree with the actual one.
pub trait StructuralComparator: Send + Sync {
    fn compare(&self, expected: &Value, actual: &Value) -> Verification;
}

/// Default comparator.
///
/// Only the fields named at the top of the expected response are
/// checked; headers are matched case-insensitively and may carry
/// extras. Below that, objects must match key for key and every
/// array is compared under the config derived from its expected
/// contents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonComparator;

impl StructuralComparator for JsonComparator {
    fn compare(&self, expected: &Value, actual: &Value) -> Verification {
        let mut diffs = Vec::new();
        match (expected, actual) {
            (Value::Object(expected), Value::Object(actual)) => {
                for (key, expected_value) in expected {
                    match actual.get(key) {
                        Some(actual_value) if key == "headers" => {
                            compare_headers(expected_value, actual_value, &mut diffs)
                        }
                        Some(actual_value) => {
                            compare_at(key, expected_value, actual_value, &mut diffs)
                        }
                        None => diffs.push(format!("{key}: missing in actual response")),
                    }
                }
            }
            (Value::Null, _) => {}
            _ => compare_at("", expected, actual, &mut diffs),
        }
        Verification { diffs }
    }
}

fn compare_headers(expected: &Value, actual: &Value, diffs: &mut Vec<String>) {
    let (Some(expected), Some(actual)) = (expected.as_object(), actual.as_object()) else {
        compare_at("headers", expected, actual, diffs);
        return;
    };
    for (name, expected_value) in expected {
        let found = actual
            .iter()
            .find(|(actual_name, _)| actual_name.eq_ignore_ascii_case(name));
        match found {
            Some((_, actual_value)) => {
                compare_at(&format!("headers.{name}"), expected_value, actual_value, diffs)
            }
            None => diffs.push(format!("headers.{name}: missing in actual response")),
        }
    }
}

fn compare_at(path: &str, expected: &Value, actual: &Value, diffs: &mut Vec<String>) {
    if expected.as_str() == Some(ANYTHING_PRESENT) {
        return;
    }
    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => {
            compare_objects(path, expected, actual, diffs)
        }
        (Value::Array(expected), Value::Array(actual)) => {
            compare_arrays(path, expected, actual, diffs)
        }
        _ if expected != actual => {
            diffs.push(format!("{path}: expected {expected}, actual {actual}"))
        }
        _ => {}
    }
}

fn compare_objects(
    path: &str,
    expected: &Map<String, Value>,
    actual: &Map<String, Value>,
    diffs: &mut Vec<String>,
) {
    for (key, expected_value) in expected {
        let field = join(path, key);
        match actual.get(key) {
            Some(actual_value) => compare_at(&field, expected_value, actual_value, diffs),
            None => diffs.push(format!("{field}: missing in actual response")),
        }
    }
    for key in actual.keys().filter(|key| !expected.contains_key(*key)) {
        diffs.push(format!("{}: unexpected field", join(path, key)));
    }
}

fn compare_arrays(path: &str, expected: &[Value], actual: &[Value], diffs: &mut Vec<String>) {
    // A bad metadata record fails this collection only.
    let config = match CollectionVerificationConfig::derive(Some(expected)) {
        Ok(config) => config,
        Err(err) => {
            diffs.push(format!("{path}: invalid verification metadata: {err}"));
            return;
        }
    };
    let data = match expected.split_first() {
        Some((first, rest)) if is_metadata_record(first) => rest,
        _ => expected,
    };
    CollectionMatcher {
        path,
        config: &config,
        actual,
        used: vec![false; actual.len()],
        last_paired: None,
    }
    .run(data, diffs);
}

struct CollectionMatcher<'a> {
    path: &'a str,
    config: &'a CollectionVerificationConfig,
    actual: &'a [Value],
    used: Vec<bool>,
    last_paired: Option<usize>,
}

impl CollectionMatcher<'_> {
    fn run(mut self, expected: &[Value], diffs: &mut Vec<String>) {
        let ordered = self.config.ordering() == Ordering::Ordered;

        for (index, element) in expected.iter().enumerate() {
            let element_path = format!("{}[{index}]", self.path);
            let Some(paired) = self.pair(index, element) else {
                diffs.push(format!("{element_path}: no matching element in actual {element}"));
                continue;
            };
            self.used[paired] = true;
            if ordered {
                if self.last_paired.is_some_and(|last| paired < last) {
                    diffs.push(format!(
                        "{element_path}: found at position {paired}, out of order"
                    ));
                }
                self.last_paired = Some(paired);
            }
            compare_at(&element_path, element, &self.actual[paired], diffs);
        }

        if self.config.operator() == Operator::Equivalent {
            for (index, element) in self.actual.iter().enumerate() {
                if !self.used[index] {
                    diffs.push(format!("{}[{index}]: unexpected element {element}", self.path));
                }
            }
        }
    }

    /// Index of the actual element `expected` should be compared with.
    fn pair(&self, index: usize, expected: &Value) -> Option<usize> {
        if let Some(identity) = self.identity_of(expected) {
            return self.free().find(|&candidate| {
                self.identity_of(&self.actual[candidate]).as_ref() == Some(&identity)
            });
        }

        let matching = |candidate: &usize| {
            let mut scratch = Vec::new();
            compare_at("", expected, &self.actual[*candidate], &mut scratch);
            scratch.is_empty()
        };

        match self.config.ordering() {
            Ordering::Unordered => self.free().find(matching),
            Ordering::Ordered => {
                let after = self.last_paired.map_or(0, |last| last + 1);
                self.free()
                    .filter(|candidate| *candidate >= after)
                    .find(matching)
                    // Fall back to position so the mismatch is reported
                    // field by field.
                    .or_else(|| {
                        (index < self.actual.len() && !self.used[index]).then_some(index)
                    })
            }
        }
    }

    fn free(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.actual.len()).filter(|index| !self.used[*index])
    }

    /// Values of the identifier fields, if the element carries all of
    /// them.
    fn identity_of<'v>(&self, element: &'v Value) -> Option<Vec<&'v Value>> {
        let map = element.as_object()?;
        let identity: Option<Vec<&Value>> = self
            .config
            .element_identifier_fields()
            .map(|field| map.get(field))
            .collect();
        identity.filter(|values| !values.is_empty())
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}
