//! How an expected collection is compared with the actual one.
//!
//! An expected collection may open with a metadata record such as
//!
//! ```json
//! {"__operator__": "SUBSET", "__ordering__": "UNORDERED", "__elementId__": "id,name"}
//! ```
//!
//! which is not data. Without one, [`CollectionVerificationConfig::DEFAULT`]
//! applies.

use crate::error::InvalidTestData;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

pub const OPERATOR_FIELD_NAME: &str = "__operator__";
pub const ORDERING_FIELD_NAME: &str = "__ordering__";
pub const ELEMENT_ID_FIELD_NAME: &str = "__elementId__";

const RESERVED_FIELD_NAMES: [&str; 3] = [
    OPERATOR_FIELD_NAME,
    ORDERING_FIELD_NAME,
    ELEMENT_ID_FIELD_NAME,
];

const DEFAULT_IDENTIFIER_FIELDS: &[Cow<'static, str>] = &[Cow::Borrowed("id")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    /// Actual must hold exactly the expected elements.
    Equivalent,
    /// Actual must hold at least the expected elements.
    Subset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Ordering {
    Ordered,
    Unordered,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Equivalent => "EQUIVALENT",
            Operator::Subset => "SUBSET",
        }
    }
}

impl Ordering {
    pub fn as_str(self) -> &'static str {
        match self {
            Ordering::Ordered => "ORDERED",
            Ordering::Unordered => "UNORDERED",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Ordering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = InvalidTestData;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EQUIVALENT" => Ok(Operator::Equivalent),
            "SUBSET" => Ok(Operator::Subset),
            other => Err(InvalidTestData::UnknownEnumValue {
                key: OPERATOR_FIELD_NAME,
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for Ordering {
    type Err = InvalidTestData;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ORDERED" => Ok(Ordering::Ordered),
            "UNORDERED" => Ok(Ordering::Unordered),
            other => Err(InvalidTestData::UnknownEnumValue {
                key: ORDERING_FIELD_NAME,
                value: other.to_string(),
            }),
        }
    }
}

/// Comparison semantics for one collection. Immutable; compared and
/// hashed structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionVerificationConfig {
    operator: Operator,
    ordering: Ordering,
    element_identifier_fields: Cow<'static, [Cow<'static, str>]>,
}

impl CollectionVerificationConfig {
    pub const DEFAULT: Self = Self {
        operator: Operator::Equivalent,
        ordering: Ordering::Ordered,
        element_identifier_fields: Cow::Borrowed(DEFAULT_IDENTIFIER_FIELDS),
    };

    /// `element_identifier` is a comma-separated field list; empty
    /// means elements are compared whole.
    pub fn new(operator: Operator, ordering: Ordering, element_identifier: &str) -> Self {
        let fields: Vec<Cow<'static, str>> = element_identifier
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| Cow::Owned(f.to_string()))
            .collect();
        Self {
            operator,
            ordering,
            element_identifier_fields: Cow::Owned(fields),
        }
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn ordering(&self) -> Ordering {
        self.ordering
    }

    pub fn element_identifier_fields(&self) -> impl Iterator<Item = &str> {
        self.element_identifier_fields.iter().map(|f| f.as_ref())
    }

    /// Comma-joined identifier fields.
    pub fn element_identifier(&self) -> String {
        self.element_identifier_fields().collect::<Vec<_>>().join(",")
    }

    /// Work out the config for an expected collection.
    ///
    /// Yields [`Self::DEFAULT`] when the collection is absent, empty,
    /// or does not open with a metadata record.
    pub fn derive<E: CollectionElement>(raw: Option<&[E]>) -> Result<Self, InvalidTestData> {
        let Some((first, rest)) = raw.and_then(<[E]>::split_first) else {
            return Ok(Self::DEFAULT);
        };

        let metadata = match first.classify() {
            // Suspect path kept for compatibility: an already derived
            // config in first position is ignored, not returned.
            ElementKind::Config(_) => return Ok(Self::DEFAULT),
            ElementKind::Record(map) if map.contains_key(OPERATOR_FIELD_NAME) => map,
            ElementKind::Record(_) | ElementKind::Other(_) => return Ok(Self::DEFAULT),
        };

        let operator: Operator = string_field(metadata, OPERATOR_FIELD_NAME)?
            .unwrap_or_default()
            .parse()?;
        let ordering = match string_field(metadata, ORDERING_FIELD_NAME)? {
            Some(name) => name.parse()?,
            None => Ordering::Ordered,
        };

        if let Some(explicit) = metadata.get(ELEMENT_ID_FIELD_NAME) {
            let fields = match explicit {
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s.as_str()),
                        other => Err(InvalidTestData::NotAString {
                            key: ELEMENT_ID_FIELD_NAME,
                            value: other.to_string(),
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?
                    .join(","),
                other => {
                    return Err(InvalidTestData::NotAString {
                        key: ELEMENT_ID_FIELD_NAME,
                        value: other.to_string(),
                    })
                }
            };
            return Ok(Self::new(operator, ordering, &fields));
        }

        let records: Vec<&Value> = rest
            .iter()
            .filter_map(|element| match element.classify() {
                ElementKind::Config(_) => None,
                ElementKind::Record(_) | ElementKind::Other(_) => element.as_value(),
            })
            .collect();

        if records.is_empty() {
            return Ok(Self {
                operator,
                ordering,
                ..Self::DEFAULT
            });
        }

        let fields = infer_identifier_fields(&records)?;
        Ok(Self::new(operator, ordering, &fields.join(",")))
    }
}

impl Default for CollectionVerificationConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for CollectionVerificationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} by [{}]",
            self.operator,
            self.ordering,
            self.element_identifier()
        )
    }
}

/// How the first element of a collection is classified.
pub enum ElementKind<'a> {
    /// An already derived config.
    Config(&'a CollectionVerificationConfig),
    /// A mapping: either a metadata record or a data record.
    Record(&'a Map<String, Value>),
    /// Any other value.
    Other(&'a Value),
}

/// An element of an expected collection.
pub trait CollectionElement {
    fn classify(&self) -> ElementKind<'_>;

    /// The element as data, if it is data.
    fn as_value(&self) -> Option<&Value>;
}

impl CollectionElement for Value {
    fn classify(&self) -> ElementKind<'_> {
        match self {
            Value::Object(map) => ElementKind::Record(map),
            other => ElementKind::Other(other),
        }
    }

    fn as_value(&self) -> Option<&Value> {
        Some(self)
    }
}

/// A collection element that may already have been interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Config(CollectionVerificationConfig),
    Data(Value),
}

impl From<Value> for Element {
    fn from(value: Value) -> Self {
        Element::Data(value)
    }
}

impl CollectionElement for Element {
    fn classify(&self) -> ElementKind<'_> {
        match self {
            Element::Config(config) => ElementKind::Config(config),
            Element::Data(value) => value.classify(),
        }
    }

    fn as_value(&self) -> Option<&Value> {
        match self {
            Element::Config(_) => None,
            Element::Data(value) => Some(value),
        }
    }
}

/// True when `value` is a metadata record rather than data.
pub fn is_metadata_record(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.contains_key(OPERATOR_FIELD_NAME))
}

fn string_field<'m>(
    map: &'m Map<String, Value>,
    key: &'static str,
) -> Result<Option<&'m str>, InvalidTestData> {
    match map.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(InvalidTestData::NotAString {
            key,
            value: other.to_string(),
        }),
    }
}

/// Sorted field names common to every record, checked to identify
/// each record uniquely. Non-mapping records are compared whole.
fn infer_identifier_fields(records: &[&Value]) -> Result<Vec<String>, InvalidTestData> {
    let maps: Option<Vec<&Map<String, Value>>> =
        records.iter().map(|record| record.as_object()).collect();
    let Some(maps) = maps else {
        return Ok(Vec::new());
    };

    let mut common: Option<BTreeSet<&str>> = None;
    for map in &maps {
        let keys: BTreeSet<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|key| !RESERVED_FIELD_NAMES.contains(key))
            .collect();
        common = Some(match common {
            None => keys,
            Some(common) => common.intersection(&keys).copied().collect(),
        });
    }
    let fields: Vec<&str> = common.unwrap_or_default().into_iter().collect();
    if fields.is_empty() {
        return Err(InvalidTestData::NoCommonFields);
    }

    let mut seen: HashMap<Vec<String>, usize> = HashMap::new();
    for (index, map) in maps.iter().enumerate() {
        // Every field is present: `fields` is the intersection.
        let key: Vec<String> = fields
            .iter()
            .filter_map(|f| map.get(*f))
            .map(Value::to_string)
            .collect();
        if let Some(previous) = seen.insert(key, index) {
            return Err(InvalidTestData::AmbiguousIdentity {
                fields: fields.join(","),
                first: records[previous].to_string(),
                second: records[index].to_string(),
            });
        }
    }

    Ok(fields.into_iter().map(str::to_string).collect())
}
