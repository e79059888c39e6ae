//! Placeholder references and their resolution against a context
//! tree.
//!
//! A reference token is a whole string value of the form
//!
//! ```text
//! ${[scenarioContext]([childContexts][<name>])*<source>([<field>])*}
//! ```
//!
//! where `<source>` is `[theInvokingUser]`, `[customValues]` or
//! `[testData]` followed by `[actualResponse]`, `[expectedResponse]`
//! or `[request]`. Strings not wrapped in `${ }` are literals.

use crate::context::{ContextId, ContextTree};
use crate::error::ReferenceError;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

const ROOT: &str = "scenarioContext";
const CHILD_CONTEXTS: &str = "childContexts";
const INVOKING_USER: &str = "theInvokingUser";
const CUSTOM_VALUES: &str = "customValues";
const TEST_DATA: &str = "testData";

/// What part of the target context a reference reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    InvokingUser,
    CustomValues,
    ActualResponse,
    ExpectedResponse,
    Request,
}

impl Source {
    fn segments(self) -> &'static [&'static str] {
        match self {
            Source::InvokingUser => &[INVOKING_USER],
            Source::CustomValues => &[CUSTOM_VALUES],
            Source::ActualResponse => &[TEST_DATA, "actualResponse"],
            Source::ExpectedResponse => &[TEST_DATA, "expectedResponse"],
            Source::Request => &[TEST_DATA, "request"],
        }
    }
}

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Child context names, walked from the current context. Empty
    /// means the current context.
    pub target_path: Vec<String>,
    pub source: Source,
    /// Keys or indices into the source value.
    pub field_path: Vec<String>,
    /// Which match to take when the field path matches more than one
    /// value. 1-based.
    pub occurrence: usize,
}

impl Reference {
    /// Parse `token`, which populates the field called `field_name`.
    ///
    /// Returns `Ok(None)` for literals. The occurrence index comes
    /// from a trailing `_<n>` on `field_name`.
    pub fn parse(
        token: &str,
        field_name: Option<&str>,
    ) -> Result<Option<Self>, ReferenceError> {
        let Some(inner) = token
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        else {
            return Ok(None);
        };

        let malformed = |reason: &str| ReferenceError::Malformed {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let segments = split_segments(inner).map_err(|r| malformed(&r))?;
        let mut segments = segments.into_iter().peekable();

        if segments.next().as_deref() != Some(ROOT) {
            return Err(malformed("must start with [scenarioContext]"));
        }

        let mut target_path = Vec::new();
        while segments.peek().map(String::as_str) == Some(CHILD_CONTEXTS) {
            segments.next();
            let name = segments
                .next()
                .ok_or_else(|| malformed("[childContexts] needs a context name"))?;
            target_path.push(name);
        }

        let source = match segments.next().as_deref() {
            Some(INVOKING_USER) => Source::InvokingUser,
            Some(CUSTOM_VALUES) => Source::CustomValues,
            Some(TEST_DATA) => match segments.next().as_deref() {
                Some("actualResponse") => Source::ActualResponse,
                Some("expectedResponse") => Source::ExpectedResponse,
                Some("request") => Source::Request,
                _ => {
                    return Err(malformed(
                        "[testData] must be followed by [actualResponse], \
                         [expectedResponse] or [request]",
                    ))
                }
            },
            Some(_) | None => {
                return Err(malformed(
                    "expected [theInvokingUser], [customValues] or [testData]",
                ))
            }
        };

        Ok(Some(Self {
            target_path,
            source,
            field_path: segments.collect(),
            occurrence: field_name.map_or(1, occurrence_from_field_name),
        }))
    }

    /// Evaluate against `tree`, relative to `current`.
    ///
    /// Reads only; resolving the same reference twice yields the same
    /// value.
    pub fn resolve(
        &self,
        tree: &ContextTree,
        current: ContextId,
    ) -> Result<Value, ReferenceError> {
        let target = tree.descend(current, &self.target_path).map_err(
            |(name, parent)| ReferenceError::UnknownContext { name, parent },
        )?;
        let node = tree.node(target);
        let context = node.name.as_str();

        let root: Cow<'_, Value> = match self.source {
            Source::InvokingUser => Cow::Owned(
                tree.invoking_user(target)
                    .ok_or_else(|| ReferenceError::NoInvokingUser {
                        context: context.to_string(),
                    })?
                    .to_value(),
            ),
            Source::CustomValues => {
                Cow::Owned(Value::Object(node.custom_values.clone()))
            }
            Source::ActualResponse => Cow::Borrowed(
                node.test_data.actual_response.as_ref().ok_or_else(|| {
                    ReferenceError::NoActualResponse {
                        context: context.to_string(),
                    }
                })?,
            ),
            Source::ExpectedResponse => {
                Cow::Borrowed(&node.test_data.expected_response)
            }
            Source::Request => Cow::Owned(node.test_data.request.to_value()),
        };

        let matches = select(&root, &self.field_path, context)?;
        let chosen = if matches.len() == 1 {
            matches[0]
        } else {
            self.occurrence
                .checked_sub(1)
                .and_then(|index| matches.get(index).copied())
                .ok_or_else(|| ReferenceError::OccurrenceOutOfRange {
                    context: context.to_string(),
                    path: self.field_path.join("."),
                    occurrence: self.occurrence,
                    matches: matches.len(),
                })?
        };

        Ok(chosen.clone())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{[{ROOT}]")?;
        for name in &self.target_path {
            write!(f, "[{CHILD_CONTEXTS}][{name}]")?;
        }
        for segment in self.source.segments() {
            write!(f, "[{segment}]")?;
        }
        for segment in &self.field_path {
            write!(f, "[{segment}]")?;
        }
        write!(f, "}}")
    }
}

/// `token_2` is occurrence 2; a name without a numeric suffix is 1.
pub fn occurrence_from_field_name(name: &str) -> usize {
    name.rsplit_once('_')
        .and_then(|(_, suffix)| suffix.parse::<usize>().ok())
        .unwrap_or(1)
}

fn split_segments(inner: &str) -> Result<Vec<String>, String> {
    let mut segments = Vec::new();
    let mut rest = inner;
    while !rest.is_empty() {
        let Some(body) = rest.strip_prefix('[') else {
            return Err(format!("unexpected text '{rest}'"));
        };
        let end = body
            .find(']')
            .ok_or_else(|| "unclosed '['".to_string())?;
        let segment = &body[..end];
        if segment.is_empty() {
            return Err("empty segment".into());
        }
        if segment.contains('[') {
            return Err(format!("nested '[' in segment '{segment}'"));
        }
        segments.push(segment.to_string());
        rest = &body[end + 1..];
    }
    if segments.is_empty() {
        return Err("no segments".into());
    }
    Ok(segments)
}

/// Apply `path` to `root`, collecting every value it reaches. A key
/// segment applied to a sequence fans out over the sequence's
/// mapping elements; a numeric segment indexes it.
fn select<'v>(
    root: &'v Value,
    path: &[String],
    context: &str,
) -> Result<Vec<&'v Value>, ReferenceError> {
    let mut current = vec![root];

    for (depth, segment) in path.iter().enumerate() {
        let walked = || path[..=depth].join(".");
        let single = current.len() == 1;
        let mut next = Vec::new();

        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(segment)),
                Value::Array(items) => match segment.parse::<usize>() {
                    Ok(index) => match items.get(index) {
                        Some(item) => next.push(item),
                        None if single => {
                            return Err(ReferenceError::IndexOutOfRange {
                                context: context.to_string(),
                                path: walked(),
                                index,
                                len: items.len(),
                            })
                        }
                        None => {}
                    },
                    Err(_) => next.extend(
                        items.iter().filter_map(|item| item.get(segment.as_str())),
                    ),
                },
                _ => {}
            }
        }

        if next.is_empty() {
            return Err(ReferenceError::MissingField {
                context: context.to_string(),
                path: walked(),
            });
        }
        current = next;
    }

    Ok(current)
}
