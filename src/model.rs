//! Test data model: one call definition per `_guid_`, its request,
//! and the expected/actual response trees.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marker left in request fields that are filled in later by hand
/// or by the player itself. Never substituted by injection.
pub const DYNAMIC_SENTINEL: &str = "[[DYNAMIC]]";

/// A single HTTP call definition, as loaded from a `.td.json` or
/// `.td.yaml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpTestData {
    /// Unique id of the call definition.
    #[serde(rename = "_guid_")]
    pub guid: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Free-text statements of what the call checks.
    #[serde(default)]
    pub specs: Vec<String>,
    /// Calls that must complete before this one; each becomes a
    /// child context.
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub method: HttpMethod,
    /// URI template; `{name}` segments are filled from path
    /// variables.
    #[serde(default)]
    pub uri: String,
    /// The user the call is made as.
    #[serde(default)]
    pub user: Option<UserData>,
    #[serde(default)]
    pub request: RequestData,
    /// `{ responseCode, headers, body }`.
    #[serde(default)]
    pub expected_response: Value,
    /// Absent until the call executes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_response: Option<Value>,
}

impl HttpTestData {
    /// Minimal call definition, mostly useful in tests.
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            title: None,
            specs: Vec::new(),
            prerequisites: Vec::new(),
            method: HttpMethod::default(),
            uri: String::new(),
            user: None,
            request: RequestData::default(),
            expected_response: Value::Null,
            actual_response: None,
        }
    }
}

/// Outbound request parts. Every part is a JSON tree so injected
/// values may be objects or arrays, not only scalars.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    #[serde(default)]
    pub path_variables: Map<String, Value>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default, alias = "queryParams")]
    pub query: Map<String, Value>,
    #[serde(default)]
    pub body: Value,
}

impl RequestData {
    /// The request as a single JSON tree, as exposed to references
    /// through `[testData][request]`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "pathVariables".into(),
            Value::Object(self.path_variables.clone()),
        );
        map.insert("headers".into(), Value::Object(self.headers.clone()));
        map.insert("query".into(), Value::Object(self.query.clone()));
        map.insert("body".into(), self.body.clone());
        Value::Object(map)
    }
}

/// A prerequisite call: either a bare guid (the context takes the
/// guid as its name) or a `{ contextName: guid }` mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Prerequisite {
    Guid(String),
    Named(Map<String, Value>),
}

impl Prerequisite {
    /// `(context name, guid)` pairs declared by this entry.
    pub fn entries(&self) -> Vec<(String, String)> {
        match self {
            Prerequisite::Guid(guid) => vec![(guid.clone(), guid.clone())],
            Prerequisite::Named(map) => map
                .iter()
                .map(|(name, guid)| {
                    let guid = match guid {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (name.clone(), guid)
                })
                .collect(),
        }
    }
}

/// Credentials as they appear in test data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// An authenticated user, visible to references through
/// `[theInvokingUser]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub email: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl UserIdentity {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("email".into(), Value::String(self.email.clone()));
        // `username` is kept as an alias of `email` for test data
        // written against either name.
        map.insert("username".into(), Value::String(self.email.clone()));
        if let Some(password) = &self.password {
            map.insert("password".into(), Value::String(password.clone()));
        }
        if let Some(token) = &self.access_token {
            map.insert("accessToken".into(), Value::String(token.clone()));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

/// Response handed back by a dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchedResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Value,
}

impl DispatchedResponse {
    /// `{ responseCode, headers, body }`, the shape expected
    /// responses are written in.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("responseCode".into(), Value::from(self.status));
        map.insert("headers".into(), Value::Object(self.headers.clone()));
        map.insert("body".into(), self.body.clone());
        Value::Object(map)
    }
}

/// Outcome of one executed call (one context in the tree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResult {
    pub context: String,
    pub guid: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub diffs: Vec<String>,
    pub duration_ms: u64,
}

/// Outcome of one scenario: the scenario's own call plus every
/// prerequisite call, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
    pub calls: Vec<CallResult>,
    pub duration_ms: u64,
}
