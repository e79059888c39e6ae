//! Substitution of placeholder references in a context's request.

use crate::context::{ContextId, ContextTree};
use crate::error::{InjectionError, ReferenceError};
use crate::model::RequestData;
use crate::reference::Reference;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

/// Resolves every placeholder in one context's request.
pub struct DynamicValueInjector<'t> {
    tree: &'t mut ContextTree,
    context: ContextId,
}

impl<'t> DynamicValueInjector<'t> {
    pub fn new(tree: &'t mut ContextTree, context: ContextId) -> Self {
        Self { tree, context }
    }

    /// Replace each reference token in the request (path variables,
    /// headers, query, body) with the value it resolves to.
    ///
    /// Either every placeholder is substituted or the request is left
    /// exactly as it was and the first failing field is reported.
    /// Strings that are not reference tokens, `[[DYNAMIC]]` included,
    /// are left alone.
    #[instrument(skip(self), fields(context = %self.tree.node(self.context).name))]
    pub fn inject_data_from_context(&mut self) -> Result<(), InjectionError> {
        let mut request = self.tree.node(self.context).test_data.request.clone();
        inject_request(self.tree, self.context, &mut request)?;
        self.tree.node_mut(self.context).test_data.request = request;
        Ok(())
    }
}

fn inject_request(
    tree: &ContextTree,
    context: ContextId,
    request: &mut RequestData,
) -> Result<(), InjectionError> {
    let walker = Walker { tree, context };
    walker.inject_map(&mut request.path_variables, "request.pathVariables")?;
    walker.inject_map(&mut request.headers, "request.headers")?;
    walker.inject_map(&mut request.query, "request.query")?;
    walker.inject_value(&mut request.body, None, "request.body")
}

struct Walker<'a> {
    tree: &'a ContextTree,
    context: ContextId,
}

impl Walker<'_> {
    fn inject_map(
        &self,
        map: &mut Map<String, Value>,
        path: &str,
    ) -> Result<(), InjectionError> {
        for (key, value) in map.iter_mut() {
            self.inject_value(value, Some(key.as_str()), &format!("{path}.{key}"))?;
        }
        Ok(())
    }

    fn inject_value(
        &self,
        value: &mut Value,
        field_name: Option<&str>,
        path: &str,
    ) -> Result<(), InjectionError> {
        match value {
            Value::String(token) => {
                let parsed =
                    Reference::parse(token, field_name).map_err(|e| self.fail(path, e))?;
                if let Some(reference) = parsed {
                    let resolved = reference
                        .resolve(self.tree, self.context)
                        .map_err(|e| self.fail(path, e))?;
                    debug!(field = path, %reference, "injected {}", resolved);
                    // The resolved value is taken as a literal and not
                    // scanned again.
                    *value = resolved;
                }
                Ok(())
            }
            Value::Object(map) => self.inject_map(map, path),
            Value::Array(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    self.inject_value(item, None, &format!("{path}[{index}]"))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn fail(&self, field: &str, source: ReferenceError) -> InjectionError {
        InjectionError {
            context: self.tree.node(self.context).name.clone(),
            field: field.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpTestData, UserIdentity, DYNAMIC_SENTINEL};
    use serde_json::json;

    const TOKEN_REF: &str = "${[scenarioContext][childContexts][Token_Creation_Call][testData][actualResponse][body][tokens][token]}";
    const EMAIL_REF: &str = "${[scenarioContext][theInvokingUser][email]}";

    fn scenario() -> (ContextTree, ContextId) {
        let mut data = HttpTestData::new("Simple-Test-Data-With-All-Possible-Dynamic-Values");
        data.request.path_variables = json!({
            "uid": DYNAMIC_SENTINEL,
            "email": EMAIL_REF,
            "token": TOKEN_REF,
            "token_2": TOKEN_REF,
        })
        .as_object()
        .cloned()
        .unwrap();
        data.request.body = json!({
            "event_token": TOKEN_REF,
            "data": {"owner": EMAIL_REF, "tags": ["x", EMAIL_REF]},
            "count": 3
        });

        let mut token_call = HttpTestData::new("Token_Creation_Call");
        token_call.actual_response = Some(json!({
            "body": {
                "tokens": [
                    {"token": "token value"},
                    {"token": "token value at index 2"}
                ],
                "details": {"a": [1, 2]}
            }
        }));

        let mut tree = ContextTree::new();
        let root = tree.add_root(data.guid.clone(), data);
        tree.add_child(root, "Token_Creation_Call", token_call).unwrap();
        tree.node_mut(root).invoking_user = Some(UserIdentity {
            email: "mutlu.sancaktutar@example.net".into(),
            password: None,
            access_token: None,
        });
        (tree, root)
    }

    #[test]
    fn test_injects_all_values() {
        let (mut tree, root) = scenario();
        DynamicValueInjector::new(&mut tree, root)
            .inject_data_from_context()
            .unwrap();

        let request = &tree.node(root).test_data.request;
        assert_eq!(request.path_variables["uid"], json!(DYNAMIC_SENTINEL));
        assert_eq!(
            request.path_variables["email"],
            json!("mutlu.sancaktutar@example.net")
        );
        assert_eq!(request.path_variables["token"], json!("token value"));
        assert_eq!(
            request.path_variables["token_2"],
            json!("token value at index 2")
        );
        assert_eq!(request.body["event_token"], json!("token value"));
        assert_eq!(
            request.body["data"]["tags"][1],
            json!("mutlu.sancaktutar@example.net")
        );
        assert_eq!(request.body["count"], json!(3));
    }

    #[test]
    fn test_injects_structured_values() {
        let (mut tree, root) = scenario();
        tree.node_mut(root).test_data.request.body = json!({
            "details": "${[scenarioContext][childContexts][Token_Creation_Call][testData][actualResponse][body][details]}"
        });
        DynamicValueInjector::new(&mut tree, root)
            .inject_data_from_context()
            .unwrap();
        assert_eq!(
            tree.node(root).test_data.request.body,
            json!({"details": {"a": [1, 2]}})
        );
    }

    #[test]
    fn test_injection_is_fixed_point_without_references() {
        let (mut tree, root) = scenario();
        let literal_request = RequestData {
            path_variables: json!({"uid": DYNAMIC_SENTINEL, "n": 1})
                .as_object()
                .cloned()
                .unwrap(),
            headers: json!({"Accept": "application/json"})
                .as_object()
                .cloned()
                .unwrap(),
            query: Map::new(),
            body: json!({"a": [null, true, "{not a ref}", {"b": "$x"}]}),
        };
        tree.node_mut(root).test_data.request = literal_request.clone();

        DynamicValueInjector::new(&mut tree, root)
            .inject_data_from_context()
            .unwrap();
        assert_eq!(tree.node(root).test_data.request, literal_request);
    }

    #[test]
    fn test_second_pass_changes_nothing() {
        let (mut tree, root) = scenario();
        DynamicValueInjector::new(&mut tree, root)
            .inject_data_from_context()
            .unwrap();
        let once = tree.node(root).test_data.request.clone();
        DynamicValueInjector::new(&mut tree, root)
            .inject_data_from_context()
            .unwrap();
        assert_eq!(tree.node(root).test_data.request, once);
    }

    #[test]
    fn test_failure_leaves_request_untouched() {
        let (mut tree, root) = scenario();
        tree.node_mut(root).test_data.request.headers.insert(
            "Authorization".into(),
            json!("${[scenarioContext][childContexts][Nope][testData][actualResponse][body]}"),
        );
        let before = tree.node(root).test_data.request.clone();

        let err = DynamicValueInjector::new(&mut tree, root)
            .inject_data_from_context()
            .unwrap_err();
        assert_eq!(err.field, "request.headers.Authorization");
        assert_eq!(
            err.source,
            ReferenceError::UnknownContext {
                name: "Nope".into(),
                parent: "Simple-Test-Data-With-All-Possible-Dynamic-Values".into(),
            }
        );
        assert_eq!(tree.node(root).test_data.request, before);
    }

    #[test]
    fn test_first_failing_field_in_source_order() {
        let (mut tree, root) = scenario();
        tree.node_mut(root).test_data.request.path_variables = json!({
            "zone": "${[scenarioContext][childContexts][Missing_Zone][testData][request]}",
            "area": "${[scenarioContext][childContexts][Missing_Area][testData][request]}",
        })
        .as_object()
        .cloned()
        .unwrap();

        let err = DynamicValueInjector::new(&mut tree, root)
            .inject_data_from_context()
            .unwrap_err();
        assert_eq!(err.field, "request.pathVariables.zone");
    }

    #[test]
    fn test_malformed_reference_aborts() {
        let (mut tree, root) = scenario();
        tree.node_mut(root).test_data.request.body = json!({"x": "${[scenarioContext]}"});
        let err = DynamicValueInjector::new(&mut tree, root)
            .inject_data_from_context()
            .unwrap_err();
        assert_eq!(err.field, "request.body.x");
        assert!(matches!(err.source, ReferenceError::Malformed { .. }));
    }
}
