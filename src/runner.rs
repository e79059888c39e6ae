//! Scenario execution.

use crate::comparator::{JsonComparator, StructuralComparator};
use crate::config::TestDataStore;
use crate::context::{ContextId, ContextTree};
use crate::identity::IdentityProvider;
use crate::injector::DynamicValueInjector;
use crate::model::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Sends a fully injected call.
#[async_trait]
pub trait HttpDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        test_data: &HttpTestData,
        user: Option<&UserIdentity>,
    ) -> Result<DispatchedResponse>;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Plays scenarios: prerequisites first, then injection, dispatch
/// and verification of each call.
pub struct Player {
    dispatcher: Arc<dyn HttpDispatcher>,
    identity: Arc<dyn IdentityProvider>,
    comparator: Arc<dyn StructuralComparator>,
    custom_values: Map<String, Value>,
}

/// State of one scenario run.
struct Run<'s> {
    store: &'s TestDataStore,
    tree: ContextTree,
    /// Guids currently being executed, outermost first.
    stack: Vec<String>,
    calls: Vec<CallResult>,
}

impl Player {
    pub fn new(dispatcher: Arc<dyn HttpDispatcher>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            dispatcher,
            identity,
            comparator: Arc::new(JsonComparator),
            custom_values: Map::new(),
        }
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn StructuralComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Value exposed to every context through `[customValues]`.
    pub fn with_custom_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom_values.insert(key.into(), value);
        self
    }

    /// Run the scenario defined by `guid`.
    ///
    /// Fails only when `guid` is unknown; call failures are reported
    /// in the result.
    #[instrument(skip(self, store))]
    pub async fn run(&self, store: &TestDataStore, guid: &str) -> Result<ScenarioResult> {
        let start_time = Instant::now();
        let data = store
            .get(guid)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown test data guid '{guid}'"))?;

        info!("Starting scenario: {}", guid);

        let mut tree = ContextTree::new();
        let root = tree.add_root(guid, data);
        tree.node_mut(root).custom_values = self.custom_values.clone();

        let mut run = Run {
            store,
            tree,
            stack: vec![guid.to_string()],
            calls: Vec::new(),
        };
        let outcome = self.execute(&mut run, root).await;

        let result = ScenarioResult {
            name: guid.to_string(),
            success: outcome.is_ok(),
            error: outcome.err(),
            calls: run.calls,
            duration_ms: start_time.elapsed().as_millis() as u64,
        };

        info!(
            "Scenario finished: {} ({} ms) - Success: {}",
            result.name, result.duration_ms, result.success
        );
        Ok(result)
    }

    /// Execute the context `id` after its prerequisites. Stops at the
    /// first failing call.
    fn execute<'a, 's: 'a>(
        &'a self,
        run: &'a mut Run<'s>,
        id: ContextId,
    ) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let step_start = Instant::now();
            // Descendants inherit the user, so it must be known before
            // any prerequisite runs.
            if let Err(err) = self.authenticate(&mut run.tree, id).await {
                self.record(run, id, step_start, Err(err.clone()));
                return Err(err);
            }

            let prerequisites: Vec<(String, String)> = run
                .tree
                .node(id)
                .test_data
                .prerequisites
                .iter()
                .flat_map(Prerequisite::entries)
                .collect();

            for (name, guid) in prerequisites {
                let outcome = self.execute_prerequisite(run, id, &name, &guid).await;
                if let Err(err) = outcome {
                    let err = format!("prerequisite '{name}' failed: {err}");
                    self.record(run, id, step_start, Err(err.clone()));
                    return Err(err);
                }
            }

            let outcome = self.call(&mut run.tree, id).await;
            let success = matches!(&outcome, Ok(diffs) if diffs.is_empty());
            self.record(run, id, step_start, outcome);
            if success {
                Ok(())
            } else {
                let name = &run.tree.node(id).name;
                Err(format!("call '{name}' failed"))
            }
        })
    }

    async fn execute_prerequisite(
        &self,
        run: &mut Run<'_>,
        parent: ContextId,
        name: &str,
        guid: &str,
    ) -> Result<(), String> {
        if run.stack.iter().any(|running| running == guid) {
            return Err(format!("prerequisite cycle through '{guid}'"));
        }
        let data = run
            .store
            .get(guid)
            .cloned()
            .ok_or_else(|| format!("unknown test data guid '{guid}'"))?;
        let child = run
            .tree
            .add_child(parent, name, data)
            .map_err(|e| e.to_string())?;
        run.tree.node_mut(child).custom_values = self.custom_values.clone();

        debug!("Running prerequisite '{}' ({})", name, guid);
        run.stack.push(guid.to_string());
        let outcome = self.execute(run, child).await;
        run.stack.pop();
        outcome
    }

    /// Set the invoking user of `id` from its test data, if it names
    /// one.
    async fn authenticate(&self, tree: &mut ContextTree, id: ContextId) -> Result<(), String> {
        let Some(user) = tree.node(id).test_data.user.clone() else {
            return Ok(());
        };
        let identity = self
            .identity
            .authenticate(&user)
            .await
            .map_err(|e| format!("authentication failed: {e:#}"))?;
        tree.node_mut(id).invoking_user = Some(identity);
        Ok(())
    }

    /// Inject, dispatch and verify one context. Returns the
    /// verification diffs.
    async fn call(&self, tree: &mut ContextTree, id: ContextId) -> Result<Vec<String>, String> {
        DynamicValueInjector::new(tree, id)
            .inject_data_from_context()
            .map_err(|e| e.to_string())?;

        let response = {
            let node = tree.node(id);
            let user = tree.invoking_user(id);
            self.dispatcher
                .dispatch(&node.test_data, user)
                .await
                .map_err(|e| format!("dispatch failed: {e:#}"))?
        };

        let actual = response.to_value();
        let node = tree.node_mut(id);
        let verification = self
            .comparator
            .compare(&node.test_data.expected_response, &actual);
        node.test_data.actual_response = Some(actual);

        for diff in &verification.diffs {
            warn!("{}: {}", node.name, diff);
        }
        Ok(verification.diffs)
    }

    fn record(
        &self,
        run: &mut Run<'_>,
        id: ContextId,
        started: Instant,
        outcome: Result<Vec<String>, String>,
    ) {
        let node = run.tree.node(id);
        let (success, error, diffs) = match outcome {
            Ok(diffs) => (diffs.is_empty(), None, diffs),
            Err(err) => {
                error!("Call '{}' failed: {}", node.name, err);
                (false, Some(err), Vec::new())
            }
        };
        run.calls.push(CallResult {
            context: node.name.clone(),
            guid: node.test_data.guid.clone(),
            success,
            error,
            diffs,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}
