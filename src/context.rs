//! Scenario context tree.
//!
//! Contexts live in an arena owned by [`ContextTree`] and are
//! addressed by [`ContextId`]. Children are kept in insertion order,
//! which is also execution order. The parent link is a plain id and
//! is only followed to find the invoking user; name lookups always
//! walk towards children.

use crate::error::ContextError;
use crate::model::{HttpTestData, UserIdentity};
use serde_json::{Map, Value};

/// Handle to a context inside a [`ContextTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(usize);

/// One executed (or executing) call.
#[derive(Debug, Clone)]
pub struct ContextNode {
    pub name: String,
    pub test_data: HttpTestData,
    pub invoking_user: Option<UserIdentity>,
    /// Values exposed through `[customValues]`.
    pub custom_values: Map<String, Value>,
    parent: Option<ContextId>,
    children: Vec<(String, ContextId)>,
}

impl ContextNode {
    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    /// Children in execution order.
    pub fn children(&self) -> impl Iterator<Item = (&str, ContextId)> {
        self.children.iter().map(|(name, id)| (name.as_str(), *id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextTree {
    nodes: Vec<ContextNode>,
}

impl ContextTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context with no parent.
    pub fn add_root(
        &mut self,
        name: impl Into<String>,
        test_data: HttpTestData,
    ) -> ContextId {
        self.push(name.into(), test_data, None)
    }

    /// Attach a new child context under `parent`.
    pub fn add_child(
        &mut self,
        parent: ContextId,
        name: impl Into<String>,
        test_data: HttpTestData,
    ) -> Result<ContextId, ContextError> {
        let name = name.into();
        if self.child(parent, &name).is_some() {
            return Err(ContextError::DuplicateChild {
                parent: self.node(parent).name.clone(),
                name,
            });
        }
        let id = self.push(name.clone(), test_data, Some(parent));
        self.nodes[parent.0].children.push((name, id));
        Ok(id)
    }

    fn push(
        &mut self,
        name: String,
        test_data: HttpTestData,
        parent: Option<ContextId>,
    ) -> ContextId {
        let id = ContextId(self.nodes.len());
        self.nodes.push(ContextNode {
            name,
            test_data,
            invoking_user: None,
            custom_values: Map::new(),
            parent,
            children: Vec::new(),
        });
        id
    }

    // Ids are only minted by this tree, so indexing cannot fail.
    pub fn node(&self, id: ContextId) -> &ContextNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: ContextId) -> &mut ContextNode {
        &mut self.nodes[id.0]
    }

    /// Direct child of `parent` called `name`.
    pub fn child(&self, parent: ContextId, name: &str) -> Option<ContextId> {
        self.node(parent)
            .children
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, id)| *id)
    }

    /// Follow `path` child by child starting at `from`. An empty path
    /// is `from` itself.
    pub fn descend<S: AsRef<str>>(
        &self,
        from: ContextId,
        path: &[S],
    ) -> Result<ContextId, (String, String)> {
        let mut current = from;
        for name in path {
            let name = name.as_ref();
            current = self.child(current, name).ok_or_else(|| {
                (name.to_string(), self.node(current).name.clone())
            })?;
        }
        Ok(current)
    }

    /// The user a context runs as: its own, or the nearest
    /// ancestor's.
    pub fn invoking_user(&self, id: ContextId) -> Option<&UserIdentity> {
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node(id);
            if let Some(user) = &node.invoking_user {
                return Some(user);
            }
            current = node.parent;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
