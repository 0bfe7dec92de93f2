// packages/runify/src/realm.rs
//! Host-side realm bookkeeping
//!
//! The engine owns the actual isolated contexts. This tree mirrors the
//! realms the host created so that destruction cascades children-first and
//! caller teardown callbacks run exactly once, whichever side initiated it.
//!
//! ```text
//! root (0)
//! ├─ 1
//! │  └─ 3      destroy(1) → [3, 1]
//! └─ 2
//! ```

use crate::utils::errors::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Opaque realm handle, unique within one agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RealmId(u64);

impl RealmId {
    /// The implicit root realm of every session
    pub const ROOT: RealmId = RealmId(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Teardown callback run when a realm is destroyed
pub type DestroyCallback = Box<dyn FnOnce(RealmId) + Send + 'static>;

/// Options for `create_realm`
#[derive(Default)]
pub struct RealmOptions {
    /// Bindings installed in the new realm before any user code runs
    pub globals: serde_json::Map<String, serde_json::Value>,

    /// Appended to the new realm's teardown list
    pub destroy: Option<DestroyCallback>,
}

impl RealmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    pub fn on_destroy(mut self, callback: impl FnOnce(RealmId) + Send + 'static) -> Self {
        self.destroy = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for RealmOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmOptions")
            .field("globals", &self.globals)
            .field("destroy", &self.destroy.is_some())
            .finish()
    }
}

/// Callbacks of realms that were just destroyed, children first
#[must_use = "destroy callbacks only run when the teardown is run"]
pub struct Teardown {
    order: Vec<RealmId>,
    callbacks: Vec<(RealmId, DestroyCallback)>,
}

impl Teardown {
    /// Realms torn down, in cascade order
    pub fn order(&self) -> &[RealmId] {
        &self.order
    }

    /// Run every callback and return the cascade order
    pub fn run(self) -> Vec<RealmId> {
        for (realm, callback) in self.callbacks {
            // a panicking callback must not skip the ones after it
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(realm))).is_err()
            {
                warn!("Destroy callback for realm {} panicked", realm);
            }
        }
        self.order
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("order", &self.order)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

struct RealmNode {
    /// Back-reference only; the parent owns this node, not the other way round
    parent: Option<RealmId>,
    children: Vec<RealmId>,
    on_destroy: Vec<DestroyCallback>,
    destroyed: bool,
}

/// Tree of every realm created in one session
pub struct RealmTree {
    nodes: HashMap<RealmId, RealmNode>,
    next_id: u64,
}

impl RealmTree {
    /// Create a tree holding only the root realm
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            RealmId::ROOT,
            RealmNode {
                parent: None,
                children: Vec::new(),
                on_destroy: Vec::new(),
                destroyed: false,
            },
        );

        Self { nodes, next_id: 1 }
    }

    /// Fail unless `id` names a live realm
    pub fn ensure_live(&self, id: RealmId) -> Result<()> {
        match self.nodes.get(&id) {
            Some(node) if node.destroyed => Err(HarnessError::RealmDestroyedError(id)),
            Some(_) => Ok(()),
            None => Err(HarnessError::UnknownRealm(id)),
        }
    }

    pub fn is_live(&self, id: RealmId) -> bool {
        self.ensure_live(id).is_ok()
    }

    /// Reserve the id a new child of `parent` will get
    pub fn next_child_id(&self, parent: RealmId) -> Result<RealmId> {
        self.ensure_live(parent)?;
        Ok(RealmId(self.next_id))
    }

    /// Record a child realm the backend has successfully created
    pub fn insert_child(
        &mut self,
        parent: RealmId,
        id: RealmId,
        on_destroy: Option<DestroyCallback>,
    ) -> Result<()> {
        self.ensure_live(parent)?;

        if self.nodes.contains_key(&id) {
            return Err(HarnessError::RealmCreationError(format!(
                "realm id {} already in use",
                id
            )));
        }

        self.nodes.insert(
            id,
            RealmNode {
                parent: Some(parent),
                children: Vec::new(),
                on_destroy: on_destroy.into_iter().collect(),
                destroyed: false,
            },
        );

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(id);
        }

        self.next_id = self.next_id.max(id.0 + 1);
        debug!("Realm {} created under {}", id, parent);
        Ok(())
    }

    pub fn parent(&self, id: RealmId) -> Option<RealmId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    /// Live children of a realm
    pub fn children(&self, id: RealmId) -> Vec<RealmId> {
        self.nodes
            .get(&id)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|c| self.is_live(*c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live realms below `id`, deepest first, ending with `id` itself
    pub fn cascade_order(&self, id: RealmId) -> Vec<RealmId> {
        let mut order = Vec::new();
        self.collect_post_order(id, &mut order);
        order
    }

    fn collect_post_order(&self, id: RealmId, order: &mut Vec<RealmId>) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.destroyed {
            return;
        }
        for child in &node.children {
            self.collect_post_order(*child, order);
        }
        order.push(id);
    }

    /// Mark `id` and its live descendants destroyed
    ///
    /// The returned [`Teardown`] holds their callbacks; run it once any
    /// lock around the tree is released, since callbacks may call back into
    /// the agent. Destroying an already destroyed realm yields an empty
    /// teardown.
    pub fn destroy(&mut self, id: RealmId) -> Result<Teardown> {
        if !self.nodes.contains_key(&id) {
            return Err(HarnessError::UnknownRealm(id));
        }

        let order = self.cascade_order(id);
        let mut callbacks = Vec::new();

        for realm in &order {
            if let Some(node) = self.nodes.get_mut(realm) {
                node.destroyed = true;
                callbacks.extend(node.on_destroy.drain(..).map(|cb| (*realm, cb)));
                debug!("Realm {} destroyed", realm);
            }
        }

        Ok(Teardown { order, callbacks })
    }

    /// Number of live realms, root included
    pub fn live_count(&self) -> usize {
        self.nodes.values().filter(|n| !n.destroyed).count()
    }
}

impl Default for RealmTree {
    fn default() -> Self {
        Self::new()
    }
}
