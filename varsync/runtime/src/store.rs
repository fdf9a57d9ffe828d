use std::collections::HashMap;

use serde_json::Value;

use crate::error::SyncError;
use crate::protocol::Properties;
use crate::variable::{IdVendor, NO_PARENT, VarId, Variable};

#[derive(Debug, Clone, Default)]
pub struct NewVariable {
    pub id: Option<VarId>,
    pub parent_id: VarId,
    pub value: Value,
    pub properties: Properties,
    pub unbound: bool,
}

#[derive(Debug)]
pub struct VariableStore {
    variables: HashMap<VarId, Variable>,
    children: HashMap<VarId, Vec<VarId>>,
    vendor: IdVendor,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self {
            variables: HashMap::new(),
            children: HashMap::new(),
            vendor: IdVendor::backend(),
        }
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vendor(vendor: IdVendor) -> Self {
        Self {
            vendor,
            ..Self::default()
        }
    }

    pub fn vend_id(&mut self) -> VarId {
        self.vendor.next()
    }

    pub fn insert(&mut self, entry: NewVariable) -> Result<VarId, SyncError> {
        let id = match entry.id {
            Some(id) => id,
            None => self.vend_id(),
        };
        self.check_new(id, entry.parent_id)?;

        let mut variable = Variable::new(id, entry.parent_id);
        variable.value = entry.value;
        variable.unbound = entry.unbound;
        variable.apply_properties(&entry.properties);

        self.variables.insert(id, variable);
        if entry.parent_id != NO_PARENT {
            self.children.entry(entry.parent_id).or_default().push(id);
        }
        self.vendor.observe(id);

        tracing::debug!(id, parent = entry.parent_id, "variable created");
        Ok(id)
    }

    pub fn check_new(&self, id: VarId, parent_id: VarId) -> Result<(), SyncError> {
        if id == NO_PARENT || self.variables.contains_key(&id) {
            return Err(SyncError::DuplicateId(id));
        }
        if parent_id != NO_PARENT && !self.variables.contains_key(&parent_id) {
            return Err(SyncError::UnknownParent {
                id,
                parent: parent_id,
            });
        }
        Ok(())
    }

    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.variables.get(&id)
    }

    pub fn get_mut(&mut self, id: VarId) -> Option<&mut Variable> {
        self.variables.get_mut(&id)
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.variables.contains_key(&id)
    }

    pub fn update(
        &mut self,
        id: VarId,
        value: Option<Value>,
        properties: &Properties,
    ) -> Result<(), SyncError> {
        let variable = self
            .variables
            .get_mut(&id)
            .ok_or(SyncError::UnknownVariable(id))?;

        if let Some(value) = value {
            variable.value = value;
        }
        variable.apply_properties(properties);
        Ok(())
    }

    /// Removes `id` and its descendants, deepest and most recent first.
    /// Returns the removed ids in removal order; an unknown id removes nothing.
    pub fn destroy(&mut self, id: VarId) -> Vec<VarId> {
        let Some(parent_id) = self.variables.get(&id).map(|v| v.parent_id) else {
            return Vec::new();
        };

        let mut order = Vec::new();
        self.collect_bottom_up(id, &mut order);

        for removed in &order {
            self.children.remove(removed);
            self.variables.remove(removed);
        }

        if let Some(siblings) = self.children.get_mut(&parent_id) {
            siblings.retain(|child| *child != id);
        }

        tracing::debug!(id, removed = order.len(), "variable destroyed");
        order
    }

    fn collect_bottom_up(&self, id: VarId, order: &mut Vec<VarId>) {
        if let Some(children) = self.children.get(&id) {
            for child in children.iter().rev() {
                self.collect_bottom_up(*child, order);
            }
        }
        order.push(id);
    }

    pub fn children(&self, id: VarId) -> &[VarId] {
        self.children.get(&id).map_or(&[], Vec::as_slice)
    }

    pub fn set_active(&mut self, id: VarId, active: bool) {
        if let Some(variable) = self.variables.get_mut(&id) {
            variable.active = active;
        }
    }

    pub fn lineage(&self, id: VarId) -> impl Iterator<Item = &Variable> + '_ {
        std::iter::successors(self.variables.get(&id), |variable| {
            self.variables.get(&variable.parent_id)
        })
    }

    pub fn is_tracked(&self, id: VarId) -> bool {
        let mut lineage = self.lineage(id).peekable();
        lineage.peek().is_some() && lineage.all(|v| v.active && !v.is_suspended())
    }

    pub fn is_suspended(&self, id: VarId) -> bool {
        self.lineage(id).any(Variable::is_suspended)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn ids(&self) -> Vec<VarId> {
        let mut ids: Vec<VarId> = self.variables.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
