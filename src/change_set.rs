use sea_orm::Value;

use crate::config::{TreeConfig, TreeLayout};
use crate::error::TreeError;
use crate::traits::{staged_value, TreeModel};

/// A single field change: stored value and the value about to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

/// Tree-relevant field changes of one scheduled update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<FieldChange>,
}

impl ChangeSet {
    /// Compare the stored row against the values explicitly set on `active`.
    ///
    /// Only fields that influence the tree shape are inspected: the parent
    /// reference and, for materialized paths, the path source.
    pub fn detect<M: TreeModel>(
        config: &TreeConfig,
        stored: &M,
        active: &M::ActiveModel,
    ) -> Result<Self, TreeError> {
        let mut tracked = vec![config.parent_column()];
        if let TreeLayout::MaterializedPath(fields) = config.layout() {
            if fields.source() != config.id_column() {
                tracked.push(fields.source());
            }
        }

        let mut changes = Vec::new();
        for field in tracked {
            let Some(new) = staged_value::<M>(config, active, field)? else {
                continue;
            };
            let old = stored
                .field_value(field)
                .ok_or_else(|| TreeError::UnknownField(field.to_string()))?;
            if old != new {
                changes.push(FieldChange {
                    field: field.to_string(),
                    old,
                    new,
                });
            }
        }
        Ok(Self { changes })
    }

    pub fn from_changes(changes: Vec<FieldChange>) -> Self {
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changed(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|change| change.field == field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.changes.iter()
    }
}
