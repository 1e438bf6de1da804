use std::fmt::Debug;
use std::hash::Hash;
use std::str::FromStr;

use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ActiveValue, EntityTrait, FromQueryResult,
    IntoActiveModel, TryGetable, Value,
};

use crate::config::TreeConfig;
use crate::error::{ConfigError, TreeError};

/// Trait implemented by SeaORM `Model` types whose hierarchy is maintained by
/// one of the tree strategies.
///
/// Implementations are normally provided by the `#[derive(TreeModel)]` macro.
pub trait TreeModel:
    Clone + Debug + Send + Sync + 'static + IntoActiveModel<Self::ActiveModel> + FromQueryResult
{
    type Entity: EntityTrait<Model = Self>;
    type ActiveModel: ActiveModelTrait<Entity = Self::Entity> + ActiveModelBehavior + Send;
    type Id: Clone + Debug + Eq + Hash + Send + Sync + 'static + Into<Value> + TryGetable;

    /// Configuration for this model, built once and cached.
    fn tree_config() -> Result<&'static TreeConfig, ConfigError>;

    fn id(&self) -> Self::Id;
    fn parent_id(&self) -> Option<Self::Id>;
    fn set_parent(active: &mut Self::ActiveModel, parent: Option<Self::Id>);

    /// Primary key held by an active model, if any.
    fn active_id(active: &Self::ActiveModel) -> Option<Self::Id>;
    /// Parent reference held by an active model; `None` when unset.
    fn active_parent(active: &Self::ActiveModel) -> Option<Self::Id>;

    /// Current value of a plain field, `None` if the model has no such field.
    fn field_value(&self, field: &str) -> Option<Value>;

    /// Assign a plain field on an active model.
    fn set_field(active: &mut Self::ActiveModel, field: &str, value: Value)
        -> Result<(), TreeError>;
}

/// Resolve the tree metadata for `M`, checking every configured column
/// exists on the entity.
pub fn resolve_metadata<M: TreeModel>() -> Result<&'static TreeConfig, TreeError> {
    let config = M::tree_config()?;
    for column in config.node_columns() {
        column_of::<M>(config, column)?;
    }
    Ok(config)
}

pub(crate) type ColumnOf<M> = <<M as TreeModel>::Entity as EntityTrait>::Column;

pub(crate) fn column_of<M: TreeModel>(
    config: &TreeConfig,
    name: &str,
) -> Result<ColumnOf<M>, ConfigError> {
    ColumnOf::<M>::from_str(name).map_err(|_| ConfigError::UnknownColumn {
        entity: config.entity_name().to_string(),
        column: name.to_string(),
    })
}

/// Value staged on an active model for `field`, if it was explicitly set.
pub(crate) fn staged_value<M: TreeModel>(
    config: &TreeConfig,
    active: &M::ActiveModel,
    field: &str,
) -> Result<Option<Value>, TreeError> {
    let column = column_of::<M>(config, field)?;
    Ok(match active.get(column) {
        ActiveValue::Set(value) => Some(value),
        _ => None,
    })
}

pub(crate) fn id_value<M: TreeModel>(id: &M::Id) -> Value {
    id.clone().into()
}
