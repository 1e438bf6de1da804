//! Conversions between SeaORM [`Value`]s and the plain integers and strings
//! the tree algorithms work with.

use sea_orm::Value;

use crate::error::TreeError;

/// Integer content of a value, `None` for SQL `NULL` and non-integer values.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::TinyInt(Some(v)) => Some(i64::from(*v)),
        Value::SmallInt(Some(v)) => Some(i64::from(*v)),
        Value::Int(Some(v)) => Some(i64::from(*v)),
        Value::BigInt(Some(v)) => Some(*v),
        Value::TinyUnsigned(Some(v)) => Some(i64::from(*v)),
        Value::SmallUnsigned(Some(v)) => Some(i64::from(*v)),
        Value::Unsigned(Some(v)) => Some(i64::from(*v)),
        Value::BigUnsigned(Some(v)) => i64::try_from(*v).ok(),
        _ => None,
    }
}

/// Textual content of a value; integers are rendered in decimal.
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(Some(v)) => Some(v.to_string()),
        Value::Char(Some(v)) => Some(v.to_string()),
        other => as_i64(other).map(|v| v.to_string()),
    }
}

pub fn is_null(value: &Value) -> bool {
    match value {
        Value::Bool(v) => v.is_none(),
        Value::TinyInt(v) => v.is_none(),
        Value::SmallInt(v) => v.is_none(),
        Value::Int(v) => v.is_none(),
        Value::BigInt(v) => v.is_none(),
        Value::TinyUnsigned(v) => v.is_none(),
        Value::SmallUnsigned(v) => v.is_none(),
        Value::Unsigned(v) => v.is_none(),
        Value::BigUnsigned(v) => v.is_none(),
        Value::String(v) => v.is_none(),
        Value::Char(v) => v.is_none(),
        _ => false,
    }
}

/// Stable key identifying a tree scope, used to group nodes in memory.
pub fn scope_key(value: &Value) -> String {
    as_string(value).unwrap_or_else(|| format!("{value:?}"))
}

/// Field types the derive macro knows how to assign from a [`Value`].
pub trait TreeFieldType: Sized {
    fn from_tree_value(value: &Value) -> Option<Self>;
}

macro_rules! integer_field {
    ($($ty:ty),*) => {
        $(
            impl TreeFieldType for $ty {
                fn from_tree_value(value: &Value) -> Option<Self> {
                    as_i64(value).and_then(|v| <$ty>::try_from(v).ok())
                }
            }

            impl TreeFieldType for Option<$ty> {
                fn from_tree_value(value: &Value) -> Option<Self> {
                    if is_null(value) {
                        return Some(None);
                    }
                    <$ty as TreeFieldType>::from_tree_value(value).map(Some)
                }
            }
        )*
    };
}

integer_field!(i16, i32, i64, u16, u32, u64);

impl TreeFieldType for String {
    fn from_tree_value(value: &Value) -> Option<Self> {
        as_string(value)
    }
}

impl TreeFieldType for Option<String> {
    fn from_tree_value(value: &Value) -> Option<Self> {
        if is_null(value) {
            return Some(None);
        }
        as_string(value).map(Some)
    }
}

/// Convert `value` for assignment to `field`, failing loudly on a mismatch.
pub fn convert<T: TreeFieldType>(field: &str, value: Value) -> Result<T, TreeError> {
    T::from_tree_value(&value).ok_or_else(|| TreeError::FieldType {
        field: field.to_string(),
        value: format!("{value:?}"),
    })
}
