use std::collections::{HashMap, HashSet, VecDeque};

use sea_orm::sea_query::Query;
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, QueryOrder};
use tracing::info;

use super::{finish, TreeRepository};
use crate::error::TreeError;
use crate::query::{col_expr, execute, table};
use crate::strategy::ClosureTable;
use crate::traits::TreeModel;

impl<M> TreeRepository<M>
where
    M: TreeModel,
{
    /// Regenerate the whole closure table from the parent references.
    /// Returns the number of nodes linked.
    pub async fn rebuild(&self, db: &DatabaseConnection) -> Result<u64, TreeError> {
        let closure = self.closure("rebuild")?;
        let guard = self.lock(db).await?;
        let result = self.rebuild_on(guard.connection(), closure).await;
        finish(guard, result).await
    }

    async fn rebuild_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        closure: ClosureTable<'static>,
    ) -> Result<u64, TreeError> {
        let config = self.config()?;

        let mut delete = Query::delete();
        delete.from_table(table(closure.fields().table()));
        let cleared = execute(conn, &delete).await?;

        let rows = M::Entity::find()
            .order_by_asc(col_expr(config.id_column()))
            .all(conn)
            .await?;
        let ids: HashSet<M::Id> = rows.iter().map(|row| row.id()).collect();
        let mut children: HashMap<M::Id, Vec<M::Id>> = HashMap::new();
        let mut queue: VecDeque<(M::Id, Option<M::Id>)> = VecDeque::new();
        for row in &rows {
            match row.parent_id().filter(|parent| ids.contains(parent)) {
                Some(parent) => children.entry(parent).or_default().push(row.id()),
                None => queue.push_back((row.id(), None)),
            }
        }

        // Parents are always linked before their children.
        let mut linked = 0;
        while let Some((id, parent)) = queue.pop_front() {
            closure
                .link::<M, C>(conn, &id, parent.as_ref(), false)
                .await?;
            linked += 1;
            for child in children.remove(&id).unwrap_or_default() {
                queue.push_back((child, Some(id.clone())));
            }
        }
        if linked != rows.len() as u64 {
            return Err(TreeError::invariant(format!(
                "{} node(s) are not reachable from any root",
                rows.len() as u64 - linked
            )));
        }

        closure.refresh_derived(conn).await?;
        info!(
            entity = config.entity_name(),
            cleared, linked, "rebuilt closure table"
        );
        Ok(linked)
    }
}
