mod common;

use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, DatabaseConnection, DbBackend, FromQueryResult, Statement};
use tree_behavior::{TreeError, TreeRepository, UnitOfWork};

mod entity {
    pub mod node {
        use sea_orm::entity::prelude::*;
        use tree_behavior::TreeModel;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TreeModel)]
        #[sea_orm(table_name = "nodes")]
        #[tree(strategy = "closure", child_count = "child_count", level = "lvl")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub name: String,
            pub child_count: i32,
            pub lvl: i32,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod folder {
        use sea_orm::entity::prelude::*;
        use tree_behavior::TreeModel;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TreeModel)]
        #[sea_orm(table_name = "folders")]
        #[tree(
            strategy = "closure",
            closure_table = "folder_paths",
            ancestor = "ancestor",
            descendant = "descendant",
            depth = "distance",
            level = "lvl",
            dependent = "nullify"
        )]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub name: String,
            pub lvl: i32,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{folder, node};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER NULL,
        name TEXT NOT NULL,
        child_count INTEGER NOT NULL,
        lvl INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE nodes_closure (
        ancestor_id INTEGER NOT NULL,
        descendant_id INTEGER NOT NULL,
        depth INTEGER NOT NULL,
        PRIMARY KEY (ancestor_id, descendant_id)
    )
    "#,
    r#"
    CREATE TABLE folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER NULL,
        name TEXT NOT NULL,
        lvl INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE folder_paths (
        ancestor INTEGER NOT NULL,
        descendant INTEGER NOT NULL,
        distance INTEGER NOT NULL,
        PRIMARY KEY (ancestor, descendant)
    )
    "#,
];

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, FromQueryResult)]
struct Total {
    total: i64,
}

async fn rows_in(db: &DatabaseConnection, table: &str) -> Result<i64, DbErr> {
    let sql = format!("SELECT COUNT(*) AS total FROM {table}");
    let total = Total::find_by_statement(Statement::from_string(DbBackend::Sqlite, sql))
        .one(db)
        .await?
        .map(|row| row.total)
        .unwrap_or_default();
    Ok(total)
}

fn node(name: &str) -> node::ActiveModel {
    node::ActiveModel {
        name: Set(name.to_owned()),
        ..Default::default()
    }
}

fn folder(name: &str) -> folder::ActiveModel {
    folder::ActiveModel {
        name: Set(name.to_owned()),
        ..Default::default()
    }
}

async fn find(db: &DatabaseConnection, name: &str) -> Result<node::Model, DbErr> {
    node::Entity::find()
        .filter(node::Column::Name.eq(name))
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(name.to_owned()))
}

async fn find_folder(db: &DatabaseConnection, name: &str) -> Result<folder::Model, DbErr> {
    folder::Entity::find()
        .filter(folder::Column::Name.eq(name))
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(name.to_owned()))
}

fn names(nodes: &[node::Model]) -> Vec<&str> {
    nodes.iter().map(|node| node.name.as_str()).collect()
}

/// Root ── A ── A1
///     └── B
async fn seed(db: &DatabaseConnection) -> TestResult {
    let mut uow = UnitOfWork::<node::Model>::new();
    let root = uow.persist(node("Root"));
    let a = uow.persist_under(node("A"), &root);
    uow.persist_under(node("B"), &root);
    uow.persist_under(node("A1"), &a);
    uow.flush(db).await?;
    Ok(())
}

#[tokio::test]
async fn inserts_link_every_ancestor() -> TestResult {
    common::init_tracing();
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    // 1 + 2 + 2 + 3 rows, self rows included.
    assert_eq!(rows_in(&db, "nodes_closure").await?, 8);

    let root = find(&db, "Root").await?;
    let a = find(&db, "A").await?;
    let a1 = find(&db, "A1").await?;
    assert_eq!((root.child_count, root.lvl), (2, 0));
    assert_eq!((a.child_count, a.lvl), (1, 1));
    assert_eq!((a1.child_count, a1.lvl), (0, 2));
    Ok(())
}

#[tokio::test]
async fn queries_walk_the_closure_rows() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;
    let repo = TreeRepository::<node::Model>::new();

    let root = find(&db, "Root").await?;
    let a1 = find(&db, "A1").await?;
    assert_eq!(names(&repo.descendants(&db, &root).await?), vec!["A", "B", "A1"]);
    assert_eq!(names(&repo.ancestors(&db, &a1).await?), vec!["Root", "A"]);
    assert_eq!(names(&repo.path(&db, &a1).await?), vec!["Root", "A", "A1"]);
    assert_eq!(names(&repo.children(&db, &root, true).await?), vec!["A", "B"]);
    assert_eq!(names(&repo.roots(&db).await?), vec!["Root"]);
    assert_eq!(repo.child_count(&db, &root, false).await?, 3);
    assert_eq!(repo.child_count(&db, &root, true).await?, 2);

    let a = find(&db, "A").await?;
    assert_eq!(names(&repo.siblings(&db, &a, false).await?), vec!["B"]);
    Ok(())
}

#[tokio::test]
async fn reparenting_grafts_the_whole_subtree() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    let mut uow = UnitOfWork::<node::Model>::new();
    uow.reparent(&find(&db, "A").await?, Some(&find(&db, "B").await?));
    uow.flush(&db).await?;

    // Root-A and Root-A1 replaced by Root-A, Root-A1, B-A, B-A1.
    assert_eq!(rows_in(&db, "nodes_closure").await?, 10);

    let repo = TreeRepository::<node::Model>::new();
    let a1 = find(&db, "A1").await?;
    assert_eq!(names(&repo.ancestors(&db, &a1).await?), vec!["Root", "B", "A"]);
    assert_eq!(a1.lvl, 3);
    assert_eq!(find(&db, "Root").await?.child_count, 1);
    assert_eq!(find(&db, "B").await?.child_count, 1);

    // And to the top level.
    let mut uow = UnitOfWork::<node::Model>::new();
    uow.reparent(&find(&db, "A").await?, None);
    uow.flush(&db).await?;

    let a = find(&db, "A").await?;
    assert_eq!(a.lvl, 0);
    assert_eq!(find(&db, "A1").await?.lvl, 1);
    assert_eq!(names(&repo.roots(&db).await?), vec!["Root", "A"]);
    assert_eq!(rows_in(&db, "nodes_closure").await?, 6);
    Ok(())
}

#[tokio::test]
async fn moving_under_a_descendant_is_rejected() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    let mut uow = UnitOfWork::<node::Model>::new();
    uow.reparent(&find(&db, "Root").await?, Some(&find(&db, "A1").await?));
    let err = uow.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::CyclicParent { .. }), "{err}");

    assert_eq!(find(&db, "Root").await?.parent_id, None);
    assert_eq!(rows_in(&db, "nodes_closure").await?, 8);
    Ok(())
}

#[tokio::test]
async fn deleting_destroys_the_subtree() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    let mut uow = UnitOfWork::<node::Model>::new();
    uow.remove(&find(&db, "A").await?);
    uow.flush(&db).await?;

    assert!(find(&db, "A1").await.is_err());
    assert_eq!(node::Entity::find().count(&db).await?, 2);
    assert_eq!(rows_in(&db, "nodes_closure").await?, 3);
    assert_eq!(find(&db, "Root").await?.child_count, 1);
    Ok(())
}

#[tokio::test]
async fn deleting_with_nullify_detaches_the_children() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;

    let mut uow = UnitOfWork::<folder::Model>::new();
    let root = uow.persist(folder("Root"));
    let docs = uow.persist_under(folder("Docs"), &root);
    let drafts = uow.persist_under(folder("Drafts"), &docs);
    uow.persist_under(folder("Old"), &drafts);
    uow.flush(&db).await?;
    assert_eq!(rows_in(&db, "folder_paths").await?, 10);

    let mut uow = UnitOfWork::<folder::Model>::new();
    uow.remove(&find_folder(&db, "Docs").await?);
    uow.flush(&db).await?;

    let drafts = find_folder(&db, "Drafts").await?;
    let old = find_folder(&db, "Old").await?;
    assert_eq!((drafts.parent_id, drafts.lvl), (None, 0));
    assert_eq!((old.parent_id, old.lvl), (Some(drafts.id), 1));
    // Root, Drafts, Old self rows plus Drafts-Old.
    assert_eq!(rows_in(&db, "folder_paths").await?, 4);

    let repo = TreeRepository::<folder::Model>::new();
    let roots = repo.roots(&db).await?;
    let names: Vec<_> = roots.iter().map(|folder| folder.name.as_str()).collect();
    assert_eq!(names, vec!["Root", "Drafts"]);
    Ok(())
}

#[tokio::test]
async fn rebuild_regenerates_rows_from_parent_references() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;
    common::execute(&db, "DELETE FROM nodes_closure WHERE depth > 0").await?;
    common::execute(&db, "UPDATE nodes SET child_count = 0, lvl = 0").await?;

    let repo = TreeRepository::<node::Model>::new();
    assert_eq!(repo.rebuild(&db).await?, 4);
    assert_eq!(rows_in(&db, "nodes_closure").await?, 8);

    let a1 = find(&db, "A1").await?;
    assert_eq!(a1.lvl, 2);
    assert_eq!(names(&repo.ancestors(&db, &a1).await?), vec!["Root", "A"]);
    assert_eq!(find(&db, "Root").await?.child_count, 2);
    Ok(())
}

#[tokio::test]
async fn interval_operations_are_not_available() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;
    let repo = TreeRepository::<node::Model>::new();
    let a = find(&db, "A").await?;

    let err = repo.move_up(&db, &a, None).await.unwrap_err();
    assert!(matches!(
        err,
        TreeError::UnsupportedOperation {
            operation: "move_up",
            ..
        }
    ));
    assert!(matches!(
        repo.recover(&db).await.unwrap_err(),
        TreeError::UnsupportedOperation { .. }
    ));
    Ok(())
}
