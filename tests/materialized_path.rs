mod common;

use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, DatabaseConnection, IntoActiveModel};
use tree_behavior::{TreeError, TreeRepository, UnitOfWork};

mod entity {
    pub mod page {
        use sea_orm::entity::prelude::*;
        use tree_behavior::TreeModel;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TreeModel)]
        #[sea_orm(table_name = "pages")]
        #[tree(
            strategy = "materialized_path",
            path_source = "slug",
            separator = "/",
            level = "lvl"
        )]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub slug: String,
            pub path: String,
            pub lvl: i32,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod section {
        use sea_orm::entity::prelude::*;
        use tree_behavior::TreeModel;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TreeModel)]
        #[sea_orm(table_name = "sections")]
        #[tree(
            strategy = "materialized_path",
            path_source = "title",
            path = "trail",
            append_id = true,
            dependent = "nullify"
        )]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub title: String,
            pub trail: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod topic {
        use sea_orm::entity::prelude::*;
        use tree_behavior::TreeModel;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TreeModel)]
        #[sea_orm(table_name = "topics")]
        #[tree(strategy = "materialized_path", path_source = "slug", dependent = "nullify")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub slug: String,
            pub path: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{page, section, topic};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE pages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER NULL,
        slug TEXT NOT NULL,
        path TEXT NOT NULL,
        lvl INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE sections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER NULL,
        title TEXT NOT NULL,
        trail TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE topics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER NULL,
        slug TEXT NOT NULL,
        path TEXT NOT NULL
    )
    "#,
];

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn page(slug: &str) -> page::ActiveModel {
    page::ActiveModel {
        slug: Set(slug.to_owned()),
        ..Default::default()
    }
}

fn section(title: &str) -> section::ActiveModel {
    section::ActiveModel {
        title: Set(title.to_owned()),
        ..Default::default()
    }
}

async fn find(db: &DatabaseConnection, slug: &str) -> Result<page::Model, DbErr> {
    page::Entity::find()
        .filter(page::Column::Slug.eq(slug))
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(slug.to_owned()))
}

/// `(path, level)` as stored.
async fn stored(db: &DatabaseConnection, slug: &str) -> Result<(String, i32), DbErr> {
    let page = find(db, slug).await?;
    Ok((page.path, page.lvl))
}

fn at(path: &str, level: i32) -> (String, i32) {
    (path.to_owned(), level)
}

fn slugs(pages: &[page::Model]) -> Vec<&str> {
    pages.iter().map(|page| page.slug.as_str()).collect()
}

/// food ── fruits ── apples
///     └── vegetables
async fn seed(db: &DatabaseConnection) -> TestResult {
    let mut uow = UnitOfWork::<page::Model>::new();
    let food = uow.persist(page("food"));
    let fruits = uow.persist_under(page("fruits"), &food);
    uow.persist_under(page("apples"), &fruits);
    uow.persist_under(page("vegetables"), &food);
    uow.flush(db).await?;
    Ok(())
}

#[tokio::test]
async fn inserts_compose_paths_from_the_parent() -> TestResult {
    common::init_tracing();
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    assert_eq!(stored(&db, "food").await?, at("food/", 0));
    assert_eq!(stored(&db, "fruits").await?, at("food/fruits/", 1));
    assert_eq!(stored(&db, "apples").await?, at("food/fruits/apples/", 2));
    assert_eq!(stored(&db, "vegetables").await?, at("food/vegetables/", 1));
    Ok(())
}

#[tokio::test]
async fn renaming_the_source_rewrites_descendant_paths() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    let mut active = find(&db, "food").await?.into_active_model();
    active.slug = Set("foods".to_owned());
    let mut uow = UnitOfWork::<page::Model>::new();
    uow.update(active);
    uow.flush(&db).await?;

    assert_eq!(stored(&db, "foods").await?, at("foods/", 0));
    assert_eq!(stored(&db, "fruits").await?, at("foods/fruits/", 1));
    assert_eq!(stored(&db, "apples").await?, at("foods/fruits/apples/", 2));
    assert_eq!(stored(&db, "vegetables").await?, at("foods/vegetables/", 1));
    Ok(())
}

#[tokio::test]
async fn reparenting_moves_the_prefix() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    let mut uow = UnitOfWork::<page::Model>::new();
    uow.reparent(&find(&db, "fruits").await?, Some(&find(&db, "vegetables").await?));
    uow.flush(&db).await?;
    assert_eq!(stored(&db, "fruits").await?, at("food/vegetables/fruits/", 2));
    assert_eq!(stored(&db, "apples").await?, at("food/vegetables/fruits/apples/", 3));

    let mut uow = UnitOfWork::<page::Model>::new();
    uow.reparent(&find(&db, "fruits").await?, None);
    uow.flush(&db).await?;
    assert_eq!(stored(&db, "fruits").await?, at("fruits/", 0));
    assert_eq!(stored(&db, "apples").await?, at("fruits/apples/", 1));
    assert_eq!(stored(&db, "vegetables").await?, at("food/vegetables/", 1));
    Ok(())
}

#[tokio::test]
async fn moving_under_a_descendant_is_rejected() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    let mut uow = UnitOfWork::<page::Model>::new();
    uow.reparent(&find(&db, "food").await?, Some(&find(&db, "apples").await?));
    let err = uow.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::CyclicParent { .. }), "{err}");

    let food = find(&db, "food").await?;
    assert_eq!((food.parent_id, food.path.as_str()), (None, "food/"));
    Ok(())
}

#[tokio::test]
async fn separator_in_the_source_rolls_back_the_flush() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;

    let mut uow = UnitOfWork::<page::Model>::new();
    let food = uow.persist(page("food"));
    uow.persist_under(page("fruit/veg"), &food);
    let err = uow.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::InvalidPathSource(ref source) if source == "fruit/veg"));

    assert_eq!(page::Entity::find().count(&db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn sibling_paths_must_be_unique() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    let food = find(&db, "food").await?;
    let mut duplicate = page("fruits");
    duplicate.parent_id = Set(Some(food.id));
    let mut uow = UnitOfWork::<page::Model>::new();
    uow.persist(duplicate);
    let err = uow.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::Invariant(_)), "{err}");
    assert_eq!(page::Entity::find().count(&db).await?, 4);
    Ok(())
}

#[tokio::test]
async fn deleting_destroys_the_subtree() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;

    let mut uow = UnitOfWork::<page::Model>::new();
    uow.remove(&find(&db, "fruits").await?);
    uow.flush(&db).await?;

    assert!(find(&db, "apples").await.is_err());
    assert_eq!(page::Entity::find().count(&db).await?, 2);
    Ok(())
}

#[tokio::test]
async fn queries_match_path_prefixes() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;
    seed(&db).await?;
    let repo = TreeRepository::<page::Model>::new();

    let food = find(&db, "food").await?;
    let apples = find(&db, "apples").await?;
    assert_eq!(
        slugs(&repo.descendants(&db, &food).await?),
        vec!["fruits", "apples", "vegetables"]
    );
    assert_eq!(slugs(&repo.ancestors(&db, &apples).await?), vec!["food", "fruits"]);
    assert_eq!(slugs(&repo.path(&db, &apples).await?), vec!["food", "fruits", "apples"]);
    assert_eq!(repo.child_count(&db, &food, false).await?, 3);
    assert_eq!(repo.child_count(&db, &food, true).await?, 2);
    assert_eq!(
        repo.parent(&db, &apples).await?.map(|page| page.slug),
        Some("fruits".to_owned())
    );
    assert!(repo.descendants(&db, &apples).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn nullify_promotes_children_with_id_suffixed_segments() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;

    let mut uow = UnitOfWork::<section::Model>::new();
    let docs = uow.persist(section("docs"));
    let api = uow.persist_under(section("api"), &docs);
    let v1 = uow.persist_under(section("v1"), &api);
    let outcome = uow.flush(&db).await?;

    let docs = outcome.get(&docs).cloned().ok_or("docs")?;
    let api = outcome.get(&api).cloned().ok_or("api")?;
    let v1 = outcome.get(&v1).cloned().ok_or("v1")?;
    assert_eq!(docs.trail, format!("docs-{},", docs.id));
    assert_eq!(api.trail, format!("docs-{},api-{},", docs.id, api.id));
    assert_eq!(v1.trail, format!("docs-{},api-{},v1-{},", docs.id, api.id, v1.id));

    let mut uow = UnitOfWork::<section::Model>::new();
    uow.remove(&docs);
    uow.flush(&db).await?;

    let api = section::Entity::find_by_id(api.id).one(&db).await?.ok_or("api")?;
    let v1 = section::Entity::find_by_id(v1.id).one(&db).await?.ok_or("v1")?;
    assert_eq!(api.parent_id, None);
    assert_eq!(api.trail, format!("api-{},", api.id));
    assert_eq!(v1.trail, format!("api-{},v1-{},", api.id, v1.id));
    Ok(())
}

#[tokio::test]
async fn prefixes_match_case_sensitively() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;

    let mut uow = UnitOfWork::<page::Model>::new();
    let lower = uow.persist(page("food"));
    uow.persist_under(page("apples"), &lower);
    let upper = uow.persist(page("Food"));
    uow.persist_under(page("pears"), &upper);
    uow.flush(&db).await?;

    let repo = TreeRepository::<page::Model>::new();
    let food = find(&db, "food").await?;
    let upper = find(&db, "Food").await?;
    assert_eq!(slugs(&repo.descendants(&db, &food).await?), vec!["apples"]);
    assert_eq!(repo.child_count(&db, &upper, false).await?, 1);

    let mut active = upper.into_active_model();
    active.slug = Set("Drinks".to_owned());
    let mut uow = UnitOfWork::<page::Model>::new();
    uow.update(active);
    uow.flush(&db).await?;
    assert_eq!(stored(&db, "apples").await?, at("food/apples/", 1));
    assert_eq!(stored(&db, "pears").await?, at("Drinks/pears/", 1));

    let mut uow = UnitOfWork::<page::Model>::new();
    uow.remove(&food);
    uow.flush(&db).await?;

    let mut left = slugs(&page::Entity::find().all(&db).await?)
        .into_iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    left.sort();
    assert_eq!(left, vec!["Drinks", "pears"]);
    Ok(())
}

#[tokio::test]
async fn promoted_children_cannot_take_an_existing_path() -> TestResult {
    let db = common::sqlite(SCHEMA).await?;

    let mut uow = UnitOfWork::<topic::Model>::new();
    uow.persist(topic::ActiveModel {
        slug: Set("fruits".to_owned()),
        ..Default::default()
    });
    let food = uow.persist(topic::ActiveModel {
        slug: Set("food".to_owned()),
        ..Default::default()
    });
    let nested = uow.persist_under(
        topic::ActiveModel {
            slug: Set("fruits".to_owned()),
            ..Default::default()
        },
        &food,
    );
    let outcome = uow.flush(&db).await?;
    let food = outcome.get(&food).cloned().ok_or("food")?;
    let nested = outcome.get(&nested).cloned().ok_or("nested fruits")?;
    assert_eq!(nested.path, "food,fruits,");

    let mut uow = UnitOfWork::<topic::Model>::new();
    uow.remove(&food);
    let err = uow.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::Invariant(_)), "{err}");

    assert_eq!(topic::Entity::find().count(&db).await?, 3);
    let nested = topic::Entity::find_by_id(nested.id).one(&db).await?.ok_or("nested")?;
    assert_eq!((nested.parent_id, nested.path.as_str()), (Some(food.id), "food,fruits,"));
    Ok(())
}
