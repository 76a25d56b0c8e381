#![allow(dead_code)]

use async_trait::async_trait;
use rusqlite::Row;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stowage_core::{
    expect_integer, expect_optional_integer, expect_optional_text, expect_text, open_store_in_memory,
    BulkEngine, BulkOptions, Cancellation, Entity, EntitySchema, FieldSelector, RepoResult,
    Repository, RepositoryOptions, SqliteBulkEngine, SqliteSession, SqliteStore, TrackingMode,
    Value,
};
use uuid::Uuid;

pub const SCHEMA_SQL: &str = "
    CREATE TABLE articles (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        views INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE enrollments (
        course TEXT NOT NULL,
        student INTEGER NOT NULL,
        grade TEXT,
        PRIMARY KEY (course, student)
    );
    CREATE TABLE tickets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        status TEXT NOT NULL
    );
";

pub static ARTICLE_SCHEMA: EntitySchema = EntitySchema {
    name: "article",
    table: "articles",
    fields: &["id", "title", "body", "views"],
    primary_key: &["id"],
    generated_key: None,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub body: String,
    pub views: i64,
}

impl Article {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            body: body.to_string(),
            views: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ArticleField {
    Id,
    Title,
    Body,
    Views,
}

impl FieldSelector for ArticleField {
    fn field_name(&self) -> &str {
        match self {
            Self::Id => "id",
            Self::Title => "title",
            Self::Body => "body",
            Self::Views => "views",
        }
    }
}

impl Entity for Article {
    fn schema() -> &'static EntitySchema {
        &ARTICLE_SCHEMA
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::Text(self.id.clone())),
            "title" => Some(Value::Text(self.title.clone())),
            "body" => Some(Value::Text(self.body.clone())),
            "views" => Some(Value::Integer(self.views)),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: Value) -> RepoResult<()> {
        match name {
            "id" => self.id = expect_text("article", name, value)?,
            "title" => self.title = expect_text("article", name, value)?,
            "body" => self.body = expect_text("article", name, value)?,
            "views" => self.views = expect_integer("article", name, value)?,
            _ => {}
        }
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            body: row.get("body")?,
            views: row.get("views")?,
        })
    }
}

pub static ENROLLMENT_SCHEMA: EntitySchema = EntitySchema {
    name: "enrollment",
    table: "enrollments",
    fields: &["course", "student", "grade"],
    primary_key: &["course", "student"],
    generated_key: None,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub course: String,
    pub student: i64,
    pub grade: Option<String>,
}

impl Enrollment {
    pub fn new(course: &str, student: i64) -> Self {
        Self {
            course: course.to_string(),
            student,
            grade: None,
        }
    }
}

impl Entity for Enrollment {
    fn schema() -> &'static EntitySchema {
        &ENROLLMENT_SCHEMA
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "course" => Some(Value::Text(self.course.clone())),
            "student" => Some(Value::Integer(self.student)),
            "grade" => Some(self.grade.clone().map_or(Value::Null, Value::Text)),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: Value) -> RepoResult<()> {
        match name {
            "course" => self.course = expect_text("enrollment", name, value)?,
            "student" => self.student = expect_integer("enrollment", name, value)?,
            "grade" => self.grade = expect_optional_text("enrollment", name, value)?,
            _ => {}
        }
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            course: row.get("course")?,
            student: row.get("student")?,
            grade: row.get("grade")?,
        })
    }
}

pub static TICKET_SCHEMA: EntitySchema = EntitySchema {
    name: "ticket",
    table: "tickets",
    fields: &["id", "title", "status"],
    primary_key: &["id"],
    generated_key: Some("id"),
};

#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub id: Option<i64>,
    pub title: String,
    pub status: String,
}

impl Ticket {
    pub fn new(title: &str) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            status: "open".to_string(),
        }
    }
}

impl Entity for Ticket {
    fn schema() -> &'static EntitySchema {
        &TICKET_SCHEMA
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.map_or(Value::Null, Value::Integer)),
            "title" => Some(Value::Text(self.title.clone())),
            "status" => Some(Value::Text(self.status.clone())),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: Value) -> RepoResult<()> {
        match name {
            "id" => self.id = expect_optional_integer("ticket", name, value)?,
            "title" => self.title = expect_text("ticket", name, value)?,
            "status" => self.status = expect_text("ticket", name, value)?,
            _ => {}
        }
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            status: row.get("status")?,
        })
    }
}

/// Call counters shared between a test and its `CountingBulk`.
#[derive(Debug, Clone, Default)]
pub struct BulkCalls {
    inserts: Arc<AtomicUsize>,
    updates: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
}

impl BulkCalls {
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

/// SQLite bulk engine that counts entry-point invocations.
pub struct CountingBulk {
    inner: SqliteBulkEngine,
    calls: BulkCalls,
}

#[async_trait]
impl BulkEngine for CountingBulk {
    async fn bulk_insert<E: Entity>(
        &self,
        records: &mut [E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize> {
        self.calls.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.bulk_insert(records, options, cancel).await
    }

    async fn bulk_update<E: Entity>(
        &self,
        records: &[E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize> {
        self.calls.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.bulk_update(records, options, cancel).await
    }

    async fn bulk_delete<E: Entity>(
        &self,
        records: &[E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.bulk_delete(records, options, cancel).await
    }
}

pub type CountingRepository<E> = Repository<E, SqliteSession, CountingBulk>;

pub async fn store() -> SqliteStore {
    let store = open_store_in_memory().unwrap();
    store.execute_batch(SCHEMA_SQL).await.unwrap();
    store
}

pub async fn repository<E: Entity>(store: &SqliteStore) -> Repository<E> {
    Repository::open(store, RepositoryOptions::default())
        .await
        .unwrap()
}

pub async fn counting_repository<E: Entity>(
    store: &SqliteStore,
    options: RepositoryOptions,
) -> (CountingRepository<E>, BulkCalls) {
    let calls = BulkCalls::default();
    let bulk = CountingBulk {
        inner: SqliteBulkEngine::new(store.clone()),
        calls: calls.clone(),
    };
    let repo = Repository::new(SqliteSession::new(store.clone()), bulk, options)
        .await
        .unwrap();
    (repo, calls)
}

/// Rows of `E` as currently stored, read through a fresh untracked session.
pub async fn stored<E: Entity>(store: &SqliteStore) -> Vec<E> {
    let mut reader = repository::<E>(store).await;
    let query = reader.query(TrackingMode::NoTracking);
    reader.fetch(query, &Cancellation::new()).await.unwrap()
}

pub async fn seed_articles(store: &SqliteStore, count: usize) -> Vec<Article> {
    let mut writer = repository::<Article>(store).await;
    let articles = (0..count)
        .map(|index| Article::new(&format!("title {index}"), &format!("body {index}")))
        .collect();
    writer
        .insert_batch(articles, true, &Cancellation::new())
        .await
        .unwrap()
}
