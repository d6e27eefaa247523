//! Read-only access to the legacy Papers2 library database.
//!
//! Opens `<folder>/Library.papers2/Database.papersdb` over a read-only
//! SQLite pool and hydrates complete [`SourceRecord`]s: the publication
//! row plus authors, identifiers, URLs, keywords, collections, reviews,
//! attachment files, and the resolved bundle title. The id stream and the
//! per-record hydration are separate so a run holds one record in memory
//! at a time.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::kinds::{IdSource, KeywordKind, Label, PubKind, ALL_KIND_CODES};
use crate::models::{
    SourceAttachment, SourceAuthor, SourceIdentifier, SourceKeyword, SourceRecord, SourceReview,
};

/// Criteria for selecting publications to migrate.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Restrict to these row ids.
    pub ids: Option<Vec<i64>>,
    /// Case-insensitive substring over the full author string.
    pub author: Option<String>,
    /// Restrict to these kinds. `None` means every known kind.
    pub kinds: Option<Vec<PubKind>>,
    pub include_deleted: bool,
    pub include_duplicates: bool,
    pub include_manuscripts: bool,
}

pub struct Papers2 {
    pool: SqlitePool,
    folder: PathBuf,
    mine_reviews_only: bool,
}

impl Papers2 {
    /// Open the library database under `folder`, read-only.
    pub async fn open(folder: &Path, mine_reviews_only: bool) -> Result<Self> {
        let db_path = folder.join("Library.papers2").join("Database.papersdb");
        if !db_path.exists() {
            bail!("Source database not found: {}", db_path.display());
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open source database: {}", db_path.display()))?;

        Ok(Self {
            pool,
            folder: folder.to_path_buf(),
            mine_reviews_only,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Ids of all publications matching the filter, in row-id order.
    pub async fn record_ids(&self, filter: &RecordFilter) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT ROWID FROM Publication WHERE {} ORDER BY ROWID",
            filter_clause(filter)
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(author) = &filter.author {
            query = query.bind(format!("%{}%", author));
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Number of publications matching the filter.
    pub async fn count(&self, filter: &RecordFilter) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM Publication WHERE {}",
            filter_clause(filter)
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(author) = &filter.author {
            query = query.bind(format!("%{}%", author));
        }
        Ok(query.fetch_one(&self.pool).await?)
    }

    /// Hydrate one publication by row id.
    pub async fn record(&self, id: i64) -> Result<SourceRecord> {
        let row = sqlx::query(
            "SELECT ROWID, uuid, title, subtype, citekey, rating, notes, doi, summary, \
             imported_date, publication_date, version, number, bundle, bundle_string, \
             language, document_number, startpage, endpage, place, publisher, copyright, \
             volume, times_read, label \
             FROM Publication WHERE ROWID = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            bail!("No publication with id {}", id);
        };

        let kind = PubKind::from_code(row.get::<i64, _>("subtype"))?;
        let label = Label::from_code(row.get::<Option<i64>, _>("label").unwrap_or(0))?;
        let uuid: String = row.get::<Option<String>, _>("uuid").unwrap_or_default();

        let bundle_link: Option<String> = row.get("bundle");
        let resolved_bundle = self.resolve_bundle(bundle_link.as_deref()).await?;

        Ok(SourceRecord {
            id,
            title: row.get("title"),
            kind,
            citekey: row.get("citekey"),
            rating: row.get::<Option<i64>, _>("rating").unwrap_or(0),
            notes: row.get("notes"),
            doi: row.get("doi"),
            summary: row.get("summary"),
            imported_date: row
                .get::<Option<f64>, _>("imported_date")
                .map(|ts| ts as i64),
            publication_date: row.get("publication_date"),
            version: row.get("version"),
            number: row.get("number"),
            bundle_string: row.get("bundle_string"),
            resolved_bundle,
            language: row.get("language"),
            document_number: row.get("document_number"),
            start_page: row.get("startpage"),
            end_page: row.get("endpage"),
            place: row.get("place"),
            publisher: row.get("publisher"),
            copyright: row.get("copyright"),
            volume: row.get("volume"),
            times_read: row.get::<Option<i64>, _>("times_read").unwrap_or(0),
            label,
            authors: self.authors(id).await?,
            identifiers: self.identifiers(&uuid).await?,
            urls: self.urls(&uuid).await?,
            keywords: self.keywords(id).await?,
            collections: self.record_collections(id).await?,
            reviews: self.reviews(id).await?,
            attachments: self.attachments(id).await?,
            uuid,
        })
    }

    /// All collection names in the library (the two user-visible
    /// collection types), sorted.
    pub async fn collections(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT name FROM Collection WHERE type IN (0, 5) ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Follow the bundle link to the container publication's title.
    /// A dangling or non-numeric link resolves to nothing, never an error.
    async fn resolve_bundle(&self, link: Option<&str>) -> Result<Option<String>> {
        let Some(bundle_id) = link.and_then(|l| l.trim().parse::<i64>().ok()) else {
            return Ok(None);
        };
        let title: Option<Option<String>> =
            sqlx::query_scalar("SELECT title FROM Publication WHERE ROWID = ?")
                .bind(bundle_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(title.flatten())
    }

    async fn authors(&self, id: i64) -> Result<Vec<SourceAuthor>> {
        let rows = sqlx::query(
            "SELECT a.prename, a.surname, a.institutional, oa.type AS role \
             FROM Author a \
             JOIN OrderedAuthor oa ON a.ROWID = oa.author_id \
             WHERE oa.object_id = ? \
             ORDER BY oa.priority",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceAuthor {
                given: row.get("prename"),
                family: row.get::<Option<String>, _>("surname").unwrap_or_default(),
                role: row.get::<Option<i64>, _>("role").unwrap_or(0),
                institutional: row.get::<Option<i64>, _>("institutional").unwrap_or(0) > 0,
            })
            .collect())
    }

    async fn identifiers(&self, uuid: &str) -> Result<Vec<SourceIdentifier>> {
        let rows = sqlx::query(
            "SELECT source_id, remote_id FROM SyncEvent WHERE device_id = ?",
        )
        .bind(uuid)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let source = IdSource::from_domain(row.get::<Option<String>, _>("source_id")?.as_str())?;
                let value: String = row.get::<Option<String>, _>("remote_id")?;
                Some(SourceIdentifier { source, value })
            })
            .collect())
    }

    async fn urls(&self, uuid: &str) -> Result<Vec<String>> {
        let rows: Vec<Option<String>> = sqlx::query_scalar(
            "SELECT remote_id FROM SyncEvent \
             WHERE device_id = ? AND remote_id LIKE 'http%' \
             ORDER BY updated_at DESC",
        )
        .bind(uuid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn keywords(&self, id: i64) -> Result<Vec<SourceKeyword>> {
        let rows = sqlx::query(
            "SELECT k.name, ki.type AS kind \
             FROM Keyword k \
             JOIN KeywordItem ki ON k.ROWID = ki.keyword_id \
             WHERE ki.object_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let name: String = row.get::<Option<String>, _>("name")?;
                let kind = match row.get::<Option<i64>, _>("kind")? {
                    c if c == KeywordKind::Auto.code() => KeywordKind::Auto,
                    c if c == KeywordKind::User.code() => KeywordKind::User,
                    _ => return None,
                };
                Some(SourceKeyword { name, kind })
            })
            .collect())
    }

    async fn record_collections(&self, id: i64) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT c.name FROM Collection c \
             JOIN CollectionItem ci ON c.ROWID = ci.collection \
             WHERE ci.object_id = ? AND c.type IN (0, 5)",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn reviews(&self, id: i64) -> Result<Vec<SourceReview>> {
        let sql = if self.mine_reviews_only {
            "SELECT content, rating FROM Review WHERE object_id = ? AND is_mine = 1"
        } else {
            "SELECT content, rating FROM Review WHERE object_id = ?"
        };
        let rows = sqlx::query(sql).bind(id).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let content: String = row.get::<Option<String>, _>("content")?;
                Some(SourceReview {
                    content,
                    rating: row.get::<Option<i64>, _>("rating").unwrap_or(0),
                })
            })
            .collect())
    }

    /// Attachment files, primary first, relative paths resolved against
    /// the library folder. Rows without a path are skipped.
    async fn attachments(&self, id: i64) -> Result<Vec<SourceAttachment>> {
        let rows = sqlx::query(
            "SELECT path, mime_type FROM PDF WHERE object_id = ? ORDER BY is_primary DESC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let path: String = row.get::<Option<String>, _>("path")?;
                Some(SourceAttachment {
                    path: self.folder.join(path),
                    mime: row.get("mime_type"),
                })
            })
            .collect())
    }

    /// The library folder the database and attachment tree live under.
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

/// Build the WHERE clause for a record filter. Integer lists are inlined
/// (they come from typed values, not user strings); the author substring
/// stays a bound parameter.
fn filter_clause(filter: &RecordFilter) -> String {
    let codes: Vec<i64> = match &filter.kinds {
        Some(kinds) => ALL_KIND_CODES
            .iter()
            .copied()
            .filter(|code| {
                PubKind::from_code(*code)
                    .map(|k| kinds.contains(&k))
                    .unwrap_or(false)
            })
            .collect(),
        None => ALL_KIND_CODES.to_vec(),
    };
    let mut clauses = vec![format!("subtype IN ({})", join_codes(&codes))];

    if let Some(ids) = &filter.ids {
        clauses.push(format!("ROWID IN ({})", join_codes(ids)));
    }
    if filter.author.is_some() {
        clauses.push("full_author_string LIKE ?".to_string());
    }
    if !filter.include_deleted {
        clauses.push("marked_deleted = 0".to_string());
    }
    if !filter.include_duplicates {
        clauses.push("marked_duplicate = 0".to_string());
    }
    if !filter.include_manuscripts {
        clauses.push("manuscript = 0".to_string());
    }

    clauses.join(" AND ")
}

fn join_codes(codes: &[i64]) -> String {
    codes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
