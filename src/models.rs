//! Core data models for the migration pipeline.
//!
//! A [`SourceRecord`] is one fully-hydrated bibliographic entry from the
//! legacy library: the publication row plus its ordered authors,
//! identifiers, keywords, collection memberships, reviews, and attachment
//! files. Hydration happens once in the source reader so that field
//! extraction is pure over `(record, context)`.

use std::path::PathBuf;

use crate::kinds::{IdSource, KeywordKind, Label, PubKind};

/// One bibliographic entry from the legacy store, read-only.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// Stable row id, unique within the source database.
    pub id: i64,
    pub uuid: String,
    pub title: Option<String>,
    pub kind: PubKind,
    pub citekey: Option<String>,
    pub rating: i64,
    pub notes: Option<String>,
    pub doi: Option<String>,
    pub summary: Option<String>,
    /// Import time as a Unix epoch, when recorded.
    pub imported_date: Option<i64>,
    /// Coded publication date: digits, year at offset 2, then month, day.
    pub publication_date: Option<String>,
    pub version: Option<String>,
    pub number: Option<String>,
    /// Free-text bundle (container) string, e.g. a journal abbreviation.
    pub bundle_string: Option<String>,
    /// Title of the linked bundle publication, when the link resolves.
    pub resolved_bundle: Option<String>,
    pub language: Option<String>,
    pub document_number: Option<String>,
    pub start_page: Option<String>,
    pub end_page: Option<String>,
    pub place: Option<String>,
    pub publisher: Option<String>,
    pub copyright: Option<String>,
    pub volume: Option<String>,
    pub times_read: i64,
    pub label: Label,
    pub authors: Vec<SourceAuthor>,
    pub identifiers: Vec<SourceIdentifier>,
    /// URLs recorded for this entry, newest first.
    pub urls: Vec<String>,
    pub keywords: Vec<SourceKeyword>,
    /// Names of the collections this entry belongs to.
    pub collections: Vec<String>,
    pub reviews: Vec<SourceReview>,
    pub attachments: Vec<SourceAttachment>,
}

/// One author of a publication, in priority order.
#[derive(Debug, Clone)]
pub struct SourceAuthor {
    pub given: Option<String>,
    pub family: String,
    /// Role code: 0 = author, 1 = editor. Anything else is invalid input.
    pub role: i64,
    pub institutional: bool,
}

/// An external identifier (the DOI lives on the record itself).
#[derive(Debug, Clone)]
pub struct SourceIdentifier {
    pub source: IdSource,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct SourceKeyword {
    pub name: String,
    pub kind: KeywordKind,
}

#[derive(Debug, Clone)]
pub struct SourceReview {
    pub content: String,
    pub rating: i64,
}

/// A file attached to a publication. The primary attachment sorts first.
#[derive(Debug, Clone)]
pub struct SourceAttachment {
    /// Absolute path under the legacy library folder.
    pub path: PathBuf,
    pub mime: Option<String>,
}
