//! Declarative field extraction: source record -> target item fields.
//!
//! [`FIELD_RULES`] is a static table mapping each target-schema field name
//! to a tagged extraction rule. The orchestrator walks the item template
//! it got from the remote service and, for every template field with a
//! rule here, evaluates the rule against the `(record, context)` pair.
//! A `None` result leaves the template default untouched.
//!
//! Rules come in three shapes: direct scalar accessors, multi-value
//! accessors (capped, empties dropped, collapsed to a scalar when exactly
//! one value is requested), and composite rules that need the shared run
//! context (collection keys, keyword-kind filters, the label map).

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::kinds::{IdSource, KeywordKind};
use crate::models::SourceRecord;

/// Immutable per-run context shared by every extraction call.
#[derive(Debug, Clone, Default)]
pub struct ExtractContext {
    /// Source collection name -> remote collection key, for the
    /// collections selected this run. Empty when none were selected.
    pub collections: BTreeMap<String, String>,
    pub keyword_kinds: KeywordKindFilter,
    /// Color label name -> tag text. A color absent here contributes
    /// no tag.
    pub label_map: BTreeMap<String, String>,
}

/// Which keyword kinds are converted into tags.
#[derive(Debug, Clone, Copy)]
pub struct KeywordKindFilter {
    pub user: bool,
    pub auto: bool,
    pub label: bool,
}

impl Default for KeywordKindFilter {
    fn default() -> Self {
        Self {
            user: true,
            auto: true,
            label: true,
        }
    }
}

type ScalarFn = fn(&SourceRecord) -> Option<String>;

/// Tagged extraction strategy for one target field.
pub enum FieldRule {
    /// Direct single-value accessor.
    Scalar(ScalarFn),
    /// `"start-end"`, only when both bounds are present.
    PageRange,
    /// Unix epoch -> ISO-8601 UTC (`YYYY-MM-DDTHH:MM:SSZ`).
    Timestamp(fn(&SourceRecord) -> Option<i64>),
    /// Coded publication date -> `YYYY[-MM[-DD]]`.
    PubDate,
    /// Linked bundle title, falling back to the free-text bundle string.
    BundleTitle,
    /// Ordered creator list with role mapping.
    Creators,
    /// External identifiers of the given sources, concatenated in source
    /// order, first value kept, optionally prefixed.
    Identifier {
        sources: &'static [IdSource],
        prefix: Option<&'static str>,
    },
    /// Most recent recorded URL.
    Url,
    /// Merged keyword/label tag list.
    Tags,
    /// Remote collection keys for selected collections the record is in.
    Collections,
}

/// Target field name -> extraction rule.
pub const FIELD_RULES: &[(&str, FieldRule)] = &[
    ("DOI", FieldRule::Scalar(|r| r.doi.clone())),
    (
        "ISBN",
        FieldRule::Identifier {
            sources: &[IdSource::Isbn, IdSource::Issn],
            prefix: None,
        },
    ),
    ("abstractNote", FieldRule::Scalar(|r| r.summary.clone())),
    ("accessDate", FieldRule::Timestamp(|r| r.imported_date)),
    ("collections", FieldRule::Collections),
    ("creators", FieldRule::Creators),
    ("date", FieldRule::PubDate),
    ("edition", FieldRule::Scalar(|r| r.version.clone())),
    (
        "extra",
        FieldRule::Identifier {
            sources: &[IdSource::Pubmed, IdSource::Pmc],
            prefix: Some("PMID: "),
        },
    ),
    ("issue", FieldRule::Scalar(|r| r.number.clone())),
    (
        "journalAbbreviation",
        FieldRule::Scalar(|r| r.bundle_string.clone()),
    ),
    ("language", FieldRule::Scalar(|r| r.language.clone())),
    ("number", FieldRule::Scalar(|r| r.document_number.clone())),
    ("pages", FieldRule::PageRange),
    ("numPages", FieldRule::Scalar(|r| r.start_page.clone())),
    ("place", FieldRule::Scalar(|r| r.place.clone())),
    ("publicationTitle", FieldRule::BundleTitle),
    ("publisher", FieldRule::Scalar(|r| r.publisher.clone())),
    ("rights", FieldRule::Scalar(|r| r.copyright.clone())),
    ("tags", FieldRule::Tags),
    ("title", FieldRule::Scalar(|r| r.title.clone())),
    ("university", FieldRule::BundleTitle),
    ("url", FieldRule::Url),
    ("volume", FieldRule::Scalar(|r| r.volume.clone())),
];

/// Evaluate one rule. `Ok(None)` means the field is omitted and the
/// template default stays in place.
pub fn apply(
    rule: &FieldRule,
    record: &SourceRecord,
    ctx: &ExtractContext,
) -> Result<Option<Value>> {
    Ok(match rule {
        FieldRule::Scalar(f) => f(record)
            .filter(|v| !v.is_empty())
            .map(Value::String),
        FieldRule::PageRange => match (&record.start_page, &record.end_page) {
            (Some(start), Some(end)) if !start.is_empty() && !end.is_empty() => {
                Some(Value::String(format!("{}-{}", start, end)))
            }
            _ => None,
        },
        FieldRule::Timestamp(f) => f(record).and_then(format_utc).map(Value::String),
        FieldRule::PubDate => record
            .publication_date
            .as_deref()
            .and_then(format_pub_date)
            .map(Value::String),
        FieldRule::BundleTitle => record
            .resolved_bundle
            .clone()
            .or_else(|| record.bundle_string.clone())
            .filter(|v| !v.is_empty())
            .map(Value::String),
        FieldRule::Creators => extract_creators(record)?,
        FieldRule::Identifier { sources, prefix } => {
            extract_identifier(record, sources, *prefix)
        }
        FieldRule::Url => record
            .urls
            .iter()
            .find(|u| !u.is_empty())
            .map(|u| Value::String(u.clone())),
        FieldRule::Tags => extract_tags(record, ctx),
        FieldRule::Collections => extract_collections(record, ctx),
    })
}

/// Render a Unix epoch as an ISO-8601 UTC string.
pub(crate) fn format_utc(epoch: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

/// Decode the legacy date code: year at offset 2, then month and day,
/// each "00" meaning unknown and rendered as "01". A code carrying only
/// a year renders just the year.
fn format_pub_date(code: &str) -> Option<String> {
    let year = code.get(2..6)?;
    if year.len() < 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut out = year.to_string();

    if let Some(month) = code.get(6..8) {
        out.push('-');
        out.push_str(if month == "00" { "01" } else { month });

        if let Some(day) = code.get(8..10) {
            out.push('-');
            out.push_str(if day == "00" { "01" } else { day });
        }
    }
    Some(out)
}

fn extract_creators(record: &SourceRecord) -> Result<Option<Value>> {
    if record.authors.is_empty() {
        return Ok(None);
    }
    let mut creators = Vec::with_capacity(record.authors.len());
    for author in &record.authors {
        let creator_type = match author.role {
            0 => "author",
            1 => "editor",
            other => bail!(
                "Unsupported author role code {} on record {}",
                other,
                record.id
            ),
        };
        let creator = if author.institutional {
            json!({ "creatorType": creator_type, "name": author.family })
        } else {
            json!({
                "creatorType": creator_type,
                "firstName": author.given.clone().unwrap_or_default(),
                "lastName": author.family,
            })
        };
        creators.push(creator);
    }
    Ok(Some(Value::Array(creators)))
}

fn extract_identifier(
    record: &SourceRecord,
    sources: &[IdSource],
    prefix: Option<&str>,
) -> Option<Value> {
    let mut values = Vec::new();
    for source in sources {
        for ident in &record.identifiers {
            if ident.source == *source && !ident.value.is_empty() {
                values.push(ident.value.clone());
            }
        }
    }
    let first = values.into_iter().next()?;
    Some(Value::String(match prefix {
        Some(p) => format!("{}{}", p, first),
        None => first,
    }))
}

fn extract_tags(record: &SourceRecord, ctx: &ExtractContext) -> Option<Value> {
    let mut tags = Vec::new();
    if ctx.keyword_kinds.user {
        for kw in &record.keywords {
            if kw.kind == KeywordKind::User {
                tags.push(json!({ "tag": kw.name }));
            }
        }
    }
    if ctx.keyword_kinds.auto {
        // type 1 marks an automatically-assigned tag in the target schema.
        for kw in &record.keywords {
            if kw.kind == KeywordKind::Auto {
                tags.push(json!({ "tag": kw.name, "type": 1 }));
            }
        }
    }
    if ctx.keyword_kinds.label {
        if let Some(tag) = ctx.label_map.get(record.label.name()) {
            tags.push(json!({ "tag": tag }));
        }
    }
    if tags.is_empty() {
        None
    } else {
        Some(Value::Array(tags))
    }
}

fn extract_collections(record: &SourceRecord, ctx: &ExtractContext) -> Option<Value> {
    if ctx.collections.is_empty() {
        return None;
    }
    let keys: Vec<Value> = record
        .collections
        .iter()
        .filter_map(|name| ctx.collections.get(name))
        .map(|key| Value::String(key.clone()))
        .collect();
    if keys.is_empty() {
        None
    } else {
        Some(Value::Array(keys))
    }
}
