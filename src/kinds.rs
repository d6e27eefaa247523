//! Closed code tables for the legacy library schema.
//!
//! The Papers2 database stores publication kinds, identifier sources,
//! keyword kinds, and color labels as raw numeric or string codes. Each
//! table here is a closed enum with an explicit reverse lookup. Unknown
//! codes are errors, never silently mapped.

use anyhow::{bail, Result};

/// Publication kind, keyed by the `Publication.subtype` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PubKind {
    Book,
    BookSection,
    Thesis,
    EBook,
    Pamphlet,
    Website,
    Poster,
    Presentation,
    Abstract,
    Lecture,
    Photo,
    Software,
    DataFile,
    JournalArticle,
    MagazineArticle,
    NewspaperArticle,
    WebsiteArticle,
    Manuscript,
    Preprint,
    ConferencePaper,
    Patent,
    Report,
    TechReport,
    ScientificReport,
    Grant,
    Assignment,
    Reference,
    Protocol,
}

/// Every known subtype code, used to scope source queries to kinds we
/// can convert.
pub const ALL_KIND_CODES: [i64; 28] = [
    0, -1000, 10, 20, 30, 300, 313, 314, 315, 319, 325, 341, 345, 400, 401, 402, 403, 410, 415,
    420, 500, 700, 701, 702, 703, 704, 713, 717,
];

impl PubKind {
    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            0 => PubKind::Book,
            -1000 => PubKind::BookSection,
            10 => PubKind::Thesis,
            20 => PubKind::EBook,
            30 => PubKind::Pamphlet,
            300 => PubKind::Website,
            313 => PubKind::Poster,
            314 => PubKind::Presentation,
            315 => PubKind::Abstract,
            319 => PubKind::Lecture,
            325 => PubKind::Photo,
            341 => PubKind::Software,
            345 => PubKind::DataFile,
            400 => PubKind::JournalArticle,
            401 => PubKind::MagazineArticle,
            402 => PubKind::NewspaperArticle,
            403 => PubKind::WebsiteArticle,
            410 => PubKind::Manuscript,
            415 => PubKind::Preprint,
            420 => PubKind::ConferencePaper,
            500 => PubKind::Patent,
            700 => PubKind::Report,
            701 => PubKind::TechReport,
            702 => PubKind::ScientificReport,
            703 => PubKind::Grant,
            704 => PubKind::Assignment,
            713 => PubKind::Reference,
            717 => PubKind::Protocol,
            other => bail!("Unknown publication subtype code: {}", other),
        })
    }

    /// The remote item-type tag used when requesting a template.
    pub fn item_type(&self) -> &'static str {
        match self {
            PubKind::Book | PubKind::EBook => "book",
            PubKind::BookSection => "bookSection",
            PubKind::Thesis => "thesis",
            PubKind::Pamphlet => "document",
            PubKind::Website | PubKind::WebsiteArticle => "webpage",
            PubKind::Poster | PubKind::Presentation | PubKind::Abstract | PubKind::Lecture => {
                "presentation"
            }
            PubKind::Photo => "artwork",
            PubKind::Software => "computerProgram",
            PubKind::DataFile => "dataset",
            PubKind::JournalArticle => "journalArticle",
            PubKind::MagazineArticle => "magazineArticle",
            PubKind::NewspaperArticle => "newspaperArticle",
            PubKind::Manuscript => "manuscript",
            PubKind::Preprint => "preprint",
            PubKind::ConferencePaper => "conferencePaper",
            PubKind::Patent => "patent",
            PubKind::Report
            | PubKind::TechReport
            | PubKind::ScientificReport
            | PubKind::Grant
            | PubKind::Assignment
            | PubKind::Reference
            | PubKind::Protocol => "report",
        }
    }

    /// Top-level folder for relocated linked attachments of this kind.
    pub fn folder_name(&self) -> &'static str {
        match self {
            PubKind::Book | PubKind::EBook => "Book",
            PubKind::BookSection => "Book Section",
            PubKind::Thesis => "Thesis",
            PubKind::Pamphlet => "Document",
            PubKind::Website | PubKind::WebsiteArticle => "Web Page",
            PubKind::Poster | PubKind::Presentation | PubKind::Abstract | PubKind::Lecture => {
                "Presentation"
            }
            PubKind::Photo => "Artwork",
            PubKind::Software => "Software",
            PubKind::DataFile => "Dataset",
            PubKind::JournalArticle | PubKind::Manuscript => "Journal Article",
            PubKind::MagazineArticle => "Magazine Article",
            PubKind::NewspaperArticle => "Newspaper Article",
            PubKind::Preprint => "Preprint",
            PubKind::ConferencePaper => "Conference Paper",
            PubKind::Patent => "Patent",
            PubKind::Report
            | PubKind::TechReport
            | PubKind::ScientificReport
            | PubKind::Grant
            | PubKind::Assignment
            | PubKind::Reference
            | PubKind::Protocol => "Report",
        }
    }
}

/// External identifier source, keyed by the sync-event source domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    Pubmed,
    Pmc,
    Isbn,
    Issn,
    User,
}

impl IdSource {
    pub fn domain(&self) -> &'static str {
        match self {
            IdSource::Pubmed => "gov.nih.nlm.ncbi.pubmed",
            IdSource::Pmc => "gov.nih.nlm.ncbi.pmc",
            IdSource::Isbn => "org.iso.isbn",
            IdSource::Issn => "org.iso.issn",
            IdSource::User => "com.mekentosj.papers2.user",
        }
    }

    pub fn from_domain(domain: &str) -> Option<Self> {
        match domain {
            "gov.nih.nlm.ncbi.pubmed" => Some(IdSource::Pubmed),
            "gov.nih.nlm.ncbi.pmc" => Some(IdSource::Pmc),
            "org.iso.isbn" => Some(IdSource::Isbn),
            "org.iso.issn" => Some(IdSource::Issn),
            "com.mekentosj.papers2.user" => Some(IdSource::User),
            _ => None,
        }
    }
}

/// Keyword kind, keyed by the `KeywordItem.type` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordKind {
    Auto,
    User,
}

impl KeywordKind {
    pub fn code(&self) -> i64 {
        match self {
            KeywordKind::Auto => 0,
            KeywordKind::User => 99,
        }
    }
}

/// Color label, keyed by the `Publication.label` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    None,
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
    Gray,
}

impl Label {
    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            0 => Label::None,
            1 => Label::Red,
            2 => Label::Orange,
            3 => Label::Yellow,
            4 => Label::Green,
            5 => Label::Blue,
            6 => Label::Purple,
            7 => Label::Gray,
            other => bail!("Unknown label code: {}", other),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Label::None => "None",
            Label::Red => "Red",
            Label::Orange => "Orange",
            Label::Yellow => "Yellow",
            Label::Green => "Green",
            Label::Blue => "Blue",
            Label::Purple => "Purple",
            Label::Gray => "Gray",
        }
    }

    pub const ALL: [Label; 8] = [
        Label::None,
        Label::Red,
        Label::Orange,
        Label::Yellow,
        Label::Green,
        Label::Blue,
        Label::Purple,
        Label::Gray,
    ];
}
