//! Recognises identity-bearing PDFs, names them deterministically and detects
//! documents that were already collected.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use log::{debug, trace};
use lopdf::Document;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::DocSweepError;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(AsRefStr, EnumIter, EnumString, Debug, Display, PartialEq, Eq, Hash, Copy, Clone)]
pub enum DocumentKind {
    #[strum(serialize = "STMT")]
    AccountStatement,
    #[strum(serialize = "TAX")]
    TaxNotice,
}

impl DocumentKind {
    /// Lowercase filename keywords that select this kind
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            DocumentKind::AccountStatement => &["statement", "releve", "relevé"],
            DocumentKind::TaxNotice => &["tax", "impot", "impôt", "avis"],
        }
    }

    /// Labels that introduce the holder's name on the first page
    fn markers(&self) -> &'static [&'static str] {
        match self {
            DocumentKind::AccountStatement => &["Printed for:", "Imprimé pour :", "Imprime pour:"],
            DocumentKind::TaxNotice => &["Taxpayer:", "Contribuable :", "Déclarant :"],
        }
    }

    pub fn long_name(&self) -> &'static str {
        match self {
            DocumentKind::AccountStatement => "Account Statement",
            DocumentKind::TaxNotice => "Tax Notice",
        }
    }

    /// Kind from the file name alone. Only `.pdf` files qualify.
    pub fn infer(path: &Path) -> Option<DocumentKind> {
        let is_pdf = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !is_pdf {
            return None;
        }

        let stem = path.file_stem()?.to_string_lossy().to_lowercase();
        DocumentKind::iter().find(|kind| kind.keywords().iter().any(|kw| stem.contains(kw)))
    }
}

/// Source of a document's first-page text
pub trait TextExtractor: Send + Sync {
    fn first_page_text(&self, path: &Path) -> Result<String, DocSweepError>;
}

pub struct LopdfTextExtractor;

impl TextExtractor for LopdfTextExtractor {
    fn first_page_text(&self, path: &Path) -> Result<String, DocSweepError> {
        let doc = Document::load(path)?;
        let first = doc
            .get_pages()
            .keys()
            .next()
            .copied()
            .ok_or_else(|| DocSweepError::Error(format!("{} has no pages", path.display())))?;
        Ok(doc.extract_text(&[first])?)
    }
}

/// Identity plus capture date; two documents with equal keys are the same document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub kind: DocumentKind,
    pub identity: String,
    pub capture_date: NaiveDate,
}

/// A candidate that was classified and carries an identity
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub source_path: PathBuf,
    pub kind: DocumentKind,
    /// Identity as printed in the document
    pub raw_identity: String,
    pub identity_words: Vec<String>,
    pub capture_date: NaiveDate,
    pub destination_path: PathBuf,
}

impl DocumentRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            kind: self.kind,
            identity: self.identity_words.join("_"),
            capture_date: self.capture_date,
        }
    }

    pub fn file_name(&self) -> String {
        destination_file_name(self.kind, &self.identity_words, self.capture_date)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// File name matches no known kind
    Unclassified,
    /// Kind known but no usable identity on the first page
    NoIdentity(DocumentKind),
    Accepted(DocumentRecord),
}

pub struct DocumentMatcher {
    extractor: Box<dyn TextExtractor>,
    tz: Tz,
}

impl DocumentMatcher {
    pub fn new(extractor: Box<dyn TextExtractor>, tz: Tz) -> Self {
        DocumentMatcher { extractor, tz }
    }

    pub fn with_lopdf(tz: Tz) -> Self {
        Self::new(Box::new(LopdfTextExtractor), tz)
    }

    pub fn capture_date(&self, modified: SystemTime) -> NaiveDate {
        DateTime::<Utc>::from(modified)
            .with_timezone(&self.tz)
            .date_naive()
    }

    /// Classify `source` and name it inside `partition`. Text extraction errors
    /// propagate; callers decide whether that skips the file.
    pub fn classify(
        &self,
        source: &Path,
        modified: SystemTime,
        partition: &Path,
    ) -> Result<Classification, DocSweepError> {
        let kind = match DocumentKind::infer(source) {
            Some(kind) => kind,
            None => return Ok(Classification::Unclassified),
        };

        let text = self.extractor.first_page_text(source)?;
        let raw_identity = match extract_identity(kind, &text) {
            Some(raw) => raw,
            None => return Ok(Classification::NoIdentity(kind)),
        };
        let identity_words = normalize_identity(&raw_identity);
        if identity_words.is_empty() {
            return Ok(Classification::NoIdentity(kind));
        }

        let capture_date = self.capture_date(modified);
        let destination_path =
            partition.join(destination_file_name(kind, &identity_words, capture_date));

        Ok(Classification::Accepted(DocumentRecord {
            source_path: source.to_path_buf(),
            kind,
            raw_identity,
            identity_words,
            capture_date,
            destination_path,
        }))
    }

    /// Existing file in the partition that holds the same document, if any.
    ///
    /// Exact file name first; then every file of the same kind is re-read and its
    /// dedup key compared, which catches copies named under an older scheme.
    pub fn find_duplicate(&self, record: &DocumentRecord) -> Result<Option<PathBuf>, DocSweepError> {
        if record.destination_path.exists() {
            return Ok(Some(record.destination_path.clone()));
        }

        let partition = match record.destination_path.parent() {
            Some(partition) if partition.is_dir() => partition,
            _ => return Ok(None),
        };

        let wanted = record.dedup_key();
        let prefix = format!("{}_", record.kind);

        for entry in fs::read_dir(partition)? {
            let path = entry?.path();
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if !name.starts_with(&prefix) || !path.is_file() {
                continue;
            }

            match self.existing_key(record.kind, &path) {
                Ok(Some(key)) if key == wanted => {
                    debug!("{} matches existing {}", record.source_path.display(), name);
                    return Ok(Some(path));
                }
                Ok(_) => {}
                Err(e) => trace!("Could not re-read {}: {}", path.display(), e),
            }
        }

        Ok(None)
    }

    fn existing_key(&self, kind: DocumentKind, path: &Path) -> Result<Option<DedupKey>, DocSweepError> {
        let text = self.extractor.first_page_text(path)?;
        let words = match extract_identity(kind, &text) {
            Some(raw) => normalize_identity(&raw),
            None => return Ok(None),
        };
        if words.is_empty() {
            return Ok(None);
        }

        let capture_date = match date_from_file_name(path) {
            Some(date) => date,
            None => self.capture_date(fs::metadata(path)?.modified()?),
        };

        Ok(Some(DedupKey {
            kind,
            identity: words.join("_"),
            capture_date,
        }))
    }
}

/// Text that follows the first of the kind's markers, or the next non-empty
/// line when the marker ends its line.
pub fn extract_identity(kind: DocumentKind, text: &str) -> Option<String> {
    let lines: Vec<String> = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();

    for marker in kind.markers() {
        let label = marker_label(marker);

        for (idx, line) in lines.iter().enumerate() {
            let rest = match value_after_label(line, &label) {
                Some(rest) => rest,
                None => continue,
            };
            if !rest.is_empty() {
                return Some(rest);
            }
            return lines[idx + 1..]
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
                .map(str::to_string);
        }
    }

    None
}

/// Lowercased label words of a marker, without the trailing colon
fn marker_label(marker: &str) -> Vec<char> {
    let label = marker.trim_end().trim_end_matches(':');
    let collapsed = label.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().map(fold_char).collect()
}

fn fold_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// Matches `label`, optional spaces, `:` and returns the trimmed remainder
fn value_after_label(line: &str, label: &[char]) -> Option<String> {
    let chars: Vec<char> = line.chars().collect();
    let folded: Vec<char> = chars.iter().copied().map(fold_char).collect();
    if label.is_empty() || folded.len() < label.len() {
        return None;
    }

    for start in 0..=folded.len() - label.len() {
        if folded[start..start + label.len()] != *label {
            continue;
        }
        let mut pos = start + label.len();
        while pos < chars.len() && chars[pos].is_whitespace() {
            pos += 1;
        }
        if pos < chars.len() && chars[pos] == ':' {
            let rest: String = chars[pos + 1..].iter().collect();
            return Some(rest.trim().to_string());
        }
    }
    None
}

/// Canonical word list for a printed name: OCR fragments rejoined, casefolded,
/// title-cased, punctuation stripped. Empty means no identity.
pub fn normalize_identity(raw: &str) -> Vec<String> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();

    let mut joined: Vec<String> = Vec::with_capacity(tokens.len());
    let mut idx = 0;
    while idx < tokens.len() {
        let token = tokens[idx];
        match tokens.get(idx + 1) {
            Some(next) if is_single_letter(token) && is_capitalized_word(next) => {
                joined.push(format!("{}{}", token, next));
                idx += 2;
            }
            _ => {
                joined.push(token.to_string());
                idx += 1;
            }
        }
    }

    joined
        .iter()
        .map(|word| title_case(&word.to_lowercase()))
        .map(|word| word.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect()
}

fn is_single_letter(token: &str) -> bool {
    let mut chars = token.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_alphabetic())
}

fn is_capitalized_word(token: &str) -> bool {
    token.chars().count() >= 2 && token.chars().next().is_some_and(char::is_uppercase)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn destination_file_name(kind: DocumentKind, words: &[String], capture_date: NaiveDate) -> String {
    format!("{}_{}_{}.pdf", kind, words.join("_"), capture_date.format(DATE_FORMAT))
}

fn date_from_file_name(path: &Path) -> Option<NaiveDate> {
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    let (_, date) = stem.rsplit_once('_')?;
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}
