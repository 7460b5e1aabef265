//! Firewall release-notes collector
//! Extracts added and removed DNS signature domains from a downloaded
//! release-notes HTML page

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::collectors::{DomainAction, DomainCollector, ParsedDomain};
use crate::error::{EnrichError, Result};
use crate::models::domain_utils::extract_domain;

pub const DEFAULT_ADD_PATTERN: &str = r"New Spyware DNS C2 Signatures";
pub const DEFAULT_REMOVE_PATTERN: &str = r"Old Spyware DNS C2 Signatures";

static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h3\b[^>]*>(.*?)</h3>").expect("static regex"));
static TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<table\b.*?</table>").expect("static regex"));
static CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<td\b[^>]*>(.*?)</td>").expect("static regex"));
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"));

/// Visible text of an HTML fragment
fn text_of(fragment: &str) -> String {
    MARKUP
        .replace_all(fragment, "")
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

fn format_change(message: String) -> EnrichError {
    error!(%message, "Parse failed. Are you sure this HTML file is the right format?");
    EnrichError::ParseFormatChange(message)
}

/// Domains listed in the table that follows the first `<h3>` matching `pattern`.
///
/// Structural surprises are `ParseFormatChange`: retrying will not help.
pub fn parse_section(html: &str, pattern: &Regex, action: DomainAction) -> Result<Vec<ParsedDomain>> {
    let header = HEADER
        .captures_iter(html)
        .find(|caps| pattern.is_match(&text_of(&caps[1])))
        .and_then(|caps| caps.get(0))
        .ok_or_else(|| format_change(format!("no <h3> header matches {}", pattern)))?;

    let rest = &html[header.end()..];

    let table = TABLE
        .find(rest)
        .ok_or_else(|| format_change(format!("no table follows header matching {}", pattern)))?;

    if let Some(next_header) = HEADER.find(rest) {
        if next_header.start() < table.start() {
            return Err(format_change(format!(
                "header matching {} has no table of its own",
                pattern
            )));
        }
    }

    let mut domains = vec![];

    for cell in CELL.captures_iter(table.as_str()) {
        let raw = text_of(&cell[1]);
        let domain = extract_domain(&raw)
            .ok_or_else(|| format_change(format!("cell {:?} has no signature:domain pair", raw)))?;

        domains.push(ParsedDomain { domain, action, raw });
    }

    if domains.is_empty() {
        warn!(%action, "Release notes section lists no domains");
    }

    Ok(domains)
}

/// Parse the added and removed sections side by side; added domains first
pub async fn collect(html: &str, add_pattern: &Regex, remove_pattern: &Regex) -> Result<Vec<ParsedDomain>> {
    let html: Arc<str> = Arc::from(html);

    let added = {
        let html = html.clone();
        let pattern = add_pattern.clone();
        tokio::task::spawn_blocking(move || parse_section(&html, &pattern, DomainAction::Added))
    };
    let removed = {
        let pattern = remove_pattern.clone();
        tokio::task::spawn_blocking(move || parse_section(&html, &pattern, DomainAction::Removed))
    };

    let (added, removed) = tokio::join!(added, removed);

    let mut domains =
        added.map_err(|e| EnrichError::ParseFormatChange(format!("added section task failed: {}", e)))??;
    domains.extend(
        removed.map_err(|e| EnrichError::ParseFormatChange(format!("removed section task failed: {}", e)))??,
    );

    Ok(domains)
}

/// First `{prefix}{n}.{extension}` that does not exist yet
pub fn next_path(prefix: &str, extension: &str) -> PathBuf {
    let mut seq_no = 0;
    loop {
        let candidate = PathBuf::from(format!("{}{}.{}", prefix, seq_no, extension));
        if !candidate.exists() {
            return candidate;
        }
        seq_no += 1;
    }
}

/// Write up to `limit` domains, one per line, to the next free
/// `Parsed_<n>.txt` in `dir`. Never overwrites an existing file.
pub async fn write_domains(dir: &Path, domains: &[ParsedDomain], limit: Option<usize>) -> Result<PathBuf> {
    let prefix = format!("{}/Parsed_", dir.display());
    let path = next_path(&prefix, "txt");

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
        .inspect_err(|e| error!(path = %path.display(), error = %e, "Issue creating output file"))?;

    let count = limit.unwrap_or(domains.len()).min(domains.len());
    let mut contents = String::new();
    for parsed in &domains[..count] {
        contents.push_str(&parsed.domain);
        contents.push('\n');
    }

    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;

    info!(path = %path.display(), count, "Wrote parsed domains");

    Ok(path)
}

/// Reads a release-notes page from disk
pub struct ReleaseNotesCollector {
    path: PathBuf,
    add_pattern: Regex,
    remove_pattern: Regex,
}

impl ReleaseNotesCollector {
    pub fn new(path: impl Into<PathBuf>, add_pattern: Regex, remove_pattern: Regex) -> Self {
        Self {
            path: path.into(),
            add_pattern,
            remove_pattern,
        }
    }
}

#[async_trait]
impl DomainCollector for ReleaseNotesCollector {
    fn name(&self) -> &'static str {
        "release_notes"
    }

    async fn collect(&self) -> Result<Vec<ParsedDomain>> {
        let html = tokio::fs::read_to_string(&self.path)
            .await
            .inspect_err(|e| error!(path = %self.path.display(), error = %e, "Issue opening release notes"))?;

        let domains = collect(&html, &self.add_pattern, &self.remove_pattern).await?;

        info!(
            path = %self.path.display(),
            count = domains.len(),
            "Parsed release notes"
        );

        Ok(domains)
    }
}
