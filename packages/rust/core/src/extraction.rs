//! Built-in extraction methods.
//!
//! Every method produces Markdown; an empty result is an extraction error so
//! that a sibling method can still win.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use librarian_shared::{LibrarianError, LibraryFile, Result};

use crate::providers::ExtractionMethod;

// ---------------------------------------------------------------------------
// Plain text
// ---------------------------------------------------------------------------

/// Text-like formats, passed through (JSON and XML fenced as code).
pub struct TextExtraction;

#[async_trait]
impl ExtractionMethod for TextExtraction {
    fn id(&self) -> &str {
        "text-extraction"
    }

    fn mime_types(&self) -> &[&str] {
        &[
            "text/plain",
            "text/markdown",
            "application/json",
            "application/xml",
            "text/xml",
        ]
    }

    async fn extract(
        &self,
        file: &LibraryFile,
        content: &[u8],
        _options: Option<&serde_json::Value>,
    ) -> Result<String> {
        let text = String::from_utf8_lossy(content);
        let body = match file.mime_type.as_str() {
            "application/json" => format!("```json\n{}\n```", pretty_json(&text)),
            "application/xml" | "text/xml" => format!("```xml\n{}\n```", text.trim()),
            _ => text.into_owned(),
        };
        non_empty(normalize_whitespace(&body), self.id())
    }
}

fn pretty_json(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| raw.trim().to_string())
}

// ---------------------------------------------------------------------------
// HTML
// ---------------------------------------------------------------------------

/// HTML pages converted to Markdown with `htmd`, chrome stripped.
pub struct HtmlExtraction;

#[async_trait]
impl ExtractionMethod for HtmlExtraction {
    fn id(&self) -> &str {
        "html-extraction"
    }

    fn mime_types(&self) -> &[&str] {
        &["text/html", "application/xhtml+xml"]
    }

    async fn extract(
        &self,
        _file: &LibraryFile,
        content: &[u8],
        _options: Option<&serde_json::Value>,
    ) -> Result<String> {
        let html = String::from_utf8_lossy(content);
        let markdown = html_to_markdown(&html)?;
        non_empty(markdown, self.id())
    }
}

/// Convert an HTML document to Markdown.
pub fn html_to_markdown(html: &str) -> Result<String> {
    let content_html = preprocess_tables(&main_content_html(html));

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec![
            "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg",
        ])
        .build();

    let raw = converter
        .convert(&content_html)
        .map_err(|e| LibrarianError::Extraction(format!("htmd conversion failed: {e}")))?;
    debug!(raw_len = raw.len(), "htmd conversion complete");

    Ok(normalize_whitespace(&raw))
}

/// The main content container of a page, or its body.
fn main_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    for sel_str in ["article", "main", "[role=\"main\"]", ".content", "body"] {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }
    html.to_string()
}

/// Replace `<table>` elements with Markdown tables; htmd 0.1 has no table
/// support.
fn preprocess_tables(html: &str) -> String {
    let Ok(table_sel) = Selector::parse("table") else {
        return html.to_string();
    };
    let doc = Html::parse_fragment(html);

    let mut result = html.to_string();
    for table in doc.select(&table_sel) {
        let rows = table_rows(&table);
        if rows.is_empty() {
            continue;
        }
        result = result.replacen(&table.html(), &format!("\n\n{}\n", markdown_table(&rows)), 1);
    }
    result
}

fn table_rows(table: &ElementRef) -> Vec<Vec<String>> {
    let (Ok(tr_sel), Ok(cell_sel)) = (Selector::parse("tr"), Selector::parse("th, td")) else {
        return Vec::new();
    };
    table
        .select(&tr_sel)
        .map(|tr| {
            tr.select(&cell_sel)
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// CSV files rendered as a Markdown table; the first record is the header.
pub struct CsvExtraction;

#[async_trait]
impl ExtractionMethod for CsvExtraction {
    fn id(&self) -> &str {
        "csv-extraction"
    }

    fn mime_types(&self) -> &[&str] {
        &["text/csv"]
    }

    async fn extract(
        &self,
        _file: &LibraryFile,
        content: &[u8],
        options: Option<&serde_json::Value>,
    ) -> Result<String> {
        let delimiter = options
            .and_then(|o| o.get("delimiter"))
            .and_then(|d| d.as_str())
            .and_then(|d| d.chars().next())
            .unwrap_or(',');

        let text = String::from_utf8_lossy(content);
        let rows = parse_csv(&text, delimiter);
        if rows.is_empty() {
            return Err(LibrarianError::Extraction(format!(
                "{}: no records found",
                self.id()
            )));
        }
        Ok(markdown_table(&rows))
    }
}

/// Split CSV text into records. Double-quoted fields may contain the
/// delimiter, newlines and `""` escapes.
fn parse_csv(text: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                if row.iter().any(|f| !f.trim().is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            c if c == delimiter => row.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    row.push(field);
    if row.iter().any(|f| !f.trim().is_empty()) {
        rows.push(row);
    }
    rows
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Render rows as a Markdown table, padding short rows.
fn markdown_table(rows: &[Vec<String>]) -> String {
    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let render = |row: &Vec<String>| {
        let cells = (0..cols)
            .map(|i| {
                row.get(i)
                    .map(|c| c.trim().replace('|', "\\|").replace('\n', " "))
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    if let Some(header) = rows.first() {
        lines.push(render(header));
        lines.push(format!("| {} |", vec!["---"; cols].join(" | ")));
    }
    lines.extend(rows.iter().skip(1).map(render));
    lines.join("\n")
}

/// Trim trailing spaces and collapse runs of blank lines.
fn normalize_whitespace(text: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let trimmed = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    MULTI_BLANK_RE
        .replace_all(trimmed.trim(), "\n\n")
        .into_owned()
}

fn non_empty(text: String, method: &str) -> Result<String> {
    if text.trim().is_empty() {
        Err(LibrarianError::Extraction(format!("{method}: no text extracted")))
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn file(mime: &str) -> LibraryFile {
        LibraryFile {
            id: "f".into(),
            library_id: "l".into(),
            name: "doc".into(),
            mime_type: mime.into(),
            size: 0,
            origin_uri: None,
            origin_modified_at: None,
            crawler_id: None,
            content_hash: None,
            archived_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn html_keeps_main_content_only() {
        let html = r#"<html><body>
            <nav><a href="/">Home</a></nav>
            <main><h1>Install</h1><p>Run the installer.</p>
              <table><tr><th>OS</th><th>Cmd</th></tr><tr><td>Linux</td><td>apt</td></tr></table>
            </main>
            <footer>Copyright</footer>
        </body></html>"#;

        let md = HtmlExtraction
            .extract(&file("text/html"), html.as_bytes(), None)
            .await
            .expect("extract");
        assert!(md.contains("# Install"));
        assert!(md.contains("Run the installer."));
        assert!(md.contains("| OS | Cmd |"));
        assert!(md.contains("| Linux | apt |"));
        assert!(!md.contains("Home"));
        assert!(!md.contains("Copyright"));
    }

    #[tokio::test]
    async fn empty_html_is_an_extraction_error() {
        let err = HtmlExtraction
            .extract(&file("text/html"), b"<html><body>  </body></html>", None)
            .await
            .err()
            .expect("empty");
        assert!(matches!(err, LibrarianError::Extraction(_)));
    }

    #[tokio::test]
    async fn csv_renders_table_with_quoted_fields() {
        let csv = "name,notes\n\"Smith, J\",\"said \"\"hi\"\"\"\nDoe,\n";
        let md = CsvExtraction
            .extract(&file("text/csv"), csv.as_bytes(), None)
            .await
            .expect("extract");
        let lines: Vec<&str> = md.lines().collect();
        assert_eq!(lines[0], "| name | notes |");
        assert_eq!(lines[1], "| --- | --- |");
        assert_eq!(lines[2], "| Smith, J | said \"hi\" |");
        assert_eq!(lines[3], "| Doe |  |");
    }

    #[tokio::test]
    async fn csv_delimiter_option() {
        let options = serde_json::json!({ "delimiter": ";" });
        let md = CsvExtraction
            .extract(&file("text/csv"), b"a;b\n1;2", Some(&options))
            .await
            .expect("extract");
        assert!(md.ends_with("| 1 | 2 |"));
    }

    #[tokio::test]
    async fn json_is_fenced_and_pretty_printed() {
        let md = TextExtraction
            .extract(&file("application/json"), br#"{"a":1}"#, None)
            .await
            .expect("extract");
        assert!(md.starts_with("```json\n{\n  \"a\": 1\n}"));
    }

    #[test]
    fn whitespace_normalization() {
        assert_eq!(normalize_whitespace("a  \n\n\n\nb\n"), "a\n\nb");
    }
}
