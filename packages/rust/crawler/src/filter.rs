//! Crawler file filtering.
//!
//! Checks run in a fixed order: include patterns, exclude patterns, size
//! bounds, then the mime allowlist. The first failing check decides the
//! rejection recorded as an `omitted` update.

use regex::{Regex, RegexBuilder};
use tracing::warn;

use librarian_shared::{Crawler, FilterType};

use crate::source::RemoteFile;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Why a file was left out of the library.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRejection {
    pub filter_type: FilterType,
    /// The pattern, bound or allowlist that rejected the file.
    pub filter_value: String,
    pub reason: String,
}

/// Compiled filter rules of one crawler.
#[derive(Debug)]
pub struct FileFilter {
    /// Raw include patterns, kept for reporting when none compiled.
    raw_includes: Vec<String>,
    includes: Vec<(String, Regex)>,
    excludes: Vec<(String, Regex)>,
    min_size_mb: Option<f64>,
    max_size_mb: Option<f64>,
    allowed_mime_types: Vec<String>,
}

impl FileFilter {
    /// Compile a crawler's rules. Invalid patterns are logged and skipped.
    pub fn new(crawler: &Crawler) -> Self {
        Self {
            raw_includes: crawler.include_patterns.clone(),
            includes: compile_patterns(&crawler.include_patterns, "include"),
            excludes: compile_patterns(&crawler.exclude_patterns, "exclude"),
            min_size_mb: crawler.min_file_size_mb,
            max_size_mb: crawler.max_file_size_mb,
            allowed_mime_types: crawler
                .allowed_mime_types
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// `None` when the file passes every rule.
    pub fn check(&self, file: &RemoteFile) -> Option<FilterRejection> {
        self.check_include(file)
            .or_else(|| self.check_exclude(file))
            .or_else(|| self.check_size(file.size))
            .or_else(|| self.check_mime(&file.mime_type))
    }

    fn check_include(&self, file: &RemoteFile) -> Option<FilterRejection> {
        if self.raw_includes.is_empty() {
            return None;
        }
        if self
            .includes
            .iter()
            .any(|(_, re)| re.is_match(&file.path) || re.is_match(&file.name))
        {
            return None;
        }

        let filter_value = self
            .includes
            .first()
            .map(|(raw, _)| raw.clone())
            .or_else(|| self.raw_includes.first().cloned())
            .unwrap_or_default();
        Some(FilterRejection {
            filter_type: FilterType::IncludePattern,
            reason: format!("'{}' does not match any include pattern", file.path),
            filter_value,
        })
    }

    fn check_exclude(&self, file: &RemoteFile) -> Option<FilterRejection> {
        self.excludes
            .iter()
            .find(|(_, re)| re.is_match(&file.path) || re.is_match(&file.name))
            .map(|(raw, _)| FilterRejection {
                filter_type: FilterType::ExcludePattern,
                filter_value: raw.clone(),
                reason: format!("'{}' matches exclude pattern '{raw}'", file.path),
            })
    }

    fn check_size(&self, size: i64) -> Option<FilterRejection> {
        let size = size as f64;
        if let Some(max) = self.max_size_mb {
            if size > max * BYTES_PER_MB {
                return Some(FilterRejection {
                    filter_type: FilterType::FileSize,
                    filter_value: format!("max:{max}"),
                    reason: format!(
                        "file size {:.2} MB exceeds maximum of {max} MB",
                        size / BYTES_PER_MB
                    ),
                });
            }
        }
        if let Some(min) = self.min_size_mb {
            if size < min * BYTES_PER_MB {
                return Some(FilterRejection {
                    filter_type: FilterType::FileSize,
                    filter_value: format!("min:{min}"),
                    reason: format!(
                        "file size {:.2} MB is below minimum of {min} MB",
                        size / BYTES_PER_MB
                    ),
                });
            }
        }
        None
    }

    fn check_mime(&self, mime_type: &str) -> Option<FilterRejection> {
        if self.allowed_mime_types.is_empty() {
            return None;
        }
        let mime = mime_type.to_lowercase();
        let allowed = self.allowed_mime_types.iter().any(|allowed| {
            match allowed.strip_suffix("/*") {
                Some(family) => mime.split('/').next() == Some(family),
                None => *allowed == mime,
            }
        });
        if allowed {
            return None;
        }
        Some(FilterRejection {
            filter_type: FilterType::MimeType,
            filter_value: self.allowed_mime_types.join(","),
            reason: format!("mime type '{mime_type}' is not allowed"),
        })
    }
}

fn compile_patterns(patterns: &[String], kind: &str) -> Vec<(String, Regex)> {
    patterns
        .iter()
        .filter_map(|raw| {
            match RegexBuilder::new(raw).case_insensitive(true).build() {
                Ok(re) => Some((raw.clone(), re)),
                Err(e) => {
                    warn!(pattern = %raw, error = %e, "skipping invalid {kind} pattern");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use librarian_shared::UriType;

    fn crawler() -> Crawler {
        Crawler {
            id: "c1".into(),
            library_id: "lib".into(),
            uri: "https://docs.example.com/".into(),
            uri_type: UriType::Http,
            max_depth: 3,
            max_pages: 100,
            min_file_size_mb: None,
            max_file_size_mb: None,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            allowed_mime_types: Vec::new(),
            schedule: None,
            last_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn file(path: &str, mime: &str, size: i64) -> RemoteFile {
        RemoteFile {
            uri: format!("https://docs.example.com{path}"),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            mime_type: mime.to_string(),
            size,
            modified_at: None,
            content: Vec::new(),
            content_hash: String::new(),
        }
    }

    #[test]
    fn no_rules_accepts_everything() {
        let filter = FileFilter::new(&crawler());
        assert!(filter.check(&file("/a/b.bin", "application/octet-stream", 1)).is_none());
    }

    #[test]
    fn include_patterns_are_case_insensitive() {
        let mut c = crawler();
        c.include_patterns = vec![r"\.pdf$".into()];
        let filter = FileFilter::new(&c);

        assert!(filter.check(&file("/docs/REPORT.PDF", "application/pdf", 10)).is_none());

        let rejection = filter.check(&file("/docs/notes.txt", "text/plain", 10)).expect("rejected");
        assert_eq!(rejection.filter_type, FilterType::IncludePattern);
        assert_eq!(rejection.filter_value, r"\.pdf$");
    }

    #[test]
    fn invalid_include_patterns_are_skipped_but_still_reported() {
        let mut c = crawler();
        c.include_patterns = vec!["([".into()];
        let filter = FileFilter::new(&c);
        let rejection = filter.check(&file("/x.txt", "text/plain", 1)).expect("rejected");
        assert_eq!(rejection.filter_type, FilterType::IncludePattern);
        assert_eq!(rejection.filter_value, "([");
    }

    #[test]
    fn exclude_reports_the_matching_pattern() {
        let mut c = crawler();
        c.exclude_patterns = vec!["^/private/".into(), "draft".into()];
        let filter = FileFilter::new(&c);

        let rejection = filter.check(&file("/notes/Draft-1.md", "text/markdown", 1)).expect("rejected");
        assert_eq!(rejection.filter_type, FilterType::ExcludePattern);
        assert_eq!(rejection.filter_value, "draft");
    }

    #[test]
    fn include_is_checked_before_exclude() {
        let mut c = crawler();
        c.include_patterns = vec!["guide".into()];
        c.exclude_patterns = vec!["blog".into()];
        let filter = FileFilter::new(&c);
        let rejection = filter.check(&file("/blog/post", "text/html", 1)).expect("rejected");
        assert_eq!(rejection.filter_type, FilterType::IncludePattern);
    }

    #[test]
    fn size_bounds_check_max_first() {
        let mut c = crawler();
        c.min_file_size_mb = Some(1.0);
        c.max_file_size_mb = Some(2.0);
        let filter = FileFilter::new(&c);

        let big = filter.check(&file("/big", "text/plain", 3 * 1024 * 1024)).expect("too big");
        assert_eq!(big.filter_type, FilterType::FileSize);
        assert_eq!(big.filter_value, "max:2");

        let small = filter.check(&file("/small", "text/plain", 1024)).expect("too small");
        assert_eq!(small.filter_value, "min:1");

        assert!(filter.check(&file("/ok", "text/plain", 1536 * 1024)).is_none());
    }

    #[test]
    fn mime_allowlist_supports_wildcards() {
        let mut c = crawler();
        c.allowed_mime_types = vec!["text/*".into(), "application/pdf".into()];
        let filter = FileFilter::new(&c);

        assert!(filter.check(&file("/a.html", "text/html", 1)).is_none());
        assert!(filter.check(&file("/a.pdf", "Application/PDF", 1)).is_none());

        let rejection = filter.check(&file("/a.png", "image/png", 1)).expect("rejected");
        assert_eq!(rejection.filter_type, FilterType::MimeType);
        assert_eq!(rejection.filter_value, "text/*,application/pdf");
    }
}
