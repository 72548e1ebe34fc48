use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mime_guess::from_path;
use uuid::Uuid;

/// The two sibling trees documents move through, plus the report output
/// directory, all rooted at the configured data dir:
///
/// ```text
/// <root>/uploads/<folder_uuid>/<hex>_<safe-name>.<ext>
/// <root>/processed/<folder_uuid>/<hex>_<safe-name>.md
/// <root>/output/<safe-company>-<yyyyMMdd-HHmmss>.md
/// ```
#[derive(Clone, Debug)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    pub fn uploads_dir(&self, folder_uuid: &str) -> PathBuf {
        self.root.join("uploads").join(folder_uuid)
    }

    pub fn processed_dir(&self, folder_uuid: &str) -> PathBuf {
        self.root.join("processed").join(folder_uuid)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }
}

/// Sanitizes a file name to prevent directory traversal and similar issues.
/// Replaces any non-alphanumeric character (excluding '_') in the stem with
/// an underscore; the extension is preserved.
pub fn sanitize_file_name(file_name: &str) -> String {
    let sanitize = |part: &str| -> String {
        part.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };

    if let Some(idx) = file_name.rfind('.') {
        let (name, ext) = file_name.split_at(idx);
        format!("{}{}", sanitize(name), ext)
    } else {
        sanitize(file_name)
    }
}

/// Builds the on-disk name for a newly stored upload. The random hex prefix
/// keeps duplicate uploads and case-colliding names apart, and doubles as the
/// artifact stem later on.
pub fn stored_file_name(original_name: &str) -> String {
    let sanitized = sanitize_file_name(original_name);
    // Fully sanitized-away names (e.g. non-ASCII input) still need a stem.
    let sanitized = if sanitized.starts_with('.') || sanitized.is_empty() {
        format!("document{sanitized}")
    } else {
        sanitized
    };
    format!("{}_{}", Uuid::new_v4().simple(), sanitized)
}

/// Artifact name for a stored raw file: same stem, `.md` extension.
pub fn artifact_file_name(stored_raw_name: &str) -> String {
    let stem = Path::new(stored_raw_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(stored_raw_name);
    format!("{stem}.md")
}

pub fn file_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
}

pub fn file_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Guesses the MIME type from the file extension.
pub fn guess_mime_type(path: &Path) -> String {
    from_path(path)
        .first_or(mime::APPLICATION_OCTET_STREAM)
        .to_string()
}

/// Company names become report file stems; path separators and drive colons
/// are replaced so the result stays a single path component.
pub fn safe_company_name(company_name: &str) -> String {
    company_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
        .collect()
}

pub fn report_file_name(company_name: &str, when: DateTime<Utc>) -> String {
    format!(
        "{}-{}.md",
        safe_company_name(company_name),
        when.format("%Y%m%d-%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(
            sanitize_file_name("file with spaces.txt"),
            "file_with_spaces.txt"
        );
        assert_eq!(sanitize_file_name("file/with/path.txt"), "file_with_path.txt");
        assert_eq!(sanitize_file_name("../dangerous.txt"), "___dangerous.txt");
        assert_eq!(sanitize_file_name("no_extension"), "no_extension");
    }

    #[test]
    fn test_stored_file_name_is_unique_per_call() {
        let first = stored_file_name("report.pdf");
        let second = stored_file_name("report.pdf");

        assert_ne!(first, second);
        assert!(first.ends_with("_report.pdf"));
        assert!(second.ends_with("_report.pdf"));
    }

    #[test]
    fn test_stored_file_name_handles_fully_sanitized_input() {
        let stored = stored_file_name("报告.pdf");
        // The stem collapses to underscores but a usable name remains.
        assert!(stored.ends_with(".pdf"));
        assert!(stored.contains('_'));
    }

    #[test]
    fn test_artifact_file_name_reuses_raw_stem() {
        assert_eq!(
            artifact_file_name("deadbeef_report.pdf"),
            "deadbeef_report.md"
        );
        assert_eq!(artifact_file_name("notes.md"), "notes.md");
    }

    #[test]
    fn test_storage_paths_layout() {
        let paths = StoragePaths::new("/data");
        assert_eq!(
            paths.uploads_dir("abc"),
            PathBuf::from("/data/uploads/abc")
        );
        assert_eq!(
            paths.processed_dir("abc"),
            PathBuf::from("/data/processed/abc")
        );
        assert_eq!(paths.output_dir(), PathBuf::from("/data/output"));
    }

    #[test]
    fn test_report_file_name_format() {
        let when = Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 15).single();
        let when = when.expect("valid timestamp");
        assert_eq!(
            report_file_name("Acme/Global:Corp", when),
            "Acme-Global-Corp-20240305-093015.md"
        );
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type(Path::new("a.pdf")), "application/pdf");
        assert_eq!(guess_mime_type(Path::new("a.md")), "text/markdown");
        assert_eq!(
            guess_mime_type(Path::new("unknown.929yz")),
            "application/octet-stream"
        );
    }
}
