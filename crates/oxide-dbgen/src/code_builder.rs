//! Shared code buffer for database code generators.
//!
//! All applications write their create scripts into one buffer, each preceded
//! by its own marker. Generators that extend another application's structure
//! (for example, adding a column to a table created by a different concept)
//! insert code before a tag inside that application's text. Once every
//! generator has run, the buffer is split back into one script per
//! application.

use crate::error::{GeneratorError, Result};

const MARKER_PREFIX: &str = "/*<application:";
const MARKER_SUFFIX: &str = ">*/";

/// Returns the marker that precedes the create script of application `index`.
#[must_use]
pub fn application_marker(index: usize) -> String {
    format!("{MARKER_PREFIX}{index}{MARKER_SUFFIX}")
}

/// Mutable code buffer shared by all code generators of one model build.
#[derive(Debug, Clone, Default)]
pub struct CodeBuilder {
    code: String,
}

impl CodeBuilder {
    /// Creates an empty code builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Formats a tag that other generators can insert code before.
    #[must_use]
    pub fn tag(kind: &str, key: &str) -> String {
        format!("/*{kind} {key}*/")
    }

    /// Appends code at the end of the buffer.
    pub fn append(&mut self, code: &str) {
        self.code.push_str(code);
    }

    /// Inserts `code` before every occurrence of `tag`.
    ///
    /// Returns `false` if the tag does not occur in the buffer.
    pub fn insert_code(&mut self, code: &str, tag: &str) -> bool {
        if tag.is_empty() || !self.code.contains(tag) {
            return false;
        }
        self.code = self.code.replace(tag, &format!("{code}{tag}"));
        true
    }

    /// Returns whether the buffer contains `tag`.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.code.contains(tag)
    }

    /// Returns the buffer contents.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.code
    }

    /// Splits the buffer into one trimmed script per application.
    ///
    /// `owners[i]` describes application `i` for diagnostics. Markers must
    /// appear exactly once each, in index order, with nothing but whitespace
    /// before the first one.
    pub fn split_by_markers(&self, owners: &[String]) -> Result<Vec<String>> {
        split_by_markers(&self.code, owners)
    }
}

fn split_by_markers(code: &str, owners: &[String]) -> Result<Vec<String>> {
    let mut segments = Vec::with_capacity(owners.len());
    let mut segment_start: Option<usize> = None;
    let mut expected = 0;

    for (position, _) in code.match_indices(MARKER_PREFIX) {
        let rest = &code[position + MARKER_PREFIX.len()..];
        let end = rest.find(MARKER_SUFFIX).ok_or_else(|| {
            GeneratorError::MisplacedMarker(format!("unterminated marker at byte {position}"))
        })?;
        let index: usize = rest[..end].parse().map_err(|_| {
            GeneratorError::MisplacedMarker(format!(
                "malformed marker '{}{}{}'",
                MARKER_PREFIX,
                &rest[..end],
                MARKER_SUFFIX
            ))
        })?;

        let owner = owners.get(index).ok_or_else(|| {
            GeneratorError::MisplacedMarker(format!(
                "marker for unknown application index {index}"
            ))
        })?;
        if index < expected {
            return Err(GeneratorError::DuplicateMarker {
                application: owner.clone(),
            });
        }
        if index > expected {
            return Err(GeneratorError::MisplacedMarker(format!(
                "marker for '{}' found before marker for '{}'",
                owner, owners[expected]
            )));
        }

        match segment_start {
            Some(start) => segments.push(code[start..position].trim().to_string()),
            None => {
                let leading = code[..position].trim();
                if !leading.is_empty() {
                    return Err(GeneratorError::TextBeforeFirstMarker {
                        text: leading.chars().take(100).collect(),
                    });
                }
            }
        }
        segment_start = Some(position + MARKER_PREFIX.len() + end + MARKER_SUFFIX.len());
        expected += 1;
    }

    match segment_start {
        Some(start) => segments.push(code[start..].trim().to_string()),
        None => {
            let leading = code.trim();
            if !leading.is_empty() {
                return Err(GeneratorError::TextBeforeFirstMarker {
                    text: leading.chars().take(100).collect(),
                });
            }
        }
    }

    if let Some(missing) = owners.get(expected) {
        return Err(GeneratorError::MissingMarker {
            application: missing.clone(),
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owners(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("app{i}")).collect()
    }

    #[test]
    fn test_split_with_inserted_code() {
        let mut code = CodeBuilder::new();
        let columns = CodeBuilder::tag("columns", "Sales.Invoice");

        code.append(&application_marker(0));
        code.append(&format!("\nCREATE TABLE Invoice (ID TEXT{columns});\n"));
        code.append(&application_marker(1));
        code.append("CREATE INDEX IX_Invoice ON Invoice (Total);");
        code.append(&application_marker(2));

        assert!(code.insert_code(", Total NUMERIC", &columns));
        assert!(!code.insert_code(", Other TEXT", "/*missing tag*/"));

        let scripts = code.split_by_markers(&owners(3)).unwrap();
        assert_eq!(
            scripts,
            vec![
                format!("CREATE TABLE Invoice (ID TEXT, Total NUMERIC{columns});"),
                "CREATE INDEX IX_Invoice ON Invoice (Total);".to_string(),
                String::new(),
            ]
        );
    }

    #[test]
    fn test_empty_buffer_without_applications() {
        assert!(CodeBuilder::new().split_by_markers(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_text_before_first_marker() {
        let mut code = CodeBuilder::new();
        code.append("stray text");
        code.append(&application_marker(0));
        let result = code.split_by_markers(&owners(1));
        assert!(matches!(
            result,
            Err(GeneratorError::TextBeforeFirstMarker { text }) if text == "stray text"
        ));
    }

    #[test]
    fn test_duplicate_marker() {
        let mut code = CodeBuilder::new();
        code.append(&application_marker(0));
        code.append(&application_marker(1));
        code.append(&application_marker(0));
        let result = code.split_by_markers(&owners(2));
        assert!(matches!(
            result,
            Err(GeneratorError::DuplicateMarker { application }) if application == "app0"
        ));
    }

    #[test]
    fn test_missing_and_misplaced_markers() {
        let mut code = CodeBuilder::new();
        code.append(&application_marker(0));
        let result = code.split_by_markers(&owners(2));
        assert!(matches!(
            result,
            Err(GeneratorError::MissingMarker { application }) if application == "app1"
        ));

        let mut code = CodeBuilder::new();
        code.append(&application_marker(1));
        code.append(&application_marker(0));
        assert!(matches!(
            code.split_by_markers(&owners(2)),
            Err(GeneratorError::MisplacedMarker(_))
        ));

        let mut code = CodeBuilder::new();
        code.append("/*<application:x>*/");
        assert!(matches!(
            code.split_by_markers(&owners(1)),
            Err(GeneratorError::MisplacedMarker(_))
        ));
    }
}
