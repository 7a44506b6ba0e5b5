//! Rubric parsing.
//!
//! Two input shapes produce the same ordered list of [`Criterion`]s:
//!
//! - **Markdown** — sections delimited by headers of the form
//!   `### #<ord>: <UUID>`, each carrying `**Score**`, `**Required**`,
//!   `**Criterion**` fields and a fenced held-out test block (optionally
//!   tagged `bash`). Sections are sliced on header positions and parsed
//!   independently.
//! - **JSON** — an array of objects with `rubricItemId`, `score`,
//!   `criterion`, `required` and `forms.*.criterion_test_command`; the
//!   first non-empty command wins.
//!
//! A criterion is emitted only when it has both an identifier and a
//! held-out test command.

use crate::error::{Error, Result};
use crate::hash::sha256_hex;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

/// One scored criterion parsed from a rubric file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    /// Ordinal within the rubric (header ordinal, or array index + 1)
    pub counter: u32,
    /// UUID-form identifier
    pub title: String,
    /// Score awarded when the held-out test passes
    pub score: i64,
    /// Whether a miss fails the rubric
    pub required: bool,
    /// Rubric prose
    pub rubric: String,
    /// Held-out test command
    pub held_out_test: String,
    /// Whether the held-out test needs a container to run in
    pub requires_docker: bool,
}

impl Criterion {
    /// Content hash over everything that affects grading, used to detect
    /// rubric edits per criterion
    #[must_use]
    pub fn content_hash(&self) -> String {
        let canonical = format!(
            "{}\n{}\n{}\n{}\n{}",
            self.title, self.score, self.required, self.rubric, self.held_out_test
        );
        sha256_hex(canonical.as_bytes())
    }
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*###\s+#(\d+):\s+(\S+)\s*$").unwrap())
}

fn score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*Score\*\*:\s*(-?\d+)").unwrap())
}

fn required_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*Required\*\*:\s*(true|false)").unwrap())
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:bash)?[ \t]*\n(.*?)```").unwrap())
}

/// Parse a Markdown rubric into its ordered criteria.
pub fn parse_markdown(content: &str) -> Vec<Criterion> {
    // Slice on header positions first; each section parses independently so
    // one malformed section cannot shift the rest.
    let headers: Vec<(usize, u32, String)> = header_re()
        .captures_iter(content)
        .filter_map(|cap| {
            let pos = cap.get(0)?.start();
            let ord = cap.get(1)?.as_str().parse().ok()?;
            let title = cap.get(2)?.as_str().to_string();
            Some((pos, ord, title))
        })
        .collect();

    let mut criteria = Vec::new();
    for (i, (pos, counter, title)) in headers.iter().enumerate() {
        let end = headers
            .get(i + 1)
            .map_or(content.len(), |(next, _, _)| *next);
        let section = &content[*pos..end];

        let score = score_re()
            .captures(section)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0);
        let required = required_re()
            .captures(section)
            .is_some_and(|c| &c[1] == "true");
        let rubric = criterion_text(section);
        let held_out_test = fence_re()
            .captures(section)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();

        if title.is_empty() || held_out_test.is_empty() {
            warn!(counter, title = %title, "rubric section without id or test command; skipped");
            continue;
        }
        criteria.push(Criterion {
            counter: *counter,
            title: title.clone(),
            score,
            required,
            rubric,
            held_out_test,
            requires_docker: true,
        });
    }
    criteria
}

/// Extract the `**Criterion**:` prose, terminated by a blank line or the
/// end of the section.
fn criterion_text(section: &str) -> String {
    const MARKER: &str = "**Criterion**:";
    let Some(start) = section.find(MARKER) else {
        return String::new();
    };
    let rest = &section[start + MARKER.len()..];
    let end = rest.find("\n\n").unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

#[derive(Debug, Deserialize)]
struct JsonRubricItem {
    #[serde(rename = "rubricItemId", default)]
    rubric_item_id: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    criterion: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    forms: BTreeMap<String, JsonRubricForm>,
}

#[derive(Debug, Deserialize)]
struct JsonRubricForm {
    #[serde(default)]
    criterion_test_command: String,
}

/// Parse a JSON rubric array into its ordered criteria.
///
/// # Errors
/// Returns a parse error when the document is not a JSON array of rubric
/// items.
pub fn parse_json(path: &str, content: &str) -> Result<Vec<Criterion>> {
    let items: Vec<JsonRubricItem> = serde_json::from_str(content)
        .map_err(|e| Error::parse_error(path, format!("not a rubric array: {e}")))?;

    let mut criteria = Vec::new();
    for (idx, item) in items.into_iter().enumerate() {
        let command_form = item
            .forms
            .iter()
            .find(|(_, form)| !form.criterion_test_command.trim().is_empty());
        let Some((form_name, form)) = command_form else {
            warn!(id = %item.rubric_item_id, "rubric item without a test command; skipped");
            continue;
        };
        if item.rubric_item_id.is_empty() {
            warn!(index = idx, "rubric item without an id; skipped");
            continue;
        }
        criteria.push(Criterion {
            counter: u32::try_from(idx + 1).unwrap_or(u32::MAX),
            title: item.rubric_item_id,
            score: item.score,
            required: item.required,
            rubric: item.criterion,
            held_out_test: form.criterion_test_command.trim().to_string(),
            requires_docker: form_name.to_lowercase().contains("docker")
                || item.forms.len() == 1,
        });
    }
    Ok(criteria)
}

/// Parse a rubric file, dispatching on its extension.
///
/// # Errors
/// Returns an error when the file cannot be read or a JSON rubric is
/// malformed.
pub async fn parse_rubric_file(path: &Path) -> Result<Vec<Criterion>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| Error::Io {
        message: format!("reading rubric {}: {e}", path.display()),
        source: e,
    })?;
    let display = path.display().to_string();
    if path.extension().is_some_and(|ext| ext == "json") {
        parse_json(&display, &content)
    } else {
        Ok(parse_markdown(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MD: &str = r"# Rubric

### #1: 3f1c9d5a-0000-4000-8000-000000000001
**Score**: 5
**Required**: true
**Criterion**: The service starts cleanly
and logs its port.

```bash
curl -fsS localhost:8080/health
```

### #2: 3f1c9d5a-0000-4000-8000-000000000002
**Score**: 3
**Required**: false
**Criterion**: Metrics endpoint responds

```
curl -fsS localhost:8080/metrics
```
";

    #[test]
    fn test_parse_markdown_sections() {
        let criteria = parse_markdown(SAMPLE_MD);
        assert_eq!(criteria.len(), 2);

        let first = &criteria[0];
        assert_eq!(first.counter, 1);
        assert_eq!(first.title, "3f1c9d5a-0000-4000-8000-000000000001");
        assert_eq!(first.score, 5);
        assert!(first.required);
        assert_eq!(
            first.rubric,
            "The service starts cleanly\nand logs its port."
        );
        assert_eq!(first.held_out_test, "curl -fsS localhost:8080/health");

        let second = &criteria[1];
        assert_eq!(second.counter, 2);
        assert!(!second.required);
        assert_eq!(second.held_out_test, "curl -fsS localhost:8080/metrics");
    }

    #[test]
    fn test_markdown_section_without_test_is_dropped() {
        let md = "### #1: u1\n**Score**: 2\n**Criterion**: no fence here\n";
        assert!(parse_markdown(md).is_empty());
    }

    #[test]
    fn test_markdown_empty_rubric() {
        assert!(parse_markdown("# nothing to see\n").is_empty());
    }

    #[test]
    fn test_markdown_roundtrip_order_is_stable() {
        let first = parse_markdown(SAMPLE_MD);
        let second = parse_markdown(SAMPLE_MD);
        let ids: Vec<_> = first.iter().map(|c| c.title.clone()).collect();
        let ids2: Vec<_> = second.iter().map(|c| c.title.clone()).collect();
        assert_eq!(ids, ids2);
    }

    #[test]
    fn test_parse_json_first_nonempty_command_wins() {
        let json = r#"[
            {
                "rubricItemId": "u1",
                "score": 4,
                "criterion": "builds",
                "required": true,
                "forms": {
                    "a_empty": {"criterion_test_command": ""},
                    "docker": {"criterion_test_command": "make test"}
                }
            },
            {
                "rubricItemId": "u2",
                "score": 1,
                "criterion": "no command at all",
                "required": false,
                "forms": {"f": {"criterion_test_command": "  "}}
            }
        ]"#;
        let criteria = parse_json("rubric.json", json).unwrap();
        assert_eq!(criteria.len(), 1);
        assert_eq!(criteria[0].title, "u1");
        assert_eq!(criteria[0].counter, 1);
        assert_eq!(criteria[0].held_out_test, "make test");
        assert!(criteria[0].required);
    }

    #[test]
    fn test_parse_json_rejects_non_array() {
        let err = parse_json("rubric.json", r#"{"not": "an array"}"#).unwrap_err();
        assert_eq!(err.category(), "fatal");
    }

    #[test]
    fn test_content_hash_tracks_edits() {
        let criteria = parse_markdown(SAMPLE_MD);
        let edited = SAMPLE_MD.replace("**Score**: 5", "**Score**: 7");
        let criteria2 = parse_markdown(&edited);
        assert_ne!(criteria[0].content_hash(), criteria2[0].content_hash());
        assert_eq!(criteria[1].content_hash(), criteria2[1].content_hash());
    }
}
