//! Parse an MHTML export into a Markdown task-data file.
//!
//! The export's HTML part is located, quoted-printable soft breaks and
//! escapes are decoded, a handful of structural tags map onto Markdown
//! (headers, list items, fenced code) and the rest are stripped.

use super::{HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::hash;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use tracing::info;

/// Handler for `rubrics_import` steps
pub struct RubricsImportHandler;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").unwrap())
}

/// Decode quoted-printable content: soft line breaks vanish, `=HH` escapes
/// become bytes.
#[must_use]
pub fn decode_quoted_printable(content: &str) -> String {
    let unfolded = content.replace("=\r\n", "").replace("=\n", "");
    let mut out = Vec::with_capacity(unfolded.len());
    let bytes = unfolded.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'='
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("20");
            out.push(u8::from_str_radix(hex, 16).unwrap_or(b' '));
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

fn decode_entities(content: &str) -> String {
    content
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Convert the HTML part of an MHTML export into Markdown-shaped text.
#[must_use]
pub fn mhtml_to_markdown(content: &str) -> String {
    // The HTML body is the only part we keep
    let decoded = decode_quoted_printable(content);
    let html = match (decoded.find("<body"), decoded.rfind("</body>")) {
        (Some(start), Some(end)) if start < end => &decoded[start..end],
        _ => decoded.as_str(),
    };

    let mut text = html.to_string();
    for (pattern, replacement) in [
        (r"(?i)<h1[^>]*>", "\n# "),
        (r"(?i)<h2[^>]*>", "\n## "),
        (r"(?i)<h3[^>]*>", "\n### "),
        (r"(?i)</h[1-6]>", "\n"),
        (r"(?i)<li[^>]*>", "\n- "),
        (r"(?i)<(strong|b)>", "**"),
        (r"(?i)</(strong|b)>", "**"),
        (r"(?i)<pre[^>]*>", "\n```\n"),
        (r"(?i)</pre>", "\n```\n"),
        (r"(?i)<br\s*/?>", "\n"),
        (r"(?i)</(p|div|tr)>", "\n"),
    ] {
        let re = Regex::new(pattern).unwrap();
        text = re.replace_all(&text, replacement).to_string();
    }
    let stripped = tag_re().replace_all(&text, "");
    let decoded = decode_entities(&stripped);

    // Collapse runs of blank lines left behind by removed markup
    let mut out = String::new();
    let mut blank = 0;
    for line in decoded.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            blank += 1;
            if blank > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank = 0;
            out.push_str(trimmed.trim_start());
            out.push('\n');
        }
    }
    out.trim_start_matches('\n').to_string()
}

#[async_trait]
impl StepHandler for RubricsImportHandler {
    fn type_key(&self) -> &'static str {
        "rubrics_import"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::RubricsImport(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("rubrics_import handler got wrong variant"));
        };
        if cfg.mhtml_file.is_empty() || cfg.md_file.is_empty() {
            return Err(Error::invalid_config(
                "rubrics_import requires mhtml_file and md_file",
            ));
        }

        let tracked = vec![cfg.mhtml_file.clone()];
        let changed = detect::changed_tracked_files(ctx.base_path(), &cfg.hashes, &tracked).await;
        let md_path = hash::resolve_tracked_path(ctx.base_path(), &cfg.md_file);

        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        for file in &changed {
            reasons.push(format!("{file} changed"));
        }
        if !tokio::fs::try_exists(&md_path).await.unwrap_or(false) {
            reasons.push("markdown output missing".to_string());
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        ctx.check_cancelled()?;
        let mhtml_path = hash::resolve_tracked_path(ctx.base_path(), &cfg.mhtml_file);
        let content = tokio::fs::read_to_string(&mhtml_path)
            .await
            .map_err(|e| Error::Io {
                message: format!("reading {}: {e}", mhtml_path.display()),
                source: e,
            })?;
        let markdown = mhtml_to_markdown(&content);
        tokio::fs::write(&md_path, &markdown)
            .await
            .map_err(|e| Error::Io {
                message: format!("writing {}: {e}", md_path.display()),
                source: e,
            })?;
        info!(step = ctx.step.id, md_file = %cfg.md_file, bytes = markdown.len(), "imported rubric export");

        cfg.hashes = hash::hash_tracked_files(ctx.base_path(), &tracked).await?;
        cfg.force = false;
        let md_file = cfg.md_file.clone();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("imported into {md_file}")).with_settings(encoded),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_quoted_printable() {
        assert_eq!(decode_quoted_printable("a=3Db"), "a=b");
        assert_eq!(decode_quoted_printable("long =\nline"), "long line");
        assert_eq!(decode_quoted_printable("plain"), "plain");
    }

    #[test]
    fn test_mhtml_to_markdown_structure() {
        let mhtml = "Content-Type: text/html\n\n<html><body>\
<h3>#1: abc</h3><p><strong>Score</strong>: 5</p>\
<ul><li>first</li><li>second</li></ul>\
<pre>make test</pre></body></html>";
        let md = mhtml_to_markdown(mhtml);
        assert!(md.contains("### #1: abc"));
        assert!(md.contains("**Score**: 5"));
        assert!(md.contains("- first"));
        assert!(md.contains("```\nmake test"));
    }

    #[test]
    fn test_entities_decoded() {
        let md = mhtml_to_markdown("<p>a &amp; b &lt;c&gt;</p>");
        assert_eq!(md.trim(), "a & b <c>");
    }
}
