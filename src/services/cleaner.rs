//! 步骤输出清洗：去掉审批 / 记忆标记，再交给下一步或作为候选答案

use std::sync::OnceLock;

use regex::Regex;

pub trait OutputCleaner: Send + Sync {
    fn clean(&self, output: &str) -> String;
}

fn tag_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?is)<approval\b[^>]*>.*?</approval>",
            r"(?is)<memory\b[^>]*>.*?</memory>",
            r"(?i)<(?:approval|memory)\b[^>]*/>",
            r"(?i)\[\[(?:approval|memory):[^\]]*\]\]",
            r"(?i)\[(?:APPROVAL_REQUIRED|MEMORY|REMEMBER)(?::[^\]]*)?\]",
        ]
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!("Invalid tag pattern {}: {}", p, e);
                None
            }
        })
        .collect()
    })
}

fn blank_runs() -> Option<&'static Regex> {
    static BLANKS: OnceLock<Option<Regex>> = OnceLock::new();
    BLANKS.get_or_init(|| Regex::new(r"\n{3,}").ok()).as_ref()
}

/// 正则去标记
#[derive(Debug, Clone, Copy, Default)]
pub struct TagStripper;

impl OutputCleaner for TagStripper {
    fn clean(&self, output: &str) -> String {
        let mut cleaned = output.to_string();
        for re in tag_patterns() {
            cleaned = re.replace_all(&cleaned, "").into_owned();
        }
        if let Some(re) = blank_runs() {
            cleaned = re.replace_all(&cleaned, "\n\n").into_owned();
        }
        cleaned.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_tags() {
        let raw = "Here is the plan.\n<approval id=\"7\">Approve sending email?</approval>\n\n\n\nDone. [MEMORY: user likes tea]\n<memory>store this</memory>";
        assert_eq!(TagStripper.clean(raw), "Here is the plan.\n\nDone.");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(TagStripper.clean("  just text  "), "just text");
        assert_eq!(TagStripper.clean("a [[memory:k=v]] b"), "a  b");
    }
}
