use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delimiters accepted in non-JSON `topic_tag` strings, including the
/// full-width forms common in Chinese metadata.
const TAG_DELIMITERS: &[char] = &[',', ';', '|', '\n', '\r', '，', '；', '、'];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Article {
    pub uid: String,
    pub journal: Option<String>,
    pub title_en: Option<String>,
    pub title_cn: Option<String>,
    #[serde(rename = "type")]
    pub article_type: Option<String>,
    pub pub_date: Option<String>,
    pub doi: Option<String>,
    pub article_url: Option<String>,
    pub abstract_en: Option<String>,
    pub abstract_cn: Option<String>,
    pub topic_tag: Option<String>,
    pub fetched_at: Option<String>,
    pub last_updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayLang {
    #[default]
    Auto,
    Zh,
    En,
}

impl DisplayLang {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Some(Self::Auto),
            "zh" | "cn" => Some(Self::Zh),
            "en" => Some(Self::En),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Zh => "zh",
            Self::En => "en",
        }
    }
}

impl Article {
    pub fn tags(&self) -> Vec<String> {
        self.topic_tag.as_deref().map(parse_tags).unwrap_or_default()
    }

    /// Chinese title when present, English otherwise.
    pub fn display_title(&self) -> &str {
        first_non_blank(self.title_cn.as_deref(), self.title_en.as_deref())
    }

    pub fn display_abstract(&self, lang: DisplayLang) -> &str {
        match lang {
            DisplayLang::En => {
                first_non_blank(self.abstract_en.as_deref(), self.abstract_cn.as_deref())
            }
            DisplayLang::Zh | DisplayLang::Auto => {
                first_non_blank(self.abstract_cn.as_deref(), self.abstract_en.as_deref())
            }
        }
    }
}

/// Parse a `topic_tag` value. JSON arrays are preferred; anything that is not
/// a JSON array is split on the tag delimiters instead.
pub fn parse_tags(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let candidates: Vec<String> = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(value) => Some(value),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        _ => trimmed
            .split(|ch: char| TAG_DELIMITERS.contains(&ch))
            .map(str::to_string)
            .collect(),
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        let tag = candidate.trim();
        if tag.is_empty() {
            continue;
        }
        if seen.insert(tag.to_lowercase()) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Keep the `YYYY-MM-DD` prefix of a timestamp; other values pass through.
pub fn format_date(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 10 {
        let prefix = &bytes[..10];
        let shaped = prefix.iter().enumerate().all(|(index, byte)| match index {
            4 | 7 => *byte == b'-',
            _ => byte.is_ascii_digit(),
        });
        if shaped {
            return &value[..10];
        }
    }
    value
}

/// `pub_date DESC, uid DESC`, with missing dates last.
pub fn default_order(left: &Article, right: &Article) -> Ordering {
    let by_date = match (&left.pub_date, &right.pub_date) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_date.then_with(|| right.uid.cmp(&left.uid))
}

pub fn sort_default(articles: &mut [Article]) {
    articles.sort_by(default_order);
}

fn first_non_blank<'a>(preferred: Option<&'a str>, fallback: Option<&'a str>) -> &'a str {
    match preferred.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => fallback.map(str::trim).unwrap_or(""),
    }
}
