use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::record::Article;

/// Columns searched by the keyword clause.
pub const KEYWORD_COLUMNS: &[&str] = &["title_en", "title_cn", "abstract_en", "abstract_cn", "doi"];

/// Suffix appended to `date_to` so the whole end day is included.
pub const END_OF_DAY_SUFFIX: &str = "T23:59:59";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    pub keyword: String,
    pub journal: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub types: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClause {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl WhereClause {
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Split a keyword string into lowercase AND terms.
pub fn keyword_terms(keyword: &str) -> Vec<String> {
    keyword
        .split(|ch: char| ch.is_whitespace() || ch == ',' || ch == '，')
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl FilterCriteria {
    pub fn is_empty(&self) -> bool {
        keyword_terms(&self.keyword).is_empty()
            && self.journal_value().is_none()
            && self.date_from_value().is_none()
            && self.date_to_value().is_none()
            && self.type_values().is_empty()
            && self.tag_values().is_empty()
    }

    pub fn journal_value(&self) -> Option<&str> {
        self.journal
            .as_deref()
            .filter(|journal| !journal.trim().is_empty())
    }

    pub fn date_from_value(&self) -> Option<&str> {
        non_blank_trimmed(self.date_from.as_deref())
    }

    pub fn date_to_value(&self) -> Option<&str> {
        non_blank_trimmed(self.date_to.as_deref())
    }

    pub fn type_values(&self) -> Vec<&str> {
        self.types
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .collect()
    }

    /// Selected tags, trimmed and lowercased for comparison.
    pub fn tag_values(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|tag| tag.trim().to_lowercase())
            .filter(|tag| !tag.is_empty())
            .collect()
    }

    pub fn matches(&self, article: &Article) -> bool {
        let fields = [
            article.title_en.as_deref(),
            article.title_cn.as_deref(),
            article.abstract_en.as_deref(),
            article.abstract_cn.as_deref(),
            article.doi.as_deref(),
        ];
        let folded: Vec<String> = fields.iter().flatten().map(|v| v.to_lowercase()).collect();
        for term in keyword_terms(&self.keyword) {
            if !folded.iter().any(|field| field.contains(&term)) {
                return false;
            }
        }

        if let Some(journal) = self.journal_value()
            && article.journal.as_deref() != Some(journal)
        {
            return false;
        }

        if let Some(from) = self.date_from_value() {
            match article.pub_date.as_deref() {
                Some(pub_date) if pub_date >= from => {}
                _ => return false,
            }
        }
        if let Some(to) = self.date_to_value() {
            let upper = format!("{to}{END_OF_DAY_SUFFIX}");
            match article.pub_date.as_deref() {
                Some(pub_date) if pub_date <= upper.as_str() => {}
                _ => return false,
            }
        }

        let types = self.type_values();
        if !types.is_empty() {
            match article.article_type.as_deref().map(str::trim) {
                Some(kind) if types.contains(&kind) => {}
                _ => return false,
            }
        }

        let wanted = self.tag_values();
        if !wanted.is_empty() {
            let present: Vec<String> = article
                .tags()
                .iter()
                .map(|tag| tag.to_lowercase())
                .collect();
            if !wanted.iter().all(|tag| present.contains(tag)) {
                return false;
            }
        }

        true
    }

    /// Build the SQL equivalent of [`FilterCriteria::matches`]. Parameters are
    /// numbered from `?1`; callers append further parameters after them.
    ///
    /// Relies on the `casefold` and `has_tag` functions registered by the
    /// article store.
    pub fn to_where_clause(&self) -> WhereClause {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        for term in keyword_terms(&self.keyword) {
            params.push(SqlValue::Text(term));
            let index = params.len();
            let any_field = KEYWORD_COLUMNS
                .iter()
                .map(|column| format!("instr(casefold({column}), ?{index}) > 0"))
                .collect::<Vec<_>>()
                .join(" OR ");
            clauses.push(format!("({any_field})"));
        }

        if let Some(journal) = self.journal_value() {
            params.push(SqlValue::Text(journal.to_string()));
            clauses.push(format!("journal = ?{}", params.len()));
        }
        if let Some(from) = self.date_from_value() {
            params.push(SqlValue::Text(from.to_string()));
            clauses.push(format!("(pub_date >= ?{})", params.len()));
        }
        if let Some(to) = self.date_to_value() {
            params.push(SqlValue::Text(to.to_string()));
            clauses.push(format!(
                "(pub_date <= ?{} || '{END_OF_DAY_SUFFIX}')",
                params.len()
            ));
        }

        let types = self.type_values();
        if !types.is_empty() {
            let mut placeholders = Vec::with_capacity(types.len());
            for kind in types {
                params.push(SqlValue::Text(kind.to_string()));
                placeholders.push(format!("?{}", params.len()));
            }
            clauses.push(format!("TRIM(type) IN ({})", placeholders.join(", ")));
        }

        for tag in self.tag_values() {
            params.push(SqlValue::Text(tag));
            clauses.push(format!("has_tag(topic_tag, ?{}) = 1", params.len()));
        }

        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        WhereClause { sql, params }
    }
}

/// The matching subset, in input order.
pub fn filter<'a>(records: &'a [Article], criteria: &FilterCriteria) -> Vec<&'a Article> {
    records
        .iter()
        .filter(|article| criteria.matches(article))
        .collect()
}

fn non_blank_trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use rusqlite::types::Value as SqlValue;

    use super::{FilterCriteria, filter, keyword_terms};
    use crate::record::Article;

    fn sample() -> Vec<Article> {
        vec![
            Article {
                uid: "1".to_string(),
                journal: Some("Nature".to_string()),
                title_en: Some("Soil Carbon Dynamics".to_string()),
                abstract_en: Some("We measure carbon flux in boreal forests.".to_string()),
                article_type: Some("research-article".to_string()),
                pub_date: Some("2024-03-10T08:00:00Z".to_string()),
                topic_tag: Some(r#"["Ecology", "Carbon"]"#.to_string()),
                ..Article::default()
            },
            Article {
                uid: "2".to_string(),
                journal: Some("Science".to_string()),
                title_cn: Some("森林碳汇".to_string()),
                title_en: Some("Forest carbon sinks".to_string()),
                doi: Some("10.1126/science.abc123".to_string()),
                article_type: Some("review".to_string()),
                pub_date: Some("2024-03-31".to_string()),
                topic_tag: Some("ecology; forestry".to_string()),
                ..Article::default()
            },
            Article {
                uid: "3".to_string(),
                journal: Some("Nature".to_string()),
                title_en: Some("Quantum dots".to_string()),
                pub_date: None,
                ..Article::default()
            },
        ]
    }

    fn uids(items: &[&Article]) -> Vec<String> {
        items.iter().map(|item| item.uid.clone()).collect()
    }

    #[test]
    fn keyword_terms_split_on_whitespace_and_commas() {
        assert_eq!(
            keyword_terms("  Carbon,forest，  SOIL "),
            vec!["carbon".to_string(), "forest".to_string(), "soil".to_string()]
        );
        assert!(keyword_terms(" , ").is_empty());
    }

    #[test]
    fn keyword_is_case_insensitive_and_of_terms() {
        let records = sample();
        let criteria = FilterCriteria {
            keyword: "CARBON forest".to_string(),
            ..FilterCriteria::default()
        };
        assert_eq!(uids(&filter(&records, &criteria)), vec!["1", "2"]);

        let criteria = FilterCriteria {
            keyword: "carbon quantum".to_string(),
            ..FilterCriteria::default()
        };
        assert!(filter(&records, &criteria).is_empty());

        let criteria = FilterCriteria {
            keyword: "ABC123".to_string(),
            ..FilterCriteria::default()
        };
        assert_eq!(uids(&filter(&records, &criteria)), vec!["2"]);
    }

    #[test]
    fn journal_and_type_are_exact() {
        let records = sample();
        let criteria = FilterCriteria {
            journal: Some("Nature".to_string()),
            types: vec!["research-article".to_string(), "letter".to_string()],
            ..FilterCriteria::default()
        };
        assert_eq!(uids(&filter(&records, &criteria)), vec!["1"]);

        let criteria = FilterCriteria {
            journal: Some("nature".to_string()),
            ..FilterCriteria::default()
        };
        assert!(filter(&records, &criteria).is_empty());
    }

    #[test]
    fn date_range_is_inclusive_and_excludes_missing_dates() {
        let records = sample();
        let criteria = FilterCriteria {
            date_from: Some("2024-03-10".to_string()),
            date_to: Some("2024-03-31".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(uids(&filter(&records, &criteria)), vec!["1", "2"]);

        let criteria = FilterCriteria {
            date_to: Some("2024-03-10".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(uids(&filter(&records, &criteria)), vec!["1"]);
    }

    #[test]
    fn tags_require_every_selected_tag() {
        let records = sample();
        let criteria = FilterCriteria {
            tags: vec!["ecology".to_string()],
            ..FilterCriteria::default()
        };
        assert_eq!(uids(&filter(&records, &criteria)), vec!["1", "2"]);

        let criteria = FilterCriteria {
            tags: vec!["ECOLOGY".to_string(), " forestry ".to_string()],
            ..FilterCriteria::default()
        };
        assert_eq!(uids(&filter(&records, &criteria)), vec!["2"]);
    }

    #[test]
    fn filtering_is_idempotent() {
        let records = sample();
        let criteria = FilterCriteria {
            keyword: "carbon".to_string(),
            journal: Some("Science".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(
            uids(&filter(&records, &criteria)),
            uids(&filter(&records, &criteria))
        );
    }

    #[test]
    fn where_clause_is_empty_without_criteria() {
        let criteria = FilterCriteria {
            journal: Some("  ".to_string()),
            types: vec![String::new()],
            ..FilterCriteria::default()
        };
        assert!(criteria.is_empty());
        assert!(criteria.to_where_clause().is_empty());
    }

    #[test]
    fn where_clause_numbers_parameters_in_order() {
        let criteria = FilterCriteria {
            keyword: "carbon".to_string(),
            journal: Some("Nature".to_string()),
            date_from: Some("2024-01-01".to_string()),
            date_to: Some("2024-12-31".to_string()),
            types: vec!["review".to_string()],
            tags: vec!["Ecology".to_string()],
        };
        let clause = criteria.to_where_clause();
        assert!(clause.sql.starts_with("WHERE (instr(casefold(title_en), ?1) > 0"));
        assert!(clause.sql.contains("journal = ?2"));
        assert!(clause.sql.contains("(pub_date >= ?3)"));
        assert!(clause.sql.contains("(pub_date <= ?4 || 'T23:59:59')"));
        assert!(clause.sql.contains("TRIM(type) IN (?5)"));
        assert!(clause.sql.contains("has_tag(topic_tag, ?6) = 1"));
        assert_eq!(clause.params.len(), 6);
        assert_eq!(clause.params[5], SqlValue::Text("ecology".to_string()));
    }
}
