use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::Article;

/// One option of a filter select, with the number of records carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub value: String,
    pub count: usize,
}

/// Order by count descending, then value ascending.
pub fn sort_facets(facets: &mut [Facet]) {
    facets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
}

pub fn journal_facets<'a, I>(articles: I) -> Vec<Facet>
where
    I: IntoIterator<Item = &'a Article>,
{
    tally(articles.into_iter().filter_map(|article| {
        article
            .journal
            .as_deref()
            .filter(|journal| !journal.trim().is_empty())
            .map(str::to_string)
    }))
}

pub fn type_facets<'a, I>(articles: I) -> Vec<Facet>
where
    I: IntoIterator<Item = &'a Article>,
{
    tally(articles.into_iter().filter_map(|article| {
        article
            .article_type
            .as_deref()
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .map(str::to_string)
    }))
}

/// Tags are grouped case-insensitively; the first spelling seen is kept.
pub fn tag_facets<'a, I>(articles: I) -> Vec<Facet>
where
    I: IntoIterator<Item = &'a Article>,
{
    let mut spellings: HashMap<String, String> = HashMap::new();
    let mut keys = Vec::new();
    for article in articles {
        for tag in article.tags() {
            let key = tag.to_lowercase();
            let display = spellings.entry(key).or_insert(tag);
            keys.push(display.clone());
        }
    }
    tally(keys)
}

fn tally<I>(values: I) -> Vec<Facet>
where
    I: IntoIterator<Item = String>,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    let mut facets: Vec<Facet> = counts
        .into_iter()
        .map(|(value, count)| Facet { value, count })
        .collect();
    sort_facets(&mut facets);
    facets
}

#[cfg(test)]
mod tests {
    use super::{Facet, journal_facets, tag_facets, type_facets};
    use crate::record::Article;

    fn article(uid: &str, journal: Option<&str>, tags: Option<&str>) -> Article {
        Article {
            uid: uid.to_string(),
            journal: journal.map(str::to_string),
            topic_tag: tags.map(str::to_string),
            article_type: Some("article".to_string()),
            ..Article::default()
        }
    }

    #[test]
    fn journal_facets_order_by_count_then_name() {
        let items = vec![
            article("1", Some("Science"), None),
            article("2", Some("Cell"), None),
            article("3", Some("Science"), None),
            article("4", Some("  "), None),
            article("5", Some("Nature"), None),
        ];
        assert_eq!(
            journal_facets(&items),
            vec![
                Facet { value: "Science".to_string(), count: 2 },
                Facet { value: "Cell".to_string(), count: 1 },
                Facet { value: "Nature".to_string(), count: 1 },
            ]
        );
        assert_eq!(type_facets(&items)[0].count, 5);
    }

    #[test]
    fn tag_facets_group_case_insensitively() {
        let items = vec![
            article("1", None, Some(r#"["Ecology", "Soil"]"#)),
            article("2", None, Some("ecology, water")),
            article("3", None, Some("[broken")),
        ];
        let facets = tag_facets(&items);
        assert_eq!(facets[0], Facet { value: "Ecology".to_string(), count: 2 });
        assert_eq!(facets.len(), 4);
    }
}
