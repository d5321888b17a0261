use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::catalog::Catalog;
use crate::filter::FilterCriteria;
use crate::paginate::{PageRequest, PageSlice};
use crate::record::{Article, DisplayLang, format_date};
use crate::remote::query_pairs;

const ABSTRACT_PREVIEW_CHARS: usize = 240;

const PAGE_STYLE: &str = "body{font-family:system-ui,sans-serif;max-width:920px;margin:2rem auto;padding:0 1rem;color:#222}\
.card{border:1px solid #ddd;border-radius:8px;padding:12px 16px;margin:12px 0}\
.title{font-weight:600;font-size:1.05rem}\
.meta{color:#666;font-size:.9rem;margin:4px 0}\
.abs{margin:8px 0;line-height:1.5}\
.badge{display:inline-block;background:#eef;border-radius:4px;padding:0 6px;font-size:.8rem}\
.nav a,.nav span{margin-right:1rem}.nav .disabled{color:#aaa}";

/// Escape the five HTML-significant characters.
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            other => out.push(other),
        }
    }
    out
}

fn meta_line(article: &Article) -> String {
    [
        article.journal.as_deref().unwrap_or_default().trim(),
        article
            .pub_date
            .as_deref()
            .map(format_date)
            .unwrap_or_default(),
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(" · ")
}

pub fn render_card(article: &Article, lang: DisplayLang) -> String {
    let mut links = Vec::new();
    if let Some(doi) = article.doi.as_deref().filter(|doi| !doi.trim().is_empty()) {
        let doi = escape_html(doi.trim());
        links.push(format!(
            r#"<span class="badge">DOI</span> <a href="https://doi.org/{doi}" target="_blank" rel="noopener">{doi}</a>"#
        ));
    }
    if let Some(url) = article
        .article_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
    {
        links.push(format!(
            r#"<a href="{}" target="_blank" rel="noopener">Original</a>"#,
            escape_html(url.trim())
        ));
    }

    let mut badges = Vec::new();
    if let Some(kind) = article
        .article_type
        .as_deref()
        .filter(|kind| !kind.trim().is_empty())
    {
        badges.push(format!(r#"<span class="badge">{}</span>"#, escape_html(kind.trim())));
    }
    for tag in article.tags() {
        badges.push(format!(r#"<span class="badge">#{}</span>"#, escape_html(&tag)));
    }

    let mut html = String::new();
    html.push_str("<div class=\"card\">\n");
    let _ = writeln!(
        html,
        "  <div class=\"title\">{}</div>",
        escape_html(article.display_title())
    );
    let _ = writeln!(html, "  <div class=\"meta\">{}</div>", escape_html(&meta_line(article)));
    if !badges.is_empty() {
        let _ = writeln!(html, "  <div class=\"meta\">{}</div>", badges.join(" "));
    }
    let _ = writeln!(
        html,
        "  <div class=\"abs\">{}</div>",
        escape_html(article.display_abstract(lang))
    );
    let _ = writeln!(html, "  <div class=\"meta\">{}</div>", links.join(" "));
    html.push_str("</div>\n");
    html
}

pub fn render_cards(items: &[Article], lang: DisplayLang) -> String {
    if items.is_empty() {
        return "<div class=\"empty\">No matching articles.</div>\n".to_string();
    }
    items.iter().map(|article| render_card(article, lang)).collect()
}

pub fn render_stats<T>(slice: &PageSlice<T>) -> String {
    format!(
        "{} results · page {} of {}",
        slice.total,
        slice.page,
        slice.total_pages.max(1)
    )
}

/// Builds the href for a page number in the rendered navigation.
pub trait PageLinker {
    fn href(&self, page: usize) -> String;
}

/// `page-N.html` files side by side in one directory.
pub struct FileLinker;

impl PageLinker for FileLinker {
    fn href(&self, page: usize) -> String {
        page_file_name(page)
    }
}

/// `?page=N&...` links back to the same view, carrying the active filters.
pub struct QueryLinker<'a> {
    pub criteria: &'a FilterCriteria,
    pub page_size: usize,
}

impl PageLinker for QueryLinker<'_> {
    fn href(&self, page: usize) -> String {
        let query = query_pairs(self.criteria, PageRequest::new(page, self.page_size))
            .into_iter()
            .filter(|(key, value)| !(*key == "q" && value.is_empty()))
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(&value)))
            .collect::<Vec<_>>();
        format!("?{}", query.join("&"))
    }
}

pub fn page_file_name(page: usize) -> String {
    format!("page-{page}.html")
}

fn nav_link(label: &str, target: Option<String>) -> String {
    match target {
        Some(href) => format!(r#"<a href="{}">{label}</a>"#, escape_html(&href)),
        None => format!(r#"<span class="disabled">{label}</span>"#),
    }
}

pub fn render_page_document(
    slice: &PageSlice<Article>,
    lang: DisplayLang,
    title: &str,
    linker: &dyn PageLinker,
) -> String {
    let prev = slice
        .has_prev()
        .then(|| linker.href(slice.page - 1));
    let next = slice.has_next().then(|| linker.href(slice.page + 1));
    let lang_attr = match lang {
        DisplayLang::En => "en",
        DisplayLang::Zh | DisplayLang::Auto => "zh",
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="{lang_attr}">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>{PAGE_STYLE}</style>
</head>
<body>
<h1>{title}</h1>
<div id="stats" class="meta">{stats}</div>
<div id="list">
{cards}</div>
<div class="nav">{prev} <span id="pageinfo">Page {page}</span> {next}</div>
</body>
</html>
"#,
        title = escape_html(title),
        stats = escape_html(&render_stats(slice)),
        cards = render_cards(&slice.items, lang),
        prev = nav_link("Prev", prev),
        next = nav_link("Next", next),
        page = slice.page,
    )
}

/// Plain-text listing for terminals.
pub fn render_text(slice: &PageSlice<Article>, lang: DisplayLang) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", render_stats(slice));
    for (index, article) in slice.items.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "[{}] {}", slice.offset + index + 1, article.display_title());
        let meta = meta_line(article);
        if !meta.is_empty() {
            let _ = writeln!(out, "    {meta}");
        }
        let tags = article.tags();
        if !tags.is_empty() {
            let _ = writeln!(out, "    tags: {}", tags.join(", "));
        }
        if let Some(doi) = article.doi.as_deref().filter(|doi| !doi.trim().is_empty()) {
            let _ = writeln!(out, "    https://doi.org/{}", doi.trim());
        } else if let Some(url) = article.article_url.as_deref().filter(|url| !url.is_empty()) {
            let _ = writeln!(out, "    {url}");
        }
        let summary = preview(article.display_abstract(lang), ABSTRACT_PREVIEW_CHARS);
        if !summary.is_empty() {
            let _ = writeln!(out, "    {summary}");
        }
    }
    if slice.has_next() {
        let _ = writeln!(out);
        let _ = writeln!(out, "more: --page {}", slice.page + 1);
    }
    out
}

fn preview(value: &str, limit: usize) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= limit {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(limit).collect();
    cut.push('…');
    cut
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub out_dir: PathBuf,
    pub pages: usize,
    pub records: usize,
}

/// Write one HTML document per result page into `out_dir`. An empty result
/// still produces `page-1.html`.
pub fn export_pages(
    catalog: &mut dyn Catalog,
    criteria: &FilterCriteria,
    lang: DisplayLang,
    page_size: usize,
    out_dir: &Path,
) -> Result<ExportReport> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let title = "Journal articles";
    let mut page = 1usize;
    let mut pages = 0usize;
    let mut records = 0usize;
    loop {
        let slice = catalog.search(criteria, PageRequest::new(page, page_size))?;
        let path = out_dir.join(page_file_name(slice.page));
        let document = render_page_document(&slice, lang, title, &FileLinker);
        fs::write(&path, document)
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), items = slice.items.len(), "wrote export page");
        pages += 1;
        records += slice.items.len();
        if !slice.has_next() || slice.page < page {
            break;
        }
        page = slice.page + 1;
    }

    Ok(ExportReport {
        out_dir: out_dir.to_path_buf(),
        pages,
        records,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{
        FileLinker, PageLinker, QueryLinker, escape_html, export_pages, render_card, render_page_document,
        render_stats, render_text,
    };
    use crate::catalog::MemoryCatalog;
    use crate::filter::FilterCriteria;
    use crate::paginate::{PageRequest, PageSlice, paginate};
    use crate::record::{Article, DisplayLang};

    fn article() -> Article {
        Article {
            uid: "a1".to_string(),
            journal: Some("Nature".to_string()),
            title_en: Some("Ocean <heat> & carbon".to_string()),
            title_cn: Some(" ".to_string()),
            article_type: Some("Article".to_string()),
            pub_date: Some("2024-03-05T08:00:00Z".to_string()),
            doi: Some("10.1038/x'1".to_string()),
            article_url: Some("https://example.org/a?x=1&y=2".to_string()),
            abstract_en: Some("English abstract".to_string()),
            abstract_cn: Some("中文摘要".to_string()),
            topic_tag: Some(r#"["Climate"]"#.to_string()),
            ..Article::default()
        }
    }

    #[test]
    fn escape_html_covers_five_characters() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & Jerry's</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; Jerry&#039;s&lt;/a&gt;"
        );
    }

    #[test]
    fn card_escapes_fields_and_links_doi() {
        let html = render_card(&article(), DisplayLang::Auto);
        assert!(html.contains("Ocean &lt;heat&gt; &amp; carbon"));
        assert!(html.contains("Nature · 2024-03-05"));
        assert!(html.contains(r#"href="https://doi.org/10.1038/x&#039;1""#));
        assert!(html.contains("https://example.org/a?x=1&amp;y=2"));
        assert!(html.contains("中文摘要"));
        assert!(html.contains("#Climate"));

        let english = render_card(&article(), DisplayLang::En);
        assert!(english.contains("English abstract"));
    }

    #[test]
    fn navigation_disables_edges() {
        let data = vec![article(); 3];
        let first = paginate(&data, PageRequest::new(1, 2));
        let html = render_page_document(&first, DisplayLang::Auto, "T", &FileLinker);
        assert!(html.contains(r#"<span class="disabled">Prev</span>"#));
        assert!(html.contains(r#"<a href="page-2.html">Next</a>"#));
        assert!(html.contains("3 results · page 1 of 2"));

        let last = paginate(&data, PageRequest::new(2, 2));
        let html = render_page_document(&last, DisplayLang::Auto, "T", &FileLinker);
        assert!(html.contains(r#"<a href="page-1.html">Prev</a>"#));
        assert!(html.contains(r#"<span class="disabled">Next</span>"#));
    }

    #[test]
    fn query_links_keep_filters_on_the_same_view() {
        let data = vec![article(); 5];
        let criteria = FilterCriteria {
            keyword: "ocean heat".to_string(),
            journal: Some("Nature".to_string()),
            tags: vec!["A&B".to_string()],
            ..FilterCriteria::default()
        };
        let linker = QueryLinker {
            criteria: &criteria,
            page_size: 2,
        };
        let middle = paginate(&data, PageRequest::new(2, 2));
        let html = render_page_document(&middle, DisplayLang::Auto, "T", &linker);
        assert!(html.contains(
            r#"<a href="?page=1&amp;page_size=2&amp;q=ocean%20heat&amp;journal=Nature&amp;tag=A%26B">Prev</a>"#
        ));
        assert!(html.contains(
            r#"<a href="?page=3&amp;page_size=2&amp;q=ocean%20heat&amp;journal=Nature&amp;tag=A%26B">Next</a>"#
        ));
        assert!(!html.contains("page-3.html"));

        let unfiltered = FilterCriteria::default();
        let plain = QueryLinker {
            criteria: &unfiltered,
            page_size: 30,
        };
        assert_eq!(plain.href(4), "?page=4&page_size=30");
    }

    #[test]
    fn empty_result_reports_one_page() {
        let slice: PageSlice<Article> = PageSlice::empty(PageRequest::default());
        assert_eq!(render_stats(&slice), "0 results · page 1 of 1");
        assert!(render_text(&slice, DisplayLang::Auto).starts_with("0 results"));
    }

    #[test]
    fn export_writes_every_page() {
        let temp = tempdir().expect("tempdir");
        let records: Vec<Article> = (1..=5)
            .map(|index| Article {
                uid: format!("u{index}"),
                title_en: Some(format!("Title {index}")),
                pub_date: Some(format!("2024-01-0{index}")),
                ..Article::default()
            })
            .collect();
        let mut catalog = MemoryCatalog::new(records);
        let out = temp.path().join("site");
        let report = export_pages(
            &mut catalog,
            &FilterCriteria::default(),
            DisplayLang::En,
            2,
            &out,
        )
        .expect("export");
        assert_eq!(report.pages, 3);
        assert_eq!(report.records, 5);
        let last = fs::read_to_string(out.join("page-3.html")).expect("page 3");
        assert!(last.contains("Title 1"));
        assert!(!out.join("page-4.html").exists());

        let empty = export_pages(
            &mut MemoryCatalog::new(Vec::new()),
            &FilterCriteria::default(),
            DisplayLang::En,
            2,
            &temp.path().join("empty"),
        )
        .expect("export empty");
        assert_eq!(empty.pages, 1);
        assert!(temp.path().join("empty/page-1.html").exists());
    }
}
