use crate::errors::Result;
use crate::models::{ContentType, FileRecord, Timestamp, Visibility};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use sqlx::{Arguments, Row, sqlite::SqliteArguments};
use std::fmt::Write;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Relevance,
    Name,
    Date,
    Size,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub content_type: Option<ContentType>,
    pub extension: Option<String>,
    pub folder_id: Option<i64>,
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub visibility: Option<Visibility>,
    pub include_remote: bool,
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub sort_by: SortBy,
    pub sort_asc: bool,
    pub limit: u32,
    pub offset: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            content_type: None,
            extension: None,
            folder_id: None,
            date_from: None,
            date_to: None,
            min_size: None,
            max_size: None,
            visibility: None,
            include_remote: false,
            tags: Vec::new(),
            exclude_tags: Vec::new(),
            sort_by: SortBy::Relevance,
            sort_asc: false,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub file: FileRecord,
    /// Negated bm25; larger is a better match. 0 for non-text queries.
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Compact row for list views: mime, EXIF and secondary timestamps elided.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CompactSearchResult {
    pub id: i64,
    pub name: String,
    pub relative_path: Option<String>,
    pub size: i64,
    pub content_type: ContentType,
    pub modified_at: Timestamp,
    pub is_remote: bool,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

enum Wrap {
    Select,
    Count,
}

/// Compiles `SearchQuery` into one compound statement over the local and
/// cloud FTS tables.
pub struct SearchService {
    store: Store,
}

impl SearchService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let (sql, args) = build_query(query, Wrap::Select)?;
        let rows = sqlx::query_with(&sql, args)
            .fetch_all(self.store.pool())
            .await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            results.push(SearchResult {
                file: FileRecord::from_row(row)?,
                score: row.try_get("score")?,
                snippet: row.try_get("snippet")?,
            });
        }
        Ok(results)
    }

    pub async fn search_compact(&self, query: &SearchQuery) -> Result<Vec<CompactSearchResult>> {
        Ok(self
            .search(query)
            .await?
            .into_iter()
            .map(|result| CompactSearchResult {
                id: result.file.id,
                name: result.file.name,
                relative_path: result.file.relative_path,
                size: result.file.size,
                content_type: result.file.content_type,
                modified_at: result.file.modified_at,
                is_remote: result.file.source_device_id.is_some(),
                score: result.score,
                snippet: result.snippet,
            })
            .collect())
    }

    pub async fn count(&self, query: &SearchQuery) -> Result<i64> {
        let (sql, args) = build_query(query, Wrap::Count)?;
        let row = sqlx::query_with(&sql, args)
            .fetch_one(self.store.pool())
            .await?;
        Ok(row.try_get("total")?)
    }

    /// Distinct file names starting with `prefix`, across both FTS tables.
    pub async fn suggest(&self, prefix: &str, limit: u32) -> Result<Vec<String>> {
        let term = escape_match_text(prefix);
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = format!("name : {term}");
        let rows = sqlx::query(
            "SELECT DISTINCT name FROM ( \
               SELECT name FROM files_fts WHERE files_fts MATCH ? \
               UNION ALL \
               SELECT name FROM cloud_files_fts WHERE cloud_files_fts MATCH ? \
             ) ORDER BY name COLLATE NOCASE LIMIT ?",
        )
        .bind(&match_expr)
        .bind(&match_expr)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;
        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            names.push(row.try_get("name")?);
        }
        Ok(names)
    }
}

/// Quote every token and add a prefix star, so `" * ( ) : ^` and friends
/// reach the tokenizer as literal text: `family pics` -> `"family"* "pics"*`.
pub fn escape_match_text(text: &str) -> String {
    text.split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn qualified_columns() -> String {
    FileRecord::COLUMNS
        .split(", ")
        .map(|col| format!("f.{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn remote_leg_allowed(query: &SearchQuery) -> bool {
    query.include_remote
        && query.folder_id.is_none()
        && query.visibility.is_none()
        && query.tags.is_empty()
        && query.exclude_tags.is_empty()
}

fn build_query(query: &SearchQuery, wrap: Wrap) -> Result<(String, SqliteArguments<'static>)> {
    let mut args = SqliteArguments::default();
    let match_text = query
        .text
        .as_deref()
        .map(escape_match_text)
        .filter(|it| !it.is_empty());

    let mut sql = String::from("SELECT * FROM (");
    write_leg(&mut sql, &mut args, query, match_text.as_deref(), false)?;
    if remote_leg_allowed(query) {
        sql.push_str(" UNION ALL ");
        write_leg(&mut sql, &mut args, query, match_text.as_deref(), true)?;
    }
    sql.push(')');

    match wrap {
        Wrap::Count => {
            let sql = format!("SELECT COUNT(*) AS total FROM ({sql})");
            Ok((sql, args))
        }
        Wrap::Select => {
            let mut sql = sql;
            let direction = if query.sort_asc { "ASC" } else { "DESC" };
            let effective = match (query.sort_by, &match_text) {
                (SortBy::Relevance, None) => None,
                (sort, _) => Some(sort),
            };
            match effective {
                Some(SortBy::Relevance) => {
                    write!(sql, " ORDER BY score {direction}").ok();
                }
                Some(SortBy::Name) => {
                    write!(sql, " ORDER BY name COLLATE NOCASE {direction}").ok();
                }
                Some(SortBy::Date) => {
                    write!(sql, " ORDER BY modified_at {direction}").ok();
                }
                Some(SortBy::Size) => {
                    write!(sql, " ORDER BY size {direction}").ok();
                }
                None => {
                    sql.push_str(" ORDER BY modified_at DESC");
                }
            }
            add(&mut args, query.limit as i64)?;
            add(&mut args, query.offset as i64)?;
            sql.push_str(" LIMIT ? OFFSET ?");
            Ok((sql, args))
        }
    }
}

fn write_leg(
    sql: &mut String,
    args: &mut SqliteArguments<'static>,
    query: &SearchQuery,
    match_text: Option<&str>,
    remote: bool,
) -> Result<()> {
    let fts = if remote { "cloud_files_fts" } else { "files_fts" };
    let columns = qualified_columns();
    match match_text {
        Some(text) => {
            write!(
                sql,
                "SELECT {columns}, -bm25({fts}) AS score, \
                 snippet({fts}, -1, '<b>', '</b>', '…', 32) AS snippet \
                 FROM {fts} JOIN files f ON {fts}.rowid = f.id WHERE {fts} MATCH ?"
            )
            .ok();
            add(args, text.to_string())?;
        }
        None => {
            write!(
                sql,
                "SELECT {columns}, 0.0 AS score, NULL AS snippet FROM files f WHERE 1 = 1"
            )
            .ok();
        }
    }
    if remote {
        sql.push_str(" AND f.source_device_id IS NOT NULL");
    } else {
        sql.push_str(" AND f.source_device_id IS NULL");
    }
    if let Some(content_type) = query.content_type {
        add(args, content_type.as_i64())?;
        sql.push_str(" AND f.content_type = ?");
    }
    if let Some(extension) = &query.extension {
        add(args, extension.to_lowercase())?;
        sql.push_str(" AND f.extension = ?");
    }
    if let Some(date_from) = query.date_from {
        add(args, date_from)?;
        sql.push_str(" AND f.modified_at >= ?");
    }
    if let Some(date_to) = query.date_to {
        add(args, date_to)?;
        sql.push_str(" AND f.modified_at <= ?");
    }
    if let Some(min_size) = query.min_size {
        add(args, min_size)?;
        sql.push_str(" AND f.size >= ?");
    }
    if let Some(max_size) = query.max_size {
        add(args, max_size)?;
        sql.push_str(" AND f.size <= ?");
    }
    // folder / visibility / tag predicates are meaningless for remote rows;
    // the remote leg is only emitted when none of them are set.
    if !remote {
        if let Some(folder_id) = query.folder_id {
            add(args, folder_id)?;
            sql.push_str(" AND f.folder_id = ?");
        }
        if let Some(visibility) = query.visibility {
            add(args, visibility.as_i64())?;
            sql.push_str(" AND f.visibility = ?");
        }
        for tag in &query.tags {
            add(args, tag.clone())?;
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM file_tags ft JOIN tags t ON t.id = ft.tag_id \
                 WHERE ft.file_id = f.id AND t.name = ? COLLATE NOCASE)",
            );
        }
        for tag in &query.exclude_tags {
            add(args, tag.clone())?;
            sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM file_tags ft JOIN tags t ON t.id = ft.tag_id \
                 WHERE ft.file_id = f.id AND t.name = ? COLLATE NOCASE)",
            );
        }
    }
    Ok(())
}

fn add<'q, T>(args: &mut SqliteArguments<'q>, value: T) -> Result<()>
where
    T: 'q + sqlx::Encode<'q, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + Send,
{
    args.add(value)
        .map_err(|e| anyhow::format_err!("Failed to bind search argument: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn corpus() -> SearchService {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO watched_folders (path, name) VALUES ('/tmp/corpus', 'corpus')")
            .execute(store.pool())
            .await
            .unwrap();
        // 20 local files; five mention vacation with varying density
        for i in 0..20 {
            let (name, content_type) = if i < 5 {
                (format!("vacation_{i:02}.jpg"), 1)
            } else {
                (format!("receipt_{i:02}.pdf"), 4)
            };
            sqlx::query(
                "INSERT INTO files (folder_id, relative_path, name, extension, size, \
                 content_type, modified_at) VALUES (1, ?, ?, ?, ?, ?, ?)",
            )
            .bind(format!("sub/{name}"))
            .bind(&name)
            .bind(if i < 5 { "jpg" } else { "pdf" })
            .bind(100 + i as i64)
            .bind(content_type)
            .bind(1000 + i as i64)
            .execute(store.pool())
            .await
            .unwrap();
            if i < 5 {
                let text = "vacation ".repeat(5 - i as usize);
                sqlx::query("UPDATE files_fts SET extracted_text = ? WHERE rowid = ?")
                    .bind(text)
                    .bind(i as i64 + 1)
                    .execute(store.pool())
                    .await
                    .unwrap();
            }
        }
        // one remote row
        sqlx::query(
            "INSERT INTO files (name, relative_path, extension, size, content_type, \
             modified_at, source_device_id, remote_file_id) \
             VALUES ('vacation_remote.jpg', 'r/vacation_remote.jpg', 'jpg', 500, 1, 2000, 'dev-9', 77)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        SearchService::new(store)
    }

    #[tokio::test]
    async fn text_search_filters_and_ranks() {
        let service = corpus().await;
        let query = SearchQuery {
            text: Some("vacation".into()),
            content_type: Some(ContentType::Image),
            limit: 10,
            ..Default::default()
        };
        let results = service.search(&query).await.unwrap();
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score, "results must be score-descending");
        }
        assert!(
            results
                .iter()
                .any(|r| r.snippet.as_deref().unwrap_or_default().contains("<b>vacation</b>"))
        );
        assert_eq!(service.count(&query).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn remote_leg_joins_when_compatible() {
        let service = corpus().await;
        let query = SearchQuery {
            text: Some("vacation".into()),
            include_remote: true,
            limit: 20,
            ..Default::default()
        };
        let results = service.search(&query).await.unwrap();
        assert_eq!(results.len(), 6);
        assert_eq!(results.iter().filter(|r| r.file.is_remote()).count(), 1);

        // folder filter suppresses the remote leg
        let query = SearchQuery {
            text: Some("vacation".into()),
            include_remote: true,
            folder_id: Some(1),
            limit: 20,
            ..Default::default()
        };
        let results = service.search(&query).await.unwrap();
        assert!(results.iter().all(|r| !r.file.is_remote()));
    }

    #[tokio::test]
    async fn default_sort_without_text_is_modified_desc() {
        let service = corpus().await;
        let query = SearchQuery {
            limit: 50,
            ..Default::default()
        };
        let results = service.search(&query).await.unwrap();
        assert_eq!(results.len(), 20);
        for pair in results.windows(2) {
            assert!(pair[0].file.modified_at >= pair[1].file.modified_at);
        }
    }

    #[tokio::test]
    async fn special_characters_are_escaped() {
        let service = corpus().await;
        for hostile in ["vac*(tion:", "\"quoted\"", "a^b (c) *", ":^\"*()"] {
            let query = SearchQuery {
                text: Some(hostile.to_string()),
                ..Default::default()
            };
            // must not produce an FTS syntax error
            service.search(&query).await.unwrap();
        }
        assert_eq!(escape_match_text("family pics"), "\"family\"* \"pics\"*");
        assert_eq!(escape_match_text("say \"hi\""), "\"say\"* \"\"\"hi\"\"\"*");
    }

    #[tokio::test]
    async fn suggest_returns_prefix_matches() {
        let service = corpus().await;
        let names = service.suggest("vaca", 10).await.unwrap();
        assert_eq!(names.len(), 6);
        assert!(names.iter().all(|n| n.starts_with("vacation")));
        assert!(service.suggest("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compact_results_elide_mime() {
        let service = corpus().await;
        let query = SearchQuery {
            text: Some("vacation".into()),
            limit: 5,
            ..Default::default()
        };
        let compact = service.search_compact(&query).await.unwrap();
        let json = serde_json::to_string(&compact[0]).unwrap();
        assert!(!json.contains("mimeType"));
        assert!(json.contains("modifiedAt"));
    }

    #[tokio::test]
    async fn pagination_applies() {
        let service = corpus().await;
        let query = SearchQuery {
            limit: 7,
            offset: 14,
            ..Default::default()
        };
        let results = service.search(&query).await.unwrap();
        assert_eq!(results.len(), 6);
    }
}
