//! Read-only view of the game catalog.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreError, CoreResult};

#[cfg(feature = "sqlite")]
use rusqlite::{params, OpenFlags, OptionalExtension};
#[cfg(feature = "sqlite")]
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: i64,
    pub platform_id: String,
    pub source_id: String,
    pub name: String,
    pub game_url: String,
    pub image_url: Option<String>,
    pub size_bytes: Option<u64>,
}

impl CatalogEntry {
    /// `root/<platform>/<game name>/<file name from the url>`.
    pub fn download_target(&self, root: &Path) -> PathBuf {
        let folder = sanitize_name(&self.name);
        let file = filename_from_url(&self.game_url)
            .map(|name| sanitize_name(&name))
            .filter(|name| name != "_")
            .unwrap_or_else(|| format!("{}.bin", folder));
        root.join(sanitize_name(&self.platform_id))
            .join(folder)
            .join(file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

pub trait CatalogReader: Send + Sync {
    /// Best matches first.
    fn search_by_text(&self, query: &str, page: Page) -> CoreResult<Vec<CatalogEntry>>;
    fn filter_by_platform(&self, platform_id: &str, page: Page) -> CoreResult<Vec<CatalogEntry>>;
    fn filter_by_source(&self, source_id: &str, page: Page) -> CoreResult<Vec<CatalogEntry>>;
    fn get(&self, id: i64) -> CoreResult<CatalogEntry>;
    /// Platform ids with their entry counts, alphabetically.
    fn platforms(&self) -> CoreResult<Vec<(String, usize)>>;
}

#[derive(Default)]
pub struct MemoryCatalog {
    entries: Vec<CatalogEntry>,
}

impl MemoryCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    fn sorted(&self, mut found: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        found.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        found
    }
}

impl CatalogReader for MemoryCatalog {
    fn search_by_text(&self, query: &str, page: Page) -> CoreResult<Vec<CatalogEntry>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let terms: Vec<&str> = needle.split_whitespace().collect();
        let mut found: Vec<CatalogEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                let name = entry.name.to_lowercase();
                terms.iter().all(|term| name.contains(term))
            })
            .cloned()
            .collect();
        found.sort_by_key(|entry| {
            let name = entry.name.to_lowercase();
            (!name.starts_with(&needle), name, entry.id)
        });
        Ok(page.apply(found))
    }

    fn filter_by_platform(&self, platform_id: &str, page: Page) -> CoreResult<Vec<CatalogEntry>> {
        let found = self
            .entries
            .iter()
            .filter(|entry| entry.platform_id == platform_id)
            .cloned()
            .collect();
        Ok(page.apply(self.sorted(found)))
    }

    fn filter_by_source(&self, source_id: &str, page: Page) -> CoreResult<Vec<CatalogEntry>> {
        let found = self
            .entries
            .iter()
            .filter(|entry| entry.source_id == source_id)
            .cloned()
            .collect();
        Ok(page.apply(self.sorted(found)))
    }

    fn get(&self, id: i64) -> CoreResult<CatalogEntry> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("catalog entry {}", id)))
    }

    fn platforms(&self) -> CoreResult<Vec<(String, usize)>> {
        let mut counts = std::collections::BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.platform_id.clone()).or_insert(0usize) += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

/// Catalog database produced by the offline build tool. Opened read-only;
/// uses the `games_fts` FTS5 table for ranked search when present.
#[cfg(feature = "sqlite")]
pub struct SqliteCatalog {
    pub path: PathBuf,
}

#[cfg(feature = "sqlite")]
const SELECT_GAME: &str = "
    SELECT g.id, g.platform_id, g.source_id, g.name, g.game_url, g.image_url, g.size_bytes
    FROM games g";

#[cfg(feature = "sqlite")]
fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogEntry> {
    Ok(CatalogEntry {
        id: row.get(0)?,
        platform_id: row.get(1)?,
        source_id: row.get(2)?,
        name: row.get(3)?,
        game_url: row.get(4)?,
        image_url: row.get(5)?,
        size_bytes: row.get::<_, Option<i64>>(6)?.map(|v| v.max(0) as u64),
    })
}

#[cfg(feature = "sqlite")]
impl SqliteCatalog {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let catalog = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = catalog.conn()?;
        conn.query_row("SELECT COUNT(*) FROM games", [], |row| row.get::<_, i64>(0))
            .map_err(|err| CoreError::Catalog(format!("{}: {}", catalog.path.display(), err)))?;
        Ok(catalog)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        rusqlite::Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| CoreError::Catalog(err.to_string()))
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> CoreResult<Vec<CatalogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|err| CoreError::Catalog(err.to_string()))?;
        let rows = stmt
            .query_map(params, entry_from_row)
            .map_err(|err| CoreError::Catalog(err.to_string()))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|err| CoreError::Catalog(err.to_string()))?);
        }
        Ok(entries)
    }

    fn has_fts(&self) -> CoreResult<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE name = 'games_fts'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|err| CoreError::Catalog(err.to_string()))?;
        Ok(found.is_some())
    }

    fn search_fts(&self, query: &str, page: Page) -> CoreResult<Vec<CatalogEntry>> {
        self.query(
            &format!(
                "{} JOIN games_fts f ON f.rowid = g.id
                 WHERE games_fts MATCH ?1
                 ORDER BY bm25(games_fts), g.name COLLATE NOCASE
                 LIMIT ?2 OFFSET ?3",
                SELECT_GAME
            ),
            params![fts_query(query), page.limit as i64, page.offset as i64],
        )
    }

    fn search_like(&self, query: &str, page: Page) -> CoreResult<Vec<CatalogEntry>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        self.query(
            &format!(
                "{} WHERE g.name LIKE ?1 ESCAPE '\\'
                 ORDER BY g.name COLLATE NOCASE, g.id
                 LIMIT ?2 OFFSET ?3",
                SELECT_GAME
            ),
            params![pattern, page.limit as i64, page.offset as i64],
        )
    }
}

#[cfg(feature = "sqlite")]
impl CatalogReader for SqliteCatalog {
    fn search_by_text(&self, query: &str, page: Page) -> CoreResult<Vec<CatalogEntry>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        if self.has_fts()? {
            match self.search_fts(query, page) {
                Ok(found) => return Ok(found),
                Err(err) => debug!("full-text search failed, using LIKE: {}", err),
            }
        }
        self.search_like(query, page)
    }

    fn filter_by_platform(&self, platform_id: &str, page: Page) -> CoreResult<Vec<CatalogEntry>> {
        self.query(
            &format!(
                "{} WHERE g.platform_id = ?1 ORDER BY g.name COLLATE NOCASE, g.id LIMIT ?2 OFFSET ?3",
                SELECT_GAME
            ),
            params![platform_id, page.limit as i64, page.offset as i64],
        )
    }

    fn filter_by_source(&self, source_id: &str, page: Page) -> CoreResult<Vec<CatalogEntry>> {
        self.query(
            &format!(
                "{} WHERE g.source_id = ?1 ORDER BY g.name COLLATE NOCASE, g.id LIMIT ?2 OFFSET ?3",
                SELECT_GAME
            ),
            params![source_id, page.limit as i64, page.offset as i64],
        )
    }

    fn get(&self, id: i64) -> CoreResult<CatalogEntry> {
        self.query(&format!("{} WHERE g.id = ?1", SELECT_GAME), params![id])?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::NotFound(format!("catalog entry {}", id)))
    }

    fn platforms(&self) -> CoreResult<Vec<(String, usize)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT platform_id, COUNT(*) FROM games GROUP BY platform_id ORDER BY platform_id")
            .map_err(|err| CoreError::Catalog(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))
            .map_err(|err| CoreError::Catalog(err.to_string()))?;
        let mut platforms = Vec::new();
        for row in rows {
            platforms.push(row.map_err(|err| CoreError::Catalog(err.to_string()))?);
        }
        Ok(platforms)
    }
}

/// Quoted prefix terms, implicitly AND-ed.
#[cfg(feature = "sqlite")]
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(feature = "sqlite")]
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.last()?.to_string();
    if name.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode_binary(name.replace('+', " ").as_bytes()).into_owned();
    Some(String::from_utf8_lossy(&decoded).into_owned())
}

/// Drops characters that are invalid in file names on common filesystems.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|ch| !matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|ch| !ch.is_control())
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, platform: &str, source: &str, name: &str) -> CatalogEntry {
        CatalogEntry {
            id,
            platform_id: platform.to_string(),
            source_id: source.to_string(),
            name: name.to_string(),
            game_url: format!("https://roms.test/{}/{}.zip", platform, id),
            image_url: None,
            size_bytes: Some(1_000 * id as u64),
        }
    }

    fn sample() -> Vec<CatalogEntry> {
        vec![
            entry(1, "snes", "archive", "Super Mario World"),
            entry(2, "snes", "mirror", "Super Metroid"),
            entry(3, "gba", "archive", "Mario Kart: Super Circuit"),
            entry(4, "gba", "archive", "Metroid Fusion"),
        ]
    }

    #[test]
    fn download_target_uses_decoded_url_name() {
        let mut game = entry(9, "psx", "archive", "Crash: Warped?");
        game.game_url = "https://roms.test/files/Crash%20Bandicoot%20%28USA%29.7z".to_string();
        assert_eq!(
            game.download_target(Path::new("/roms")),
            PathBuf::from("/roms/psx/Crash Warped/Crash Bandicoot (USA).7z")
        );

        game.game_url = "https://roms.test/".to_string();
        assert_eq!(
            game.download_target(Path::new("/roms")),
            PathBuf::from("/roms/psx/Crash Warped/Crash Warped.bin")
        );
    }

    #[test]
    fn sanitize_strips_reserved_characters() {
        assert_eq!(sanitize_name("a<b>c:d\"e/f\\g|h?i*"), "abcdefghi");
        assert_eq!(sanitize_name(" .. "), "_");
    }

    #[test]
    fn memory_catalog_pages_and_filters() {
        let catalog = MemoryCatalog::new(sample());
        let found = catalog.search_by_text("mario", Page::default()).unwrap();
        let ids: Vec<i64> = found.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 1]);

        let snes = catalog.filter_by_platform("snes", Page::new(1, 1)).unwrap();
        assert_eq!(snes.len(), 1);
        assert_eq!(snes[0].name, "Super Metroid");
        assert_eq!(catalog.filter_by_source("archive", Page::default()).unwrap().len(), 3);
        assert!(matches!(catalog.get(42), Err(CoreError::NotFound(_))));
        assert_eq!(
            catalog.platforms().unwrap(),
            vec![("gba".to_string(), 2), ("snes".to_string(), 2)]
        );
    }

    #[cfg(feature = "sqlite")]
    fn build_db(path: &Path, with_fts: bool) {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE games (
                id INTEGER PRIMARY KEY,
                platform_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                name TEXT NOT NULL,
                game_url TEXT NOT NULL,
                image_url TEXT,
                size_bytes INTEGER
            );",
        )
        .unwrap();
        for game in sample() {
            conn.execute(
                "INSERT INTO games VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    game.id,
                    game.platform_id,
                    game.source_id,
                    game.name,
                    game.game_url,
                    game.image_url,
                    game.size_bytes.map(|v| v as i64),
                ],
            )
            .unwrap();
        }
        if with_fts {
            conn.execute_batch(
                "CREATE VIRTUAL TABLE games_fts USING fts5(name);
                 INSERT INTO games_fts(rowid, name) SELECT id, name FROM games;",
            )
            .unwrap();
        }
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_catalog_searches_with_fts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        build_db(&path, true);
        let catalog = SqliteCatalog::open(&path).unwrap();

        let found = catalog.search_by_text("metro", Page::default()).unwrap();
        let mut ids: Vec<i64> = found.iter().map(|e| e.id).collect();
        ids.sort();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(catalog.get(3).unwrap().name, "Mario Kart: Super Circuit");
        assert_eq!(catalog.filter_by_platform("gba", Page::new(1, 0)).unwrap()[0].id, 3);
        assert_eq!(catalog.filter_by_source("mirror", Page::default()).unwrap().len(), 1);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_catalog_falls_back_to_like() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        build_db(&path, false);
        let catalog = SqliteCatalog::open(&path).unwrap();

        let found = catalog.search_by_text("Kart: Super", Page::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 3);
        assert!(catalog.search_by_text("100%", Page::default()).unwrap().is_empty());
        assert_eq!(catalog.platforms().unwrap().len(), 2);
    }
}
