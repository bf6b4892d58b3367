use super::{
    Boardgame, Candidate, Category, Constraints, Designer, GameStats, GameStore, StoreError,
    StoreResult, constraint_clause, like_pattern, non_blank,
};
use rusqlite::{Connection, OpenFlags, Row, params, params_from_iter};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Tables the store reads from. Applied by [`SqliteStore::create`] and
/// [`SqliteStore::in_memory`]; existing databases are opened as they are.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    g_id        INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    avgscore    REAL,
    numvotes    INTEGER,
    minplayers  INTEGER,
    maxplayers  INTEGER,
    minplaytime INTEGER,
    maxplaytime INTEGER
);
CREATE TABLE IF NOT EXISTS designers (
    des_id  INTEGER PRIMARY KEY,
    name    TEXT NOT NULL,
    country TEXT
);
CREATE TABLE IF NOT EXISTS categories (
    c_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS game_designers (
    g_id   INTEGER NOT NULL REFERENCES games (g_id),
    des_id INTEGER NOT NULL REFERENCES designers (des_id),
    PRIMARY KEY (g_id, des_id)
);
CREATE TABLE IF NOT EXISTS game_categories (
    g_id INTEGER NOT NULL REFERENCES games (g_id),
    c_id INTEGER NOT NULL REFERENCES categories (c_id),
    PRIMARY KEY (g_id, c_id)
);
"#;

const GAME_COLUMNS: &str =
    "g.g_id, g.name, g.avgscore, g.numvotes, g.minplayers, g.maxplayers, g.minplaytime, g.maxplaytime";

fn placeholder(n: usize) -> String {
    format!("?{}", n)
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(placeholder)
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQLite backend. One connection guarded by a mutex; every query holds the
/// lock only for its own duration.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens an existing database read-only.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!("Opening SQLite database {} (read-only)", path.display());
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::from_connection(conn))
    }

    /// Opens (or creates) a writable database and applies [`SCHEMA`].
    pub fn create(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Runs a batch of statements, e.g. to seed a freshly created database.
    pub fn load_sql(&self, sql: &str) -> StoreResult<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("SQLite connection lock poisoned".to_string()))
    }

    fn query_games(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<Boardgame>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let games = stmt
            .query_map(params, game_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(games)
    }

    fn candidates(
        &self,
        link_table: &str,
        link_column: &str,
        overlap_column: &str,
        ids: &[i64],
        constraints: &Constraints,
    ) -> StoreResult<Vec<Candidate>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = constraint_clause(constraints, ids.len() + 1, placeholder);
        let limit_at = ids.len() + filter.params.len() + 1;
        let sql = format!(
            "SELECT g.g_id, g.name, COUNT(DISTINCT l.{link_column}) AS overlap \
             FROM {link_table} l JOIN games g ON g.g_id = l.g_id \
             WHERE l.{link_column} IN ({ids}) AND {filter} \
             GROUP BY g.g_id, g.name, g.numvotes \
             ORDER BY overlap DESC, g.numvotes DESC NULLS LAST, g.g_id \
             LIMIT {limit}",
            ids = placeholders(1, ids.len()),
            filter = filter.sql,
            limit = placeholder(limit_at),
        );
        let mut values: Vec<i64> = ids.to_vec();
        values.extend(filter.params);
        values.push(constraints.limit_candidates);

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                let overlap: i64 = row.get(2)?;
                Ok(Candidate {
                    g_id: row.get(0)?,
                    name: row.get(1)?,
                    cat_overlap: (overlap_column == "cat_overlap").then_some(overlap),
                    designer_overlap: (overlap_column == "designer_overlap").then_some(overlap),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            "{} candidates from {} {} ids",
            candidates.len(),
            ids.len(),
            link_column
        );
        Ok(candidates)
    }
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<Boardgame> {
    Ok(Boardgame {
        g_id: row.get(0)?,
        name: row.get(1)?,
        avgscore: row.get(2)?,
        numvotes: row.get(3)?,
        minplayers: row.get(4)?,
        maxplayers: row.get(5)?,
        minplaytime: row.get(6)?,
        maxplaytime: row.get(7)?,
        categories: Vec::new(),
        designers: Vec::new(),
    })
}

fn designer_from_row(row: &Row<'_>) -> rusqlite::Result<Designer> {
    Ok(Designer {
        des_id: row.get(0)?,
        name: row.get(1)?,
        country: row.get(2)?,
    })
}

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        c_id: row.get(0)?,
        name: row.get(1)?,
    })
}

impl GameStore for SqliteStore {
    fn all_games(&self) -> StoreResult<Vec<Boardgame>> {
        let sql = format!("SELECT {GAME_COLUMNS} FROM games g ORDER BY g.name");
        self.query_games(&sql, [])
    }

    fn games_by_name(&self, name_query: &str, limit: i64) -> StoreResult<Vec<Boardgame>> {
        let sql = format!(
            "SELECT {GAME_COLUMNS} FROM games g \
             WHERE lower(g.name) LIKE ?1 ESCAPE '\\' \
             ORDER BY g.numvotes DESC NULLS LAST, g.name LIMIT ?2"
        );
        self.query_games(&sql, params![like_pattern(name_query), limit])
    }

    fn all_designers(&self) -> StoreResult<Vec<Designer>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT des_id, name, country FROM designers ORDER BY name")?;
        let designers = stmt
            .query_map([], designer_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(designers)
    }

    fn games_by_designer(&self, designer_name: &str) -> StoreResult<Vec<Boardgame>> {
        let sql = format!(
            "SELECT {GAME_COLUMNS}, d.des_id, d.name, d.country \
             FROM games g \
             JOIN game_designers gd ON gd.g_id = g.g_id \
             JOIN designers d ON d.des_id = gd.des_id \
             WHERE lower(d.name) LIKE ?1 ESCAPE '\\' \
             ORDER BY g.name, g.g_id, d.name"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![like_pattern(designer_name)], |row| {
                let game = game_from_row(row)?;
                let designer = Designer {
                    des_id: row.get(8)?,
                    name: row.get(9)?,
                    country: row.get(10)?,
                };
                Ok((game, designer))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut games: Vec<Boardgame> = Vec::new();
        for (game, designer) in rows {
            match games.last_mut() {
                Some(last) if last.g_id == game.g_id => last.designers.push(designer),
                _ => {
                    let mut game = game;
                    game.designers.push(designer);
                    games.push(game);
                }
            }
        }
        Ok(games)
    }

    fn game_profile(&self, g_id: i64) -> StoreResult<Boardgame> {
        let sql = format!("SELECT {GAME_COLUMNS} FROM games g WHERE g.g_id = ?1");
        let mut game = self
            .query_games(&sql, params![g_id])?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound(g_id))?;

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.c_id, c.name FROM categories c \
             JOIN game_categories gc ON gc.c_id = c.c_id \
             WHERE gc.g_id = ?1 ORDER BY c.name",
        )?;
        game.categories = stmt
            .query_map(params![g_id], category_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT d.des_id, d.name, d.country FROM designers d \
             JOIN game_designers gd ON gd.des_id = d.des_id \
             WHERE gd.g_id = ?1 ORDER BY d.name",
        )?;
        game.designers = stmt
            .query_map(params![g_id], designer_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(game)
    }

    fn search_categories(&self, query: Option<&str>, limit: i64) -> StoreResult<Vec<Category>> {
        let conn = self.lock()?;
        let categories = match non_blank(query) {
            Some(q) => conn
                .prepare(
                    "SELECT c_id, name FROM categories \
                     WHERE lower(name) LIKE ?1 ESCAPE '\\' ORDER BY name LIMIT ?2",
                )?
                .query_map(params![like_pattern(q), limit], category_from_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => conn
                .prepare("SELECT c_id, name FROM categories ORDER BY name LIMIT ?1")?
                .query_map(params![limit], category_from_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(categories)
    }

    fn search_designers(&self, query: Option<&str>, limit: i64) -> StoreResult<Vec<Designer>> {
        let conn = self.lock()?;
        let designers = match non_blank(query) {
            Some(q) => conn
                .prepare(
                    "SELECT des_id, name, country FROM designers \
                     WHERE lower(name) LIKE ?1 ESCAPE '\\' ORDER BY name LIMIT ?2",
                )?
                .query_map(params![like_pattern(q), limit], designer_from_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => conn
                .prepare("SELECT des_id, name, country FROM designers ORDER BY name LIMIT ?1")?
                .query_map(params![limit], designer_from_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(designers)
    }

    fn find_games(&self, constraints: &Constraints, limit: i64) -> StoreResult<Vec<Boardgame>> {
        let filter = constraint_clause(constraints, 1, placeholder);
        let sql = format!(
            "SELECT {GAME_COLUMNS} FROM games g WHERE {} \
             ORDER BY g.numvotes DESC NULLS LAST, g.name LIMIT {}",
            filter.sql,
            placeholder(filter.params.len() + 1),
        );
        let mut values = filter.params;
        values.push(limit);
        self.query_games(&sql, params_from_iter(values.iter()))
    }

    fn candidates_by_categories(
        &self,
        c_ids: &[i64],
        constraints: &Constraints,
    ) -> StoreResult<Vec<Candidate>> {
        self.candidates("game_categories", "c_id", "cat_overlap", c_ids, constraints)
    }

    fn candidates_by_designers(
        &self,
        des_ids: &[i64],
        constraints: &Constraints,
    ) -> StoreResult<Vec<Candidate>> {
        self.candidates(
            "game_designers",
            "des_id",
            "designer_overlap",
            des_ids,
            constraints,
        )
    }

    fn game_stats(&self, g_ids: &[i64]) -> StoreResult<HashMap<i64, GameStats>> {
        if g_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT g_id, avgscore, numvotes FROM games WHERE g_id IN ({})",
            placeholders(1, g_ids.len())
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(g_ids.iter()), |row| {
                let avgscore: Option<f64> = row.get(1)?;
                let numvotes: Option<f64> = row.get(2)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    GameStats {
                        avgscore: avgscore.unwrap_or(0.0),
                        numvotes: numvotes.unwrap_or(0.0),
                    },
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }
}

/// Small catalogue shared by store, tool and end-to-end tests.
#[cfg(test)]
pub(crate) const FIXTURE_SQL: &str = r#"
INSERT INTO games VALUES (1, 'Catan', 7.1, 100000, 3, 4, 60, 120);
INSERT INTO games VALUES (2, 'Pandemic', 7.6, 90000, 2, 4, 45, 45);
INSERT INTO games VALUES (3, 'Pandemic Legacy: Season 1', 8.5, 50000, 2, 4, 60, 60);
INSERT INTO games VALUES (4, 'Risk', 5.6, 30000, 2, 6, 120, 120);
INSERT INTO games VALUES (5, 'Monopoly', 4.4, 40000, 2, 8, 60, 180);
INSERT INTO games VALUES (6, 'Forbidden Island', 6.8, 20000, 2, 4, 30, 30);
INSERT INTO games VALUES (7, 'Obscure Game', 6.0, 100, 1, 2, 20, 20);
INSERT INTO games VALUES (8, 'Ra', 7.5, 15000, 2, 5, 45, 60);

INSERT INTO designers VALUES (1, 'Klaus Teuber', 'Germany');
INSERT INTO designers VALUES (2, 'Matt Leacock', 'USA');
INSERT INTO designers VALUES (3, 'Rob Daviau', 'USA');
INSERT INTO designers VALUES (4, 'Reiner Knizia', 'Germany');
INSERT INTO designers VALUES (5, 'Elizabeth Magie', 'USA');
INSERT INTO designers VALUES (6, 'Albert Lamorisse', NULL);

INSERT INTO categories VALUES (1, 'Strategy');
INSERT INTO categories VALUES (2, 'Cooperative');
INSERT INTO categories VALUES (3, 'Economic');
INSERT INTO categories VALUES (4, 'Wargame');
INSERT INTO categories VALUES (5, 'Family');

INSERT INTO game_designers VALUES (1, 1), (2, 2), (3, 2), (3, 3), (4, 6), (5, 5), (6, 2), (7, 3), (8, 4);
INSERT INTO game_categories VALUES
    (1, 1), (1, 3), (1, 5),
    (2, 1), (2, 2),
    (3, 1), (3, 2),
    (4, 1), (4, 4),
    (5, 3), (5, 5),
    (6, 2), (6, 5),
    (7, 5),
    (8, 1), (8, 3);
"#;

#[cfg(test)]
pub(crate) fn fixture_store() -> SqliteStore {
    let store = SqliteStore::in_memory().unwrap();
    store.load_sql(FIXTURE_SQL).unwrap();
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(games: &[Boardgame]) -> Vec<i64> {
        games.iter().map(|g| g.g_id).collect()
    }

    fn candidate_ids(candidates: &[Candidate]) -> Vec<i64> {
        candidates.iter().map(|c| c.g_id).collect()
    }

    fn open_constraints() -> Constraints {
        Constraints {
            min_votes: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_all_games_ordered_by_name() {
        let store = fixture_store();
        let names: Vec<String> = store.all_games().unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(
            names,
            vec![
                "Catan",
                "Forbidden Island",
                "Monopoly",
                "Obscure Game",
                "Pandemic",
                "Pandemic Legacy: Season 1",
                "Ra",
                "Risk"
            ]
        );
    }

    #[test]
    fn test_games_by_name_is_case_insensitive_and_vote_ordered() {
        let store = fixture_store();
        let games = store.games_by_name("  PANDEMIC ", 10).unwrap();
        assert_eq!(ids(&games), vec![2, 3]);

        let limited = store.games_by_name("a", 2).unwrap();
        assert_eq!(ids(&limited), vec![1, 2]);

        assert!(store.games_by_name("zzz", 10).unwrap().is_empty());
    }

    #[test]
    fn test_games_by_designer_attaches_matching_designer() {
        let store = fixture_store();
        let games = store.games_by_designer("leacock").unwrap();
        assert_eq!(ids(&games), vec![6, 2, 3]);
        assert!(games.iter().all(|g| g.designers.len() == 1));
        assert_eq!(games[0].designers[0].name, "Matt Leacock");
    }

    #[test]
    fn test_all_designers() {
        let store = fixture_store();
        let designers = store.all_designers().unwrap();
        assert_eq!(designers.len(), 6);
        assert_eq!(designers[0].name, "Albert Lamorisse");
        assert_eq!(designers[0].country, None);
    }

    #[test]
    fn test_game_profile_includes_categories_and_designers() {
        let store = fixture_store();
        let game = store.game_profile(3).unwrap();
        assert_eq!(game.name, "Pandemic Legacy: Season 1");
        assert_eq!(game.avgscore, Some(8.5));
        let categories: Vec<&str> = game.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(categories, vec!["Cooperative", "Strategy"]);
        let designers: Vec<&str> = game.designers.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(designers, vec!["Matt Leacock", "Rob Daviau"]);
    }

    #[test]
    fn test_game_profile_missing_id() {
        let store = fixture_store();
        assert!(matches!(store.game_profile(999), Err(StoreError::NotFound(999))));
    }

    #[test]
    fn test_search_categories_blank_query_lists_all() {
        let store = fixture_store();
        let all = store.search_categories(Some("  "), 50).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].name, "Cooperative");

        let strategy = store.search_categories(Some("strat"), 50).unwrap();
        assert_eq!(strategy, vec![Category { c_id: 1, name: "Strategy".into() }]);

        assert_eq!(store.search_categories(None, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_search_designers() {
        let store = fixture_store();
        let found = store.search_designers(Some("KNIZIA"), 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].des_id, 4);
        assert_eq!(store.search_designers(None, 100).unwrap().len(), 6);
    }

    #[test]
    fn test_find_games_filters_players_and_playtime() {
        let store = fixture_store();
        let constraints = Constraints {
            minplayers: Some(5),
            ..Default::default()
        };
        assert_eq!(ids(&store.find_games(&constraints, 10).unwrap()), vec![5, 4, 8]);

        let constraints = Constraints {
            minplayers: Some(2),
            maxplaytime: Some(45),
            ..Default::default()
        };
        assert_eq!(ids(&store.find_games(&constraints, 10).unwrap()), vec![2, 6]);
    }

    #[test]
    fn test_find_games_respects_min_votes() {
        let store = fixture_store();
        let constraints = Constraints {
            minplayers: Some(1),
            maxplayers: Some(1),
            ..Default::default()
        };
        assert!(store.find_games(&constraints, 10).unwrap().is_empty());
        let constraints = Constraints {
            min_votes: 0,
            ..constraints
        };
        assert_eq!(ids(&store.find_games(&constraints, 10).unwrap()), vec![7]);
    }

    #[test]
    fn test_candidates_by_categories_ranks_overlap_then_votes() {
        let store = fixture_store();
        let candidates = store
            .candidates_by_categories(&[1, 2], &open_constraints())
            .unwrap();
        assert_eq!(candidate_ids(&candidates), vec![2, 3, 1, 4, 6, 8]);
        assert_eq!(candidates[0].cat_overlap, Some(2));
        assert_eq!(candidates[0].designer_overlap, None);
        assert_eq!(candidates[2].cat_overlap, Some(1));
    }

    #[test]
    fn test_candidates_apply_constraints() {
        let store = fixture_store();
        let family = store
            .candidates_by_categories(&[5], &Constraints::default())
            .unwrap();
        assert_eq!(candidate_ids(&family), vec![1, 5, 6]);

        let two_players = Constraints {
            players: Some(2),
            ..Default::default()
        };
        let family = store.candidates_by_categories(&[5], &two_players).unwrap();
        assert_eq!(candidate_ids(&family), vec![5, 6]);

        let limited = Constraints {
            limit_candidates: 1,
            ..open_constraints()
        };
        let family = store.candidates_by_categories(&[5], &limited).unwrap();
        assert_eq!(candidate_ids(&family), vec![1]);
    }

    #[test]
    fn test_candidates_by_designers() {
        let store = fixture_store();
        let candidates = store
            .candidates_by_designers(&[2, 3], &open_constraints())
            .unwrap();
        assert_eq!(candidate_ids(&candidates), vec![3, 2, 6, 7]);
        assert_eq!(candidates[0].designer_overlap, Some(2));
        assert_eq!(candidates[0].cat_overlap, None);
    }

    #[test]
    fn test_empty_id_lists_return_empty() {
        let store = fixture_store();
        assert!(store.candidates_by_categories(&[], &open_constraints()).unwrap().is_empty());
        assert!(store.candidates_by_designers(&[], &open_constraints()).unwrap().is_empty());
        assert!(store.game_stats(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_game_stats() {
        let store = fixture_store();
        let stats = store.game_stats(&[1, 7, 404]).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[&1].avgscore, 7.1);
        assert_eq!(stats[&7].numvotes, 100.0);
    }

    #[test]
    fn test_fetch_game_cards_skips_unknown_and_keeps_order() {
        let store = fixture_store();
        let cards = store.fetch_game_cards(&[3, 999, 1]).unwrap();
        assert_eq!(ids(&cards), vec![3, 1]);
        assert!(!cards[1].categories.is_empty());
    }

    #[test]
    fn test_open_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.db");
        {
            let store = SqliteStore::create(&path).unwrap();
            store.load_sql(FIXTURE_SQL).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.all_games().unwrap().len(), 8);
        assert!(store.load_sql("DELETE FROM games").is_err());
    }
}
