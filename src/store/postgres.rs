use super::{
    Boardgame, Candidate, Category, Constraints, Designer, GameStats, GameStore, StoreError,
    StoreResult, constraint_clause, like_pattern, non_blank,
};
use postgres::{Client, NoTls, Row};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const GAME_COLUMNS: &str = "g.g_id::bigint, g.name::text, g.avgscore::float8, g.numvotes::bigint, \
     g.minplayers::bigint, g.maxplayers::bigint, g.minplaytime::bigint, g.maxplaytime::bigint";

fn placeholder(n: usize) -> String {
    format!("${}::bigint", n)
}

/// Connection settings for the PostgreSQL backend.
#[derive(Clone, PartialEq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    /// Server-side `statement_timeout` applied to every query.
    pub statement_timeout: Duration,
}

// Keep the password out of logs.
impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"****")
            .field("connect_timeout", &self.connect_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .finish()
    }
}

impl PostgresConfig {
    fn to_client_config(&self) -> postgres::Config {
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .password(&self.password)
            .connect_timeout(self.connect_timeout)
            .options(&format!(
                "-c statement_timeout={}",
                self.statement_timeout.as_millis()
            ));
        config
    }
}

/// PostgreSQL backend.
///
/// The synchronous `postgres` client drives its own runtime, so every call
/// is made from a dedicated OS thread rather than from a tokio worker.
pub struct PostgresStore {
    client: Arc<Mutex<Client>>,
}

impl PostgresStore {
    pub fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        info!(
            "Connecting to PostgreSQL {}:{}/{} as {}",
            config.host, config.port, config.database, config.user
        );
        let client_config = config.to_client_config();
        let client = std::thread::spawn(move || client_config.connect(NoTls))
            .join()
            .map_err(|_| StoreError::Backend("PostgreSQL connect thread panicked".to_string()))??;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Client) -> Result<T, postgres::Error> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        std::thread::spawn(move || {
            let mut guard = client
                .lock()
                .map_err(|_| StoreError::Backend("PostgreSQL client lock poisoned".to_string()))?;
            f(&mut guard).map_err(StoreError::from)
        })
        .join()
        .map_err(|_| StoreError::Backend("PostgreSQL worker thread panicked".to_string()))?
    }

    fn candidates(
        &self,
        link_table: &'static str,
        link_column: &'static str,
        ids: &[i64],
        constraints: &Constraints,
    ) -> StoreResult<Vec<(i64, Option<String>, i64)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = constraint_clause(constraints, 2, placeholder);
        let sql = format!(
            "SELECT g.g_id::bigint, g.name::text, COUNT(DISTINCT l.{link_column})::bigint AS overlap \
             FROM {link_table} l JOIN games g ON g.g_id = l.g_id \
             WHERE l.{link_column} = ANY($1::bigint[]) AND {filter} \
             GROUP BY g.g_id, g.name, g.numvotes \
             ORDER BY overlap DESC, g.numvotes DESC NULLS LAST, g.g_id \
             LIMIT {limit}",
            filter = filter.sql,
            limit = placeholder(filter.params.len() + 2),
        );
        let ids = ids.to_vec();
        let mut scalars = filter.params;
        scalars.push(constraints.limit_candidates);

        self.run(move |client| {
            let mut params: Vec<&(dyn postgres::types::ToSql + Sync)> = vec![&ids];
            params.extend(scalars.iter().map(|p| p as &(dyn postgres::types::ToSql + Sync)));
            client
                .query(sql.as_str(), &params)?
                .iter()
                .map(|row| -> Result<_, postgres::Error> {
                    Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?))
                })
                .collect()
        })
    }
}

fn game_from_row(row: &Row) -> Result<Boardgame, postgres::Error> {
    Ok(Boardgame {
        g_id: row.try_get(0)?,
        name: row.try_get(1)?,
        avgscore: row.try_get(2)?,
        numvotes: row.try_get(3)?,
        minplayers: row.try_get(4)?,
        maxplayers: row.try_get(5)?,
        minplaytime: row.try_get(6)?,
        maxplaytime: row.try_get(7)?,
        categories: Vec::new(),
        designers: Vec::new(),
    })
}

fn designer_from_row(row: &Row) -> Result<Designer, postgres::Error> {
    Ok(Designer {
        des_id: row.try_get(0)?,
        name: row.try_get(1)?,
        country: row.try_get(2)?,
    })
}

fn category_from_row(row: &Row) -> Result<Category, postgres::Error> {
    Ok(Category {
        c_id: row.try_get(0)?,
        name: row.try_get(1)?,
    })
}

impl GameStore for PostgresStore {
    fn all_games(&self) -> StoreResult<Vec<Boardgame>> {
        let sql = format!("SELECT {GAME_COLUMNS} FROM games g ORDER BY g.name");
        self.run(move |client| client.query(sql.as_str(), &[])?.iter().map(game_from_row).collect())
    }

    fn games_by_name(&self, name_query: &str, limit: i64) -> StoreResult<Vec<Boardgame>> {
        let sql = format!(
            "SELECT {GAME_COLUMNS} FROM games g \
             WHERE lower(g.name) LIKE $1::text ESCAPE '\\' \
             ORDER BY g.numvotes DESC NULLS LAST, g.name LIMIT $2::bigint"
        );
        let pattern = like_pattern(name_query);
        self.run(move |client| {
            client
                .query(sql.as_str(), &[&pattern, &limit])?
                .iter()
                .map(game_from_row)
                .collect()
        })
    }

    fn all_designers(&self) -> StoreResult<Vec<Designer>> {
        self.run(|client| {
            client
                .query(
                    "SELECT des_id::bigint, name::text, country::text FROM designers ORDER BY name",
                    &[],
                )?
                .iter()
                .map(designer_from_row)
                .collect()
        })
    }

    fn games_by_designer(&self, designer_name: &str) -> StoreResult<Vec<Boardgame>> {
        let sql = format!(
            "SELECT {GAME_COLUMNS}, d.des_id::bigint, d.name::text, d.country::text \
             FROM games g \
             JOIN game_designers gd ON gd.g_id = g.g_id \
             JOIN designers d ON d.des_id = gd.des_id \
             WHERE lower(d.name) LIKE $1::text ESCAPE '\\' \
             ORDER BY g.name, g.g_id, d.name"
        );
        let pattern = like_pattern(designer_name);
        let rows = self.run(move |client| {
            client
                .query(sql.as_str(), &[&pattern])?
                .iter()
                .map(|row| {
                    let game = game_from_row(row)?;
                    let designer = Designer {
                        des_id: row.try_get(8)?,
                        name: row.try_get(9)?,
                        country: row.try_get(10)?,
                    };
                    Ok((game, designer))
                })
                .collect::<Result<Vec<_>, postgres::Error>>()
        })?;

        let mut games: Vec<Boardgame> = Vec::new();
        for (mut game, designer) in rows {
            match games.last_mut() {
                Some(last) if last.g_id == game.g_id => last.designers.push(designer),
                _ => {
                    game.designers.push(designer);
                    games.push(game);
                }
            }
        }
        Ok(games)
    }

    fn game_profile(&self, g_id: i64) -> StoreResult<Boardgame> {
        let sql = format!("SELECT {GAME_COLUMNS} FROM games g WHERE g.g_id = $1::bigint");
        let profile = self.run(move |client| {
            let Some(row) = client.query_opt(sql.as_str(), &[&g_id])? else {
                return Ok(None);
            };
            let mut game = game_from_row(&row)?;
            game.categories = client
                .query(
                    "SELECT c.c_id::bigint, c.name::text FROM categories c \
                     JOIN game_categories gc ON gc.c_id = c.c_id \
                     WHERE gc.g_id = $1::bigint ORDER BY c.name",
                    &[&g_id],
                )?
                .iter()
                .map(category_from_row)
                .collect::<Result<_, _>>()?;
            game.designers = client
                .query(
                    "SELECT d.des_id::bigint, d.name::text, d.country::text FROM designers d \
                     JOIN game_designers gd ON gd.des_id = d.des_id \
                     WHERE gd.g_id = $1::bigint ORDER BY d.name",
                    &[&g_id],
                )?
                .iter()
                .map(designer_from_row)
                .collect::<Result<_, _>>()?;
            Ok(Some(game))
        })?;
        profile.ok_or(StoreError::NotFound(g_id))
    }

    fn search_categories(&self, query: Option<&str>, limit: i64) -> StoreResult<Vec<Category>> {
        let pattern = non_blank(query).map(like_pattern);
        self.run(move |client| {
            let rows = match &pattern {
                Some(p) => client.query(
                    "SELECT c_id::bigint, name::text FROM categories \
                     WHERE lower(name) LIKE $1::text ESCAPE '\\' ORDER BY name LIMIT $2::bigint",
                    &[p, &limit],
                )?,
                None => client.query(
                    "SELECT c_id::bigint, name::text FROM categories ORDER BY name LIMIT $1::bigint",
                    &[&limit],
                )?,
            };
            rows.iter().map(category_from_row).collect()
        })
    }

    fn search_designers(&self, query: Option<&str>, limit: i64) -> StoreResult<Vec<Designer>> {
        let pattern = non_blank(query).map(like_pattern);
        self.run(move |client| {
            let rows = match &pattern {
                Some(p) => client.query(
                    "SELECT des_id::bigint, name::text, country::text FROM designers \
                     WHERE lower(name) LIKE $1::text ESCAPE '\\' ORDER BY name LIMIT $2::bigint",
                    &[p, &limit],
                )?,
                None => client.query(
                    "SELECT des_id::bigint, name::text, country::text FROM designers \
                     ORDER BY name LIMIT $1::bigint",
                    &[&limit],
                )?,
            };
            rows.iter().map(designer_from_row).collect()
        })
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
        self.run(move |client| {
            let params: Vec<&(dyn postgres::types::ToSql + Sync)> = values
                .iter()
                .map(|p| p as &(dyn postgres::types::ToSql + Sync))
                .collect();
            client
                .query(sql.as_str(), &params)?
                .iter()
                .map(game_from_row)
                .collect()
        })
    }

    fn candidates_by_categories(
        &self,
        c_ids: &[i64],
        constraints: &Constraints,
    ) -> StoreResult<Vec<Candidate>> {
        let rows = self.candidates("game_categories", "c_id", c_ids, constraints)?;
        debug!("{} category candidates", rows.len());
        Ok(rows
            .into_iter()
            .map(|(g_id, name, overlap)| Candidate {
                g_id,
                name,
                cat_overlap: Some(overlap),
                designer_overlap: None,
            })
            .collect())
    }

    fn candidates_by_designers(
        &self,
        des_ids: &[i64],
        constraints: &Constraints,
    ) -> StoreResult<Vec<Candidate>> {
        let rows = self.candidates("game_designers", "des_id", des_ids, constraints)?;
        debug!("{} designer candidates", rows.len());
        Ok(rows
            .into_iter()
            .map(|(g_id, name, overlap)| Candidate {
                g_id,
                name,
                cat_overlap: None,
                designer_overlap: Some(overlap),
            })
            .collect())
    }

    fn game_stats(&self, g_ids: &[i64]) -> StoreResult<HashMap<i64, GameStats>> {
        if g_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = g_ids.to_vec();
        self.run(move |client| {
            client
                .query(
                    "SELECT g_id::bigint, avgscore::float8, numvotes::float8 \
                     FROM games WHERE g_id = ANY($1::bigint[])",
                    &[&ids],
                )?
                .iter()
                .map(|row| {
                    let avgscore: Option<f64> = row.try_get(1)?;
                    let numvotes: Option<f64> = row.try_get(2)?;
                    Ok((
                        row.try_get(0)?,
                        GameStats {
                            avgscore: avgscore.unwrap_or(0.0),
                            numvotes: numvotes.unwrap_or(0.0),
                        },
                    ))
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PostgresConfig {
        PostgresConfig {
            host: "db.internal".into(),
            port: 5433,
            database: "boardgames".into(),
            user: "reader".into(),
            password: "hunter2".into(),
            connect_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_millis(2500),
        }
    }

    #[test]
    fn test_debug_hides_password() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("db.internal"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_client_config_carries_settings() {
        let client_config = config().to_client_config();
        assert_eq!(client_config.get_dbname(), Some("boardgames"));
        assert_eq!(client_config.get_user(), Some("reader"));
        assert_eq!(client_config.get_ports(), &[5433]);
        assert_eq!(
            client_config.get_options(),
            Some("-c statement_timeout=2500")
        );
    }

    #[test]
    fn test_placeholder_casts_to_bigint() {
        let filter = constraint_clause(&Constraints::default(), 2, placeholder);
        assert_eq!(filter.sql, "(g.numvotes IS NULL OR g.numvotes >= $2::bigint)");
    }
}
