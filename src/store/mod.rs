//! Read-only access to the board game catalogue.
//!
//! Tool handlers and the terminal front end only ever talk to [`GameStore`];
//! the SQLite and PostgreSQL backends below are interchangeable behind it.

pub mod postgres;
pub mod scoring;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use postgres::{PostgresConfig, PostgresStore};
pub use scoring::{CandidateSignal, rank_candidates, score_candidates};
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boardgame {
    pub g_id: i64,
    pub name: String,
    pub avgscore: Option<f64>,
    pub numvotes: Option<i64>,
    pub minplayers: Option<i64>,
    pub maxplayers: Option<i64>,
    pub minplaytime: Option<i64>,
    pub maxplaytime: Option<i64>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub designers: Vec<Designer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Designer {
    pub des_id: i64,
    pub name: String,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub c_id: i64,
    pub name: String,
}

/// Filters shared by candidate generation, scoring and `find_games`.
///
/// Every player/playtime bound is optional. Unknown keys are ignored when
/// decoding so callers can pass one constraints object to every tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Exact player count the game must support.
    pub players: Option<i64>,
    pub minplayers: Option<i64>,
    pub maxplayers: Option<i64>,
    pub minplaytime: Option<i64>,
    pub maxplaytime: Option<i64>,
    pub min_votes: i64,
    pub limit_candidates: i64,
    pub limit_final: usize,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            players: None,
            minplayers: None,
            maxplayers: None,
            minplaytime: None,
            maxplaytime: None,
            min_votes: 500,
            limit_candidates: 200,
            limit_final: 8,
        }
    }
}

/// A game produced by one of the candidate generators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub g_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cat_overlap: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub designer_overlap: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GameStats {
    pub avgscore: f64,
    pub numvotes: f64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("game {0} not found")]
    NotFound(i64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<::postgres::Error> for StoreError {
    fn from(err: ::postgres::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The data access facade.
///
/// Implementations must be safe to call concurrently from several
/// connections and must not mutate anything as a side effect of a read.
pub trait GameStore: Send + Sync {
    /// Every game, ordered by name, without categories or designers.
    fn all_games(&self) -> StoreResult<Vec<Boardgame>>;

    /// Case-insensitive substring match on the game name, most voted first.
    fn games_by_name(&self, name_query: &str, limit: i64) -> StoreResult<Vec<Boardgame>>;

    fn all_designers(&self) -> StoreResult<Vec<Designer>>;

    /// Games whose designer name contains `designer_name`, ordered by game
    /// name. Each game carries at least the matching designer.
    fn games_by_designer(&self, designer_name: &str) -> StoreResult<Vec<Boardgame>>;

    /// Full profile including categories and designers.
    fn game_profile(&self, g_id: i64) -> StoreResult<Boardgame>;

    /// A blank or missing query lists every category.
    fn search_categories(&self, query: Option<&str>, limit: i64) -> StoreResult<Vec<Category>>;

    /// A blank or missing query lists every designer.
    fn search_designers(&self, query: Option<&str>, limit: i64) -> StoreResult<Vec<Designer>>;

    /// Games matching the player/playtime/vote filters, most voted first.
    fn find_games(&self, constraints: &Constraints, limit: i64) -> StoreResult<Vec<Boardgame>>;

    fn candidates_by_categories(
        &self,
        c_ids: &[i64],
        constraints: &Constraints,
    ) -> StoreResult<Vec<Candidate>>;

    fn candidates_by_designers(
        &self,
        des_ids: &[i64],
        constraints: &Constraints,
    ) -> StoreResult<Vec<Candidate>>;

    fn game_stats(&self, g_ids: &[i64]) -> StoreResult<HashMap<i64, GameStats>>;

    /// Profiles for `g_ids` in request order. Unknown ids are skipped.
    fn fetch_game_cards(&self, g_ids: &[i64]) -> StoreResult<Vec<Boardgame>> {
        let mut cards = Vec::with_capacity(g_ids.len());
        for &g_id in g_ids {
            match self.game_profile(g_id) {
                Ok(card) => cards.push(card),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(cards)
    }
}

/// SQL fragment plus its positional integer parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FilterClause {
    pub sql: String,
    pub params: Vec<i64>,
}

/// Builds the WHERE fragment for `constraints` against a games table aliased
/// `g`. `placeholder` renders the n-th (1-based) parameter for the backend
/// dialect; numbering starts at `first`.
pub(crate) fn constraint_clause(
    constraints: &Constraints,
    first: usize,
    placeholder: fn(usize) -> String,
) -> FilterClause {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    let next = |value: i64, params: &mut Vec<i64>| {
        params.push(value);
        placeholder(first + params.len() - 1)
    };

    if let Some(players) = constraints.players {
        let p = next(players, &mut params);
        clauses.push(format!("g.minplayers <= {p} AND g.maxplayers >= {p}"));
    }
    if let Some(minplayers) = constraints.minplayers {
        let p = next(minplayers, &mut params);
        clauses.push(format!("g.maxplayers >= {p}"));
    }
    if let Some(maxplayers) = constraints.maxplayers {
        let p = next(maxplayers, &mut params);
        clauses.push(format!("g.minplayers <= {p}"));
    }
    if let Some(maxplaytime) = constraints.maxplaytime {
        let p = next(maxplaytime, &mut params);
        clauses.push(format!("g.maxplaytime <= {p}"));
    }
    if let Some(minplaytime) = constraints.minplaytime {
        let p = next(minplaytime, &mut params);
        clauses.push(format!("g.minplaytime >= {p}"));
    }
    let p = next(constraints.min_votes, &mut params);
    clauses.push(format!("(g.numvotes IS NULL OR g.numvotes >= {p})"));

    FilterClause {
        sql: clauses.join(" AND "),
        params,
    }
}

/// `%needle%` for a LIKE match, lowercased, with LIKE metacharacters escaped
/// using `\`.
pub(crate) fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for ch in query.trim().to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

/// Normalises an optional search query: blank means "list everything".
pub(crate) fn non_blank(query: Option<&str>) -> Option<&str> {
    query.map(str::trim).filter(|q| !q.is_empty())
}

/// Store double that answers `find_games` with a fixed record list and
/// knows nothing else.
#[cfg(test)]
pub(crate) struct StubStore {
    pub games: Vec<Boardgame>,
}

#[cfg(test)]
impl StubStore {
    pub fn with_games(count: i64) -> Self {
        let games = (1..=count)
            .map(|g_id| Boardgame {
                g_id,
                name: format!("Game {}", g_id),
                avgscore: Some(7.0),
                numvotes: Some(1000 * g_id),
                minplayers: Some(2),
                maxplayers: Some(4),
                minplaytime: Some(30),
                maxplaytime: Some(60),
                categories: Vec::new(),
                designers: Vec::new(),
            })
            .collect();
        Self { games }
    }
}

#[cfg(test)]
impl GameStore for StubStore {
    fn all_games(&self) -> StoreResult<Vec<Boardgame>> {
        Ok(self.games.clone())
    }
    fn games_by_name(&self, _: &str, _: i64) -> StoreResult<Vec<Boardgame>> {
        Ok(Vec::new())
    }
    fn all_designers(&self) -> StoreResult<Vec<Designer>> {
        Ok(Vec::new())
    }
    fn games_by_designer(&self, _: &str) -> StoreResult<Vec<Boardgame>> {
        Ok(Vec::new())
    }
    fn game_profile(&self, g_id: i64) -> StoreResult<Boardgame> {
        self.games
            .iter()
            .find(|g| g.g_id == g_id)
            .cloned()
            .ok_or(StoreError::NotFound(g_id))
    }
    fn search_categories(&self, _: Option<&str>, _: i64) -> StoreResult<Vec<Category>> {
        Ok(Vec::new())
    }
    fn search_designers(&self, _: Option<&str>, _: i64) -> StoreResult<Vec<Designer>> {
        Ok(Vec::new())
    }
    fn find_games(&self, _: &Constraints, _: i64) -> StoreResult<Vec<Boardgame>> {
        Ok(self.games.clone())
    }
    fn candidates_by_categories(&self, _: &[i64], _: &Constraints) -> StoreResult<Vec<Candidate>> {
        Ok(Vec::new())
    }
    fn candidates_by_designers(&self, _: &[i64], _: &Constraints) -> StoreResult<Vec<Candidate>> {
        Ok(Vec::new())
    }
    fn game_stats(&self, _: &[i64]) -> StoreResult<HashMap<i64, GameStats>> {
        Ok(HashMap::new())
    }
}
