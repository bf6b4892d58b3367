//! The board game tools advertised by the server.

use super::registry::{HandlerError, RegistryError, ToolRegistry, ToolSpec};
use super::schema::{InputSchema, ParamType};
use crate::store::{CandidateSignal, Constraints, GameStore, score_candidates};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::debug;

const CONSTRAINTS_DOC: &str = "Constraints object with optional fields: \
    players (int, exact player count), \
    minplayers (int, minimum players), \
    maxplayers (int, maximum players), \
    minplaytime (int, minimum playtime in minutes), \
    maxplaytime (int, maximum playtime in minutes), \
    min_votes (int, default 500, minimum rating votes), \
    limit_candidates (int, default 200, max candidates per generator), \
    limit_final (int, default 8, number of final recommendations)";

const MAX_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameTool {
    GetGamesByName,
    GetGameProfile,
    SearchCategories,
    SearchDesigners,
    FindGames,
    CandidateByCategories,
    CandidateByDesigners,
    ScoreCandidates,
    FetchGameCards,
}

impl GameTool {
    pub const ALL: [GameTool; 9] = [
        GameTool::GetGamesByName,
        GameTool::GetGameProfile,
        GameTool::SearchCategories,
        GameTool::SearchDesigners,
        GameTool::FindGames,
        GameTool::CandidateByCategories,
        GameTool::CandidateByDesigners,
        GameTool::ScoreCandidates,
        GameTool::FetchGameCards,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GameTool::GetGamesByName => "get_games_by_name",
            GameTool::GetGameProfile => "get_game_profile",
            GameTool::SearchCategories => "search_categories",
            GameTool::SearchDesigners => "search_designers",
            GameTool::FindGames => "find_games",
            GameTool::CandidateByCategories => "candidate_by_categories",
            GameTool::CandidateByDesigners => "candidate_by_designers",
            GameTool::ScoreCandidates => "score_candidates",
            GameTool::FetchGameCards => "fetch_game_cards",
        }
    }

    pub fn from_name(name: &str) -> Option<GameTool> {
        GameTool::ALL.into_iter().find(|t| t.name() == name)
    }

    fn description(self) -> &'static str {
        match self {
            GameTool::GetGamesByName => "Find games by (substring) name.",
            GameTool::GetGameProfile => {
                "Fetch a denormalized game profile (stats + categories + designers)."
            }
            GameTool::SearchCategories => {
                "Search for categories by name substring. Omit query to list all categories."
            }
            GameTool::SearchDesigners => {
                "Search for designers by name substring. Omit query to list all designers."
            }
            GameTool::FindGames => {
                "Find popular games that support at least min_players, optionally bounded by \
                 max_players, max_playtime (minutes) and min_votes."
            }
            GameTool::CandidateByCategories => {
                "Generate candidates by category overlap. Use search_categories first to get \
                 category IDs from names."
            }
            GameTool::CandidateByDesigners => {
                "Generate candidates by designer overlap. Use search_designers first to get \
                 designer IDs from names."
            }
            GameTool::ScoreCandidates => "Combine candidate signals, score to select final IDs.",
            GameTool::FetchGameCards => "Fetch final denormalized game cards for display.",
        }
    }

    fn input_schema(self) -> InputSchema {
        let ids = || ParamType::array_of(ParamType::Integer);
        match self {
            GameTool::GetGamesByName => InputSchema::new()
                .required("name_query", ParamType::String, "Substring of the game name")
                .defaulted("limit", ParamType::Integer, "Maximum results", json!(10)),
            GameTool::GetGameProfile => {
                InputSchema::new().required("g_id", ParamType::Integer, "Game ID")
            }
            GameTool::SearchCategories => InputSchema::new()
                .optional(
                    "query",
                    ParamType::String,
                    "Category name substring to search for (optional - omit to list all)",
                )
                .defaulted("limit", ParamType::Integer, "Maximum results", json!(10)),
            GameTool::SearchDesigners => InputSchema::new()
                .optional(
                    "query",
                    ParamType::String,
                    "Designer name substring to search for (optional - omit to list all)",
                )
                .defaulted("limit", ParamType::Integer, "Maximum results", json!(10)),
            GameTool::FindGames => InputSchema::new()
                .required("min_players", ParamType::Integer, "Player count the game must support")
                .optional("max_players", ParamType::Integer, "Upper bound on the game's minimum player count")
                .optional("max_playtime", ParamType::Integer, "Maximum playtime in minutes")
                .optional("min_votes", ParamType::Integer, "Minimum number of rating votes")
                .defaulted("limit", ParamType::Integer, "Maximum results", json!(20)),
            GameTool::CandidateByCategories => InputSchema::new()
                .required("c_ids", ids(), "Array of category IDs")
                .required("constraints", ParamType::Object, CONSTRAINTS_DOC),
            GameTool::CandidateByDesigners => InputSchema::new()
                .required("des_ids", ids(), "Array of designer IDs")
                .required("constraints", ParamType::Object, CONSTRAINTS_DOC),
            GameTool::ScoreCandidates => InputSchema::new()
                .required(
                    "candidates",
                    ParamType::array_of(ParamType::Object),
                    "Combined output of candidate_by_categories and candidate_by_designers",
                )
                .required("constraints", ParamType::Object, CONSTRAINTS_DOC)
                .required("exclude_g_ids", ids(), "Game IDs to leave out, e.g. the seed game"),
            GameTool::FetchGameCards => {
                InputSchema::new().required("g_ids", ids(), "Game IDs to fetch")
            }
        }
    }

    pub fn spec(self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }

    /// Runs the tool against `store`. Arguments are expected to have passed
    /// schema validation already.
    pub fn invoke(self, store: &dyn GameStore, args: &Map<String, Value>) -> Result<Value, HandlerError> {
        let shown = Value::Object(args.clone());
        debug!("Invoking {} with {}", self.name(), shown);
        let output = match self {
            GameTool::GetGamesByName => {
                let query = str_arg(args, "name_query").unwrap_or_default();
                serde_json::to_value(store.games_by_name(query, limit_arg(args, 10))?)?
            }
            GameTool::GetGameProfile => {
                let g_id = required_int(args, "g_id")?;
                serde_json::to_value(store.game_profile(g_id)?)?
            }
            GameTool::SearchCategories => serde_json::to_value(
                store.search_categories(str_arg(args, "query"), limit_arg(args, 10))?,
            )?,
            GameTool::SearchDesigners => serde_json::to_value(
                store.search_designers(str_arg(args, "query"), limit_arg(args, 10))?,
            )?,
            GameTool::FindGames => {
                let constraints = Constraints {
                    minplayers: Some(required_int(args, "min_players")?),
                    maxplayers: opt_int(args, "max_players"),
                    maxplaytime: opt_int(args, "max_playtime"),
                    min_votes: opt_int(args, "min_votes").unwrap_or(0),
                    ..Default::default()
                };
                serde_json::to_value(store.find_games(&constraints, limit_arg(args, 20))?)?
            }
            GameTool::CandidateByCategories => {
                let constraints = constraints_arg(args)?;
                serde_json::to_value(
                    store.candidates_by_categories(&ids_arg(args, "c_ids"), &constraints)?,
                )?
            }
            GameTool::CandidateByDesigners => {
                let constraints = constraints_arg(args)?;
                serde_json::to_value(
                    store.candidates_by_designers(&ids_arg(args, "des_ids"), &constraints)?,
                )?
            }
            GameTool::ScoreCandidates => {
                let constraints = constraints_arg(args)?;
                let raw = args
                    .get("candidates")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let signals = CandidateSignal::from_values(raw);
                let exclude = ids_arg(args, "exclude_g_ids");
                serde_json::to_value(score_candidates(
                    store,
                    &signals,
                    &exclude,
                    constraints.limit_final,
                )?)?
            }
            GameTool::FetchGameCards => {
                serde_json::to_value(store.fetch_game_cards(&ids_arg(args, "g_ids"))?)?
            }
        };
        Ok(output)
    }
}

fn str_arg<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

fn opt_int(args: &Map<String, Value>, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

/// Result limits are clamped to `1..=MAX_LIMIT` before they reach SQL.
fn limit_arg(args: &Map<String, Value>, default: i64) -> i64 {
    opt_int(args, "limit").unwrap_or(default).clamp(1, MAX_LIMIT)
}

fn required_int(args: &Map<String, Value>, name: &str) -> Result<i64, HandlerError> {
    opt_int(args, name).ok_or_else(|| HandlerError::new(format!("'{}' must be an integer", name)))
}

fn ids_arg(args: &Map<String, Value>, name: &str) -> Vec<i64> {
    args.get(name)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

fn constraints_arg(args: &Map<String, Value>) -> Result<Constraints, HandlerError> {
    match args.get("constraints") {
        None | Some(Value::Null) => Ok(Constraints::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| HandlerError::new(format!("invalid constraints: {}", e))),
    }
}

/// Registers every [`GameTool`] against `store`.
pub fn register_catalog(
    registry: &mut ToolRegistry,
    store: Arc<dyn GameStore>,
) -> Result<(), RegistryError> {
    for tool in GameTool::ALL {
        let store = Arc::clone(&store);
        registry.register(tool.spec(), move |args: &Map<String, Value>| {
            tool.invoke(store.as_ref(), args)
        })?;
    }
    Ok(())
}

pub fn build_registry(store: Arc<dyn GameStore>) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    register_catalog(&mut registry, store)?;
    Ok(registry)
}
