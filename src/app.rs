//! Terminal front ends: the direct browse menu and the agent chat REPL.

use anyhow::Result;
use std::fmt::Write as _;
use std::io::{BufRead, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::{Agent, ToolGateway, ToolOutcome, Turn};
use crate::store::{Boardgame, Designer, GameStore};

const SEARCH_LIMIT: i64 = 100;

struct Column {
    name: &'static str,
    right: bool,
}

const fn left(name: &'static str) -> Column {
    Column { name, right: false }
}

const fn right(name: &'static str) -> Column {
    Column { name, right: true }
}

fn render_table(title: &str, columns: &[Column], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.name.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "{}", title);
    let header: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let _ = writeln!(out, "{}", format_row(&header, columns, &widths));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let _ = writeln!(out, "{}", rule.join("  "));
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        let _ = writeln!(out, "{}", format_row(&cells, columns, &widths));
    }
    if rows.is_empty() {
        let _ = writeln!(out, "(no results)");
    }
    out
}

fn format_row(cells: &[&str], columns: &[Column], widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(columns.iter().zip(widths))
        .map(|(cell, (column, &width))| {
            if column.right {
                format!("{:>width$}", cell)
            } else {
                format!("{:<width$}", cell)
            }
        })
        .collect();
    padded.join("  ").trim_end().to_string()
}

fn cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn render_games(title: &str, games: &[Boardgame], includes_designer: bool) -> String {
    let mut columns = vec![left("ID"), left("Name")];
    if includes_designer {
        columns.push(left("Designer"));
    }
    columns.extend([
        right("Average Score"),
        right("Min Players"),
        right("Max Players"),
        right("Min Playtime"),
        right("Max Playtime"),
    ]);

    let rows: Vec<Vec<String>> = games
        .iter()
        .map(|game| {
            let mut row = vec![game.g_id.to_string(), game.name.clone()];
            if includes_designer {
                row.push(
                    game.designers
                        .first()
                        .map(|d| d.name.clone())
                        .unwrap_or_default(),
                );
            }
            row.extend([
                cell(game.avgscore),
                cell(game.minplayers),
                cell(game.maxplayers),
                cell(game.minplaytime),
                cell(game.maxplaytime),
            ]);
            row
        })
        .collect();
    render_table(title, &columns, &rows)
}

pub fn render_designers(title: &str, designers: &[Designer]) -> String {
    let columns = [left("ID"), left("Name"), left("Country")];
    let rows: Vec<Vec<String>> = designers
        .iter()
        .map(|d| vec![d.des_id.to_string(), d.name.clone(), cell(d.country.as_ref())])
        .collect();
    render_table(title, &columns, &rows)
}

/// Prompts until one of `choices` is entered. `None` at end of input.
fn ask_choice<R: BufRead, W: Write>(
    input: &mut R,
    out: &mut W,
    prompt: &str,
    choices: &[&str],
) -> Result<Option<String>> {
    loop {
        let Some(answer) = ask(input, out, &format!("{} [{}]", prompt, choices.join("/")))? else {
            return Ok(None);
        };
        let answer = answer.to_lowercase();
        if choices.contains(&answer.as_str()) {
            return Ok(Some(answer));
        }
        writeln!(out, "Please select one of the available options")?;
    }
}

fn ask<R: BufRead, W: Write>(input: &mut R, out: &mut W, prompt: &str) -> Result<Option<String>> {
    write!(out, "{}: ", prompt)?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// The direct database menu. Returns on `x` or end of input.
pub fn run_browse<R: BufRead, W: Write>(store: &dyn GameStore, mut input: R, mut out: W) -> Result<()> {
    loop {
        let Some(which) = ask_choice(
            &mut input,
            &mut out,
            "Show all [g]ames, [d]esigners, or [s]earch? (Or e[x]it.)",
            &["g", "d", "s", "x"],
        )?
        else {
            return Ok(());
        };

        match which.as_str() {
            "g" => {
                let games = store.all_games()?;
                write!(out, "{}", render_games("All Boardgames", &games, false))?;
            }
            "d" => {
                let designers = store.all_designers()?;
                write!(out, "{}", render_designers("All Designers", &designers))?;
            }
            "s" => {
                if !browse_search(store, &mut input, &mut out)? {
                    return Ok(());
                }
            }
            _ => return Ok(()),
        }
    }
}

/// Returns `false` when input ran out.
fn browse_search<R: BufRead, W: Write>(store: &dyn GameStore, input: &mut R, out: &mut W) -> Result<bool> {
    loop {
        let Some(kind) = ask_choice(
            input,
            out,
            "Search by game [n]ame, [d]esigner (Or go [b]ack.)",
            &["n", "d", "b"],
        )?
        else {
            return Ok(false);
        };

        match kind.as_str() {
            "n" => {
                let Some(name) = ask(input, out, "Enter a game name to search for")? else {
                    return Ok(false);
                };
                let games = store.games_by_name(&name, SEARCH_LIMIT)?;
                write!(out, "{}", render_games("Games by Name", &games, false))?;
            }
            "d" => {
                let Some(designer) = ask(input, out, "Enter a designer name to search for")? else {
                    return Ok(false);
                };
                let games = store.games_by_designer(&designer)?;
                write!(out, "{}", render_games("Games by Designer", &games, true))?;
            }
            _ => return Ok(true),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatOptions {
    /// Print tool calls and results after each answer.
    pub debug: bool,
    /// Install a Ctrl+C handler that cancels the running query.
    pub watch_interrupts: bool,
}

const BANNER: &str = "Ready. Example: Recommend games like \"Risk\" for 2 players under 60 minutes. Press Ctrl+C to quit.";

async fn emit<W: AsyncWrite + Unpin>(out: &mut W, text: &str) -> Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

fn trace(turns: &[Turn]) -> String {
    let mut text = String::new();
    for turn in turns {
        match turn {
            Turn::Assistant {
                content,
                tool_calls,
            } if !tool_calls.is_empty() => {
                if let Some(content) = content {
                    let _ = writeln!(text, "  {}", content);
                }
                for call in tool_calls {
                    let _ = writeln!(
                        text,
                        "  Tool called: {} with arguments: {}",
                        call.tool_name,
                        serde_json::Value::Object(call.arguments.clone())
                    );
                }
            }
            Turn::Tool(result) => {
                let label = match result.outcome {
                    ToolOutcome::Success(_) => "Tool response",
                    ToolOutcome::Failure { .. } => "Tool error",
                };
                let _ = writeln!(text, "  {}: {}", label, result.render());
            }
            _ => {}
        }
    }
    text
}

/// The chat REPL. Every line is a fresh query; the loop ends at end of
/// input or on Ctrl+C at the prompt.
pub async fn run_chat<G, R, W>(
    agent: &Agent,
    gateway: &mut G,
    input: R,
    out: &mut W,
    options: ChatOptions,
) -> Result<()>
where
    G: ToolGateway + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    emit(out, BANNER).await?;
    emit(out, "\n").await?;

    loop {
        emit(out, "\nYou> ").await?;
        let line = if options.watch_interrupts {
            tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            }
        } else {
            lines.next_line().await?
        };
        let Some(line) = line else {
            emit(out, "\n").await?;
            return Ok(());
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }

        let cancel = CancellationToken::new();
        let watcher = options.watch_interrupts.then(|| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        });

        let result = agent.run(gateway, query, &cancel).await;
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        match result {
            Ok(outcome) => {
                if options.debug {
                    emit(out, &trace(outcome.conversation.turns())).await?;
                }
                emit(out, &format!("\nAssistant>\n{}\n", outcome.answer)).await?;
            }
            Err(err) => {
                warn!("Query failed: {}", err);
                emit(out, &format!("\n{}\n", err.user_message())).await?;
            }
        }
    }
}
