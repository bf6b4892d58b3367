use anyhow::{Context, Result};
use argh::FromArgs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing::{Level, debug, info};

use boardgame_mcp::agent::{Agent, AgentOptions, OllamaBackend, SYSTEM_PROMPT};
use boardgame_mcp::app::{self, ChatOptions};
use boardgame_mcp::config::{self, ConfigError, DatabaseSettings, ModelSettings};
use boardgame_mcp::mcp::{Implementation, LineTransport, McpServer, RpcClient};
use boardgame_mcp::store::GameStore;
use boardgame_mcp::tools::build_registry;

#[derive(FromArgs)]
/// Board game recommendation tools over MCP
struct Args {
    /// print version and exit
    #[argh(switch, short = 'v')]
    version: bool,

    /// enable debug logging
    #[argh(switch)]
    verbose: bool,

    #[argh(subcommand)]
    command: Option<Command>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Chat(ChatArgs),
    Browse(BrowseArgs),
}

#[derive(FromArgs, Default)]
/// Run the tool server (the default command)
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// sqlite database file; PostgreSQL from DB_* variables otherwise
    #[argh(option)]
    sqlite: Option<PathBuf>,

    /// serve TCP clients on this address instead of stdio
    #[argh(option)]
    listen: Option<String>,

    /// seconds a single tool call may run (default: 10)
    #[argh(option, default = "10")]
    handler_timeout_secs: u64,
}

#[derive(FromArgs)]
/// Chat with the recommendation agent
#[argh(subcommand, name = "chat")]
struct ChatArgs {
    /// sqlite database file; PostgreSQL from DB_* variables otherwise
    #[argh(option)]
    sqlite: Option<PathBuf>,

    /// model name (default: OLLAMA_MODEL or qwen2.5:3b-instruct)
    #[argh(option)]
    model: Option<String>,

    /// chat completions endpoint (default: OLLAMA_URL or local Ollama)
    #[argh(option)]
    url: Option<String>,

    /// use a running tool server at this TCP address
    #[argh(option)]
    connect: Option<String>,

    /// model turns allowed per question (default: 20)
    #[argh(option, default = "20")]
    max_turns: usize,

    /// seconds the agent waits for a tool result (default: 30)
    #[argh(option, default = "30")]
    tool_timeout_secs: u64,

    /// seconds a single tool call may run in-process (default: 10)
    #[argh(option, default = "10")]
    handler_timeout_secs: u64,
}

#[derive(FromArgs)]
/// Browse the game database from a menu
#[argh(subcommand, name = "browse")]
struct BrowseArgs {
    /// sqlite database file; PostgreSQL from DB_* variables otherwise
    #[argh(option)]
    sqlite: Option<PathBuf>,
}

fn version() -> &'static str {
    env!("BOARDGAME_MCP_VERSION")
}

/// Missing credentials end the process with status 2.
fn database_settings(sqlite: Option<PathBuf>) -> Result<DatabaseSettings> {
    match DatabaseSettings::from_env(sqlite) {
        Ok(settings) => Ok(settings),
        Err(e @ ConfigError::MissingCredentials(_)) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

async fn open_store(sqlite: Option<PathBuf>) -> Result<Arc<dyn GameStore>> {
    database_settings(sqlite)?
        .connect()
        .await
        .context("Failed to open the game database")
}

async fn server_for(sqlite: Option<PathBuf>, handler_timeout_secs: u64) -> Result<McpServer> {
    let store = open_store(sqlite).await?;
    let registry = build_registry(store)?;
    info!("Registered {} tools", registry.len());
    Ok(McpServer::with_handler_timeout(
        Arc::new(registry),
        Duration::from_secs(handler_timeout_secs),
    ))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let server = server_for(args.sqlite, args.handler_timeout_secs).await?;
    match args.listen {
        Some(addr) => server.serve_tcp(&addr).await,
        None => server.serve_stdio().await,
    }
}

async fn chat(args: ChatArgs, debug_output: bool) -> Result<()> {
    let settings = ModelSettings::resolve(args.model, args.url, config::env_lookup)?;
    info!("Using model {} at {}", settings.model, settings.endpoint);
    let backend = OllamaBackend::new(settings.endpoint, settings.model, settings.timeout)?;
    let agent = Agent::new(
        Arc::new(backend),
        AgentOptions {
            max_turns: args.max_turns,
            tool_timeout: Duration::from_secs(args.tool_timeout_secs),
            system_prompt: SYSTEM_PROMPT.to_string(),
        },
    );
    let options = ChatOptions {
        debug: debug_output,
        watch_interrupts: true,
    };

    if let Some(addr) = args.connect {
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        return chat_session(RpcClient::new(LineTransport::split(stream)), &agent, options).await;
    }

    let server = server_for(args.sqlite, args.handler_timeout_secs).await?;
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
    let server_task = tokio::spawn(async move { server.serve(LineTransport::split(server_io)).await });

    chat_session(RpcClient::new(LineTransport::split(client_io)), &agent, options).await?;
    server_task.await.context("Tool server task failed")?
}

async fn chat_session<R, W>(mut client: RpcClient<R, W>, agent: &Agent, options: ChatOptions) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    client
        .initialize(Implementation {
            name: "boardgame-mcp-chat".to_string(),
            version: version().to_string(),
        })
        .await
        .context("Handshake with the tool server failed")?;

    let mut stdout = tokio::io::stdout();
    app::run_chat(agent, &mut client, BufReader::new(tokio::io::stdin()), &mut stdout, options).await?;

    if let Err(e) = client.shutdown().await {
        debug!("Shutdown request failed: {}", e);
    }
    Ok(())
}

async fn browse(args: BrowseArgs) -> Result<()> {
    let store = open_store(args.sqlite).await?;
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        app::run_browse(store.as_ref(), stdin.lock(), std::io::stdout())
    })
    .await?
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    if args.version {
        println!("boardgame-mcp {}", version());
        return Ok(());
    }

    let debug_output = args.verbose || config::debug_enabled(config::env_lookup);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .without_time()
        .with_max_level(if debug_output { Level::DEBUG } else { Level::INFO })
        .init();

    match args.command {
        Some(Command::Chat(chat_args)) => {
            chat(chat_args, debug_output).await?;
            // A pending stdin read cannot be interrupted and would hold up runtime shutdown.
            std::process::exit(0);
        }
        Some(Command::Browse(browse_args)) => browse(browse_args).await,
        Some(Command::Serve(serve_args)) => serve(serve_args).await,
        None => {
            info!("Starting boardgame MCP server");
            serve(ServeArgs {
                handler_timeout_secs: 10,
                ..ServeArgs::default()
            })
            .await
        }
    }
}
