use std::error::Error;
use std::io::Write;
use std::sync::Arc;

use agent_gate_rs::tools::bank::{Ledger, bank_tools};
use agent_gate_rs::tools::weather::{time_tool, weather_tools};
use agent_gate_rs::{
    Agent, AgentError, AgentEvent, AnthropicModel, AnthropicModelConfig, ApprovalDecision,
    ApprovalGate, ChatModel, ContentPart, DenyAllGate, LoggingMiddleware, ModelMessage, Session,
    SessionStore, ToolInvocationRequest,
};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "agent_labs",
    version,
    about = "Interactive labs for the approval-gated agent runtime"
)]
struct Cli {
    /// Anthropic model id.
    #[arg(long, env = "ANTHROPIC_MODEL", default_value = "claude-sonnet-4-5", global = true)]
    model: String,

    /// Base URL override for proxies or compatible endpoints.
    #[arg(long, env = "ANTHROPIC_BASE_URL", global = true)]
    base_url: Option<String>,

    #[arg(long, default_value_t = 1024, global = true)]
    max_tokens: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Streams a joke about an attached image, or a pirate tale.
    First(FirstArgs),
    /// Multi-turn conversations routed to named sessions.
    Chat,
    /// Contoso Bank assistant that asks before moving money.
    Finance(FinanceArgs),
    /// Weather agent used directly and as a tool of a French-speaking agent.
    Weather(WeatherArgs),
}

#[derive(Debug, Args)]
struct FirstArgs {
    /// Ask for a pirate tale instead of a joke about the image.
    #[arg(long)]
    tale: bool,
}

#[derive(Debug, Args)]
struct FinanceArgs {
    #[arg(long, default_value_t = 1250.0)]
    opening_balance: f64,

    #[arg(long, default_value = "USD")]
    currency: String,
}

#[derive(Debug, Args)]
struct WeatherArgs {
    /// Ask the weather tools directly, without the French-speaking wrapper agent.
    #[arg(long)]
    direct: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Commands::Weather(WeatherArgs { direct: false }) => "warn,agent_gate_rs::middleware=info",
        Commands::First(_)
        | Commands::Chat
        | Commands::Finance(_)
        | Commands::Weather(WeatherArgs { direct: true }) => "warn",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = AnthropicModelConfig::from_env(cli.model)?.with_max_tokens(cli.max_tokens);
    if let Some(base_url) = cli.base_url {
        config = config.with_base_url(base_url);
    }
    let model: Arc<dyn ChatModel> = Arc::new(AnthropicModel::new(config)?);
    let console = Console::new();

    match cli.command {
        Commands::First(args) => first(model, args).await,
        Commands::Chat => chat(model, &console).await,
        Commands::Finance(args) => finance(model, &console, args).await,
        Commands::Weather(WeatherArgs { direct: true }) => weather_direct(model, &console).await,
        Commands::Weather(WeatherArgs { direct: false }) => weather(model, &console).await,
    }
}

/// Line-oriented stdin shared by the labs and the approval prompt.
#[derive(Clone)]
struct Console {
    lines: Arc<Mutex<Lines<BufReader<Stdin>>>>,
}

impl Console {
    fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())),
        }
    }

    /// `None` once stdin is closed.
    async fn prompt(&self, label: &str) -> std::io::Result<Option<String>> {
        print!("{label}");
        std::io::stdout().flush()?;
        let line = self.lines.lock().await.next_line().await?;
        Ok(line.map(|line| line.trim().to_string()))
    }
}

struct ConsoleGate {
    console: Console,
}

#[async_trait]
impl ApprovalGate for ConsoleGate {
    async fn decide(
        &self,
        requests: &[ToolInvocationRequest],
    ) -> Result<Vec<ApprovalDecision>, AgentError> {
        println!("\n\n=== APPROVALS REQUIRED ===");
        let mut decisions = Vec::with_capacity(requests.len());
        for request in requests {
            println!("- Function: {}", request.tool);
            println!("  Arguments: {}", request.arguments);
            let answer = self
                .console
                .prompt(&format!("Approve '{}'? (yes/no): ", request.tool))
                .await
                .map_err(|err| AgentError::Gate(err.to_string()))?;
            let approved = answer.is_some_and(|answer| answer.to_lowercase() == "yes");
            decisions.push(request.respond(approved));
        }
        Ok(decisions)
    }
}

fn is_exit(input: &str) -> bool {
    matches!(input.to_lowercase().as_str(), "exit" | "quit")
}

async fn first(model: Arc<dyn ChatModel>, args: FirstArgs) -> Result<(), Box<dyn Error>> {
    let (system_prompt, message) = if args.tale {
        (
            "You are good at telling tales.",
            ModelMessage::user("Tell me a tale about a pirate."),
        )
    } else {
        (
            "You are good at telling jokes.",
            ModelMessage::user("Tell me a joke about this image?").with_part(ContentPart::Uri {
                uri: "https://www.fotosanimales.es/wp-content/uploads/2017/12/pinguino.jpg"
                    .to_string(),
                media_type: "image/jpeg".to_string(),
            }),
        )
    };
    let agent = Agent::builder()
        .shared_model(model)
        .name("Joker")
        .system_prompt(system_prompt)
        .build()?;
    let mut session = Session::with_generated_id();

    let stream = agent.run_stream(&mut session, message);
    futures_util::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        if let AgentEvent::Text { content } = event? {
            print!("{content}");
            std::io::stdout().flush()?;
        }
    }
    println!();

    Ok(())
}

async fn chat(model: Arc<dyn ChatModel>, console: &Console) -> Result<(), Box<dyn Error>> {
    let agent = Agent::builder()
        .shared_model(model)
        .name("Conversationalist")
        .system_prompt("You are a helpful conversation coach who keeps context between turns.")
        .build()?;
    let store = SessionStore::new();

    println!("=== Lab 02: Multi-Turn Conversations ===");
    println!("Type a conversation name to route messages to that thread.");
    println!("Commands: 'list' to show sessions, 'exit' to quit.\n");

    loop {
        let Some(session_id) = console.prompt("Conversation id [default=general]: ").await? else {
            break;
        };
        let session_id = if session_id.is_empty() {
            "general".to_string()
        } else {
            session_id
        };

        if is_exit(&session_id) {
            println!("Goodbye!");
            break;
        }
        if session_id.to_lowercase() == "list" {
            let ids = store.session_ids();
            if ids.is_empty() {
                println!("No active conversations yet. Start typing to create one.\n");
            } else {
                println!("Active conversations:");
                for id in ids {
                    println!("- {id}");
                }
                println!();
            }
            continue;
        }

        let Some(prompt) = console.prompt("User message: ").await? else {
            break;
        };
        if is_exit(&prompt) {
            println!("Goodbye!");
            break;
        }
        if prompt.is_empty() {
            println!("Message cannot be empty.\n");
            continue;
        }

        let (session, created) = store.get_or_create(&session_id);
        if created {
            println!("Created new conversation '{session_id}'.");
        }
        let mut session = session.lock().await;
        match agent.run_with_gate(&mut session, prompt, &DenyAllGate).await {
            Ok(text) => println!("\n[{session_id}] {text}\n"),
            Err(err) => eprintln!("\n[{session_id}] error: {err}\n"),
        }
    }

    Ok(())
}

async fn finance(
    model: Arc<dyn ChatModel>,
    console: &Console,
    args: FinanceArgs,
) -> Result<(), Box<dyn Error>> {
    let agent = Agent::builder()
        .shared_model(model)
        .name("FinanceAgent")
        .system_prompt(
            "You are an agent from Contoso Bank. You assist users with financial operations \
             and provide clear explanations. For transfers only amount, recipient name, and reference are needed.",
        )
        .tools(bank_tools())
        .dependency(Ledger::new(args.opening_balance, args.currency))
        .build()?;
    let gate = ConsoleGate {
        console: console.clone(),
    };
    let mut session = Session::new("finance");

    println!("=== FinanceAgent - Interactive Session ===");
    println!("Type 'exit' or 'quit' to end the conversation\n");

    loop {
        let Some(input) = console.prompt("You: ").await? else {
            break;
        };
        if is_exit(&input) {
            println!("Goodbye!");
            break;
        }
        if input.is_empty() {
            continue;
        }

        match agent.run_with_gate(&mut session, input, &gate).await {
            Ok(text) => println!("\nAgent: {text}\n"),
            Err(err) => eprintln!("\nAgent error: {err}\n"),
        }
    }

    Ok(())
}

async fn weather(model: Arc<dyn ChatModel>, console: &Console) -> Result<(), Box<dyn Error>> {
    let weather_agent = Agent::builder()
        .shared_model(model.clone())
        .name("WeatherAgent")
        .description("An agent that answers questions about the weather.")
        .system_prompt("You answer questions about the weather.")
        .tools(weather_tools())
        .middleware(LoggingMiddleware)
        .tool_middleware(LoggingMiddleware)
        .build()?;

    let main_agent = Agent::builder()
        .shared_model(model)
        .name("MainAgent")
        .system_prompt("You are a helpful assistant who responds in French.")
        .tool(weather_agent.as_tool(
            "WeatherLookup",
            "Look up weather information for any location",
            "query",
            "The weather query or location",
        ))
        .tool(time_tool())
        .middleware(LoggingMiddleware)
        .tool_middleware(LoggingMiddleware)
        .build()?;

    println!("=== Agent as Tool ===");
    println!(
        "Compare direct WeatherAgent answers with the WeatherLookup tool (type 'exit' to stop).\n"
    );

    loop {
        let Some(location) = console.prompt("City or country: ").await? else {
            break;
        };
        if location.is_empty() {
            continue;
        }
        if is_exit(&location) {
            println!("Goodbye!");
            break;
        }

        let question = format!("What is the weather like in {location}?");

        let (direct, via_tool) = compare_answers(&weather_agent, &main_agent, &question).await;
        println!("\n[WeatherAgent direct]");
        match direct {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("error: {err}"),
        }
        println!("\n[MainAgent using WeatherLookup tool]");
        match via_tool {
            Ok(text) => println!("{text}\n"),
            Err(err) => eprintln!("error: {err}\n"),
        }
    }

    Ok(())
}

/// Asks `question` of both agents on fresh sessions. A failure on one side
/// does not stop the other.
async fn compare_answers(
    weather_agent: &Agent,
    main_agent: &Agent,
    question: &str,
) -> (Result<String, AgentError>, Result<String, AgentError>) {
    let direct = weather_agent
        .run_with_gate(&mut Session::with_generated_id(), question, &DenyAllGate)
        .await;
    let via_tool = main_agent
        .run_with_gate(&mut Session::with_generated_id(), question, &DenyAllGate)
        .await;
    (direct, via_tool)
}

async fn weather_direct(model: Arc<dyn ChatModel>, console: &Console) -> Result<(), Box<dyn Error>> {
    let agent = Agent::builder()
        .shared_model(model)
        .name("WeatherAssistant")
        .system_prompt(
            "You are a concise weather assistant. Call the right tool and respond with the tool output only.",
        )
        .tools(weather_tools())
        .build()?;

    println!("=== Lab 03: Function Tools ===");
    println!("Ask about current weather or maximum temperatures. Type 'exit' to quit.\n");

    loop {
        let Some(question) = console.prompt("Weather assistant question: ").await? else {
            break;
        };
        if is_exit(&question) {
            println!("Goodbye!");
            break;
        }
        if question.is_empty() {
            println!("Question cannot be empty.\n");
            continue;
        }

        match agent
            .run_with_gate(&mut Session::with_generated_id(), question, &DenyAllGate)
            .await
        {
            Ok(text) => println!("\nAgent: {text}\n"),
            Err(err) => eprintln!("\nAgent error: {err}\n"),
        }
    }

    Ok(())
}
