//! Heat CLI - inspect tagged model output and replay scripted conversations
//!
//! Everything here runs offline against heat-core. Builds with the `genai`
//! feature add `ask`, which sends one prompt to the configured provider.

mod replay;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use tokio::sync::mpsc;

use heat_core::config::{Config, RenderConfig};
use heat_core::parser::{self, Content};
use heat_core::template::{self, DATETIME_KEY, PromptTemplate, TemplateContext};
use heat_core::{ConversationEvent, Message, Role, Run, cluster};

use replay::ReplayScript;

#[derive(Parser)]
#[command(name = "heat")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect tagged model output and replay scripted conversations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse tagged text and print the content tree as JSON
    Parse {
        /// Comma-separated tag names (defaults to the render config)
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,

        /// Input file; stdin when omitted
        file: Option<PathBuf>,
    },

    /// Cluster a JSON message list into runs
    Runs {
        /// JSON file holding an array of messages
        file: PathBuf,

        /// Print the runs as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Render a prompt template
    Template {
        /// Template text with {{KEY}} placeholders
        text: String,

        /// Placeholder value as KEY=VALUE (repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Replay a scripted conversation through the orchestrator
    Replay {
        /// JSON replay script
        script: PathBuf,

        /// Print conversation events as JSON lines while replaying
        #[arg(long)]
        events: bool,

        /// Write the resulting history to this file as JSON
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Send one prompt to the configured provider
    #[cfg(feature = "genai")]
    Ask {
        /// Prompt text
        prompt: String,
    },
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Keep stdout clean for JSON output unless asked for more
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "info,heat_core=debug"
        } else {
            "warn"
        })
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Parse { tags, file } => run_parse(&config.render, tags, file.as_deref()),
        Commands::Runs { file, json } => run_runs(&file, json),
        Commands::Template { text, vars } => {
            run_template(&text, vars);
            Ok(())
        }
        Commands::Replay { script, events, save } => run_replay(&config, &script, events, save.as_deref()).await,
        #[cfg(feature = "genai")]
        Commands::Ask { prompt } => run_ask(&config, &prompt).await,
    }
}

/// An explicit path must load; the default location falls back to defaults
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load config from {}", path.display())),
        None => match Config::load_default() {
            Ok(config) => Ok(config),
            Err(e) => {
                eprintln!("{}", style(format!("Warning: {}, using defaults", e)).yellow());
                Ok(Config::default())
            }
        },
    }
}

fn read_input(file: Option<&Path>) -> anyhow::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read stdin")?;
            Ok(input)
        }
    }
}

fn run_parse(render: &RenderConfig, tags: Option<Vec<String>>, file: Option<&Path>) -> anyhow::Result<()> {
    let input = read_input(file)?;
    let tree = match tags {
        Some(tags) => parser::parse(&input, &tags)?,
        None => render.parse(&input),
    };
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

fn run_runs(file: &Path, json: bool) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let messages: Vec<Message> =
        serde_json::from_str(&content).with_context(|| format!("Expected a JSON message list in {}", file.display()))?;
    let runs = cluster(messages);

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!("{}", style(format!("{} runs", runs.len())).bold());
    println!();
    for run in &runs {
        print_run_summary(run);
    }
    Ok(())
}

fn run_template(text: &str, vars: Vec<(String, String)>) {
    let template = PromptTemplate::new(text);
    let mut context: TemplateContext = vars.into_iter().collect();
    context
        .entry(DATETIME_KEY.to_string())
        .or_insert_with(template::current_datetime);

    println!("{}", template.render(&context));

    let unresolved: Vec<String> = template
        .placeholders()
        .into_iter()
        .filter(|key| !context.keys().any(|known| known.trim().eq_ignore_ascii_case(key)))
        .collect();
    if !unresolved.is_empty() {
        eprintln!(
            "{} {}",
            style("Unresolved placeholders:").yellow(),
            style(unresolved.join(", ")).dim()
        );
    }
}

async fn run_replay(config: &Config, script: &Path, events: bool, save: Option<&Path>) -> anyhow::Result<()> {
    let script = ReplayScript::load(script)?;

    let (printer, sender) = if events {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConversationEvent>();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", style(line).dim()),
                    Err(e) => eprintln!("{}", style(format!("Unprintable event: {}", e)).red()),
                }
            }
        });
        (Some(printer), Some(tx))
    } else {
        (None, None)
    };

    let outcome = replay::replay(&script, config.orchestrator.clone(), sender).await?;
    // The orchestrator and its event sender are gone, so the printer drains and stops
    if let Some(printer) = printer {
        printer.await.context("Event printer failed")?;
    }

    for (turn, result) in script.turns.iter().zip(&outcome.turns) {
        match result {
            Ok(turn_outcome) => println!(
                "{} {} {}",
                style("Turn").bold(),
                style(format!("{:?}", turn.prompt)).cyan(),
                style(format!("{:?}", turn_outcome)).green()
            ),
            Err(e) => println!(
                "{} {} {}",
                style("Turn").bold(),
                style(format!("{:?}", turn.prompt)).cyan(),
                style(format!("failed: {}", e)).red()
            ),
        }
    }
    println!();

    let conversation = &outcome.conversation;
    if let Some(title) = &conversation.title {
        println!("{} {}", style("Title:").bold(), style(title).green());
    }
    for run in conversation.runs() {
        print_run(&run, &config.render);
    }
    if !conversation.suggestions.is_empty() {
        println!("{}", style("Suggested replies:").bold());
        for suggestion in &conversation.suggestions {
            println!("  {} {}", style("•").cyan(), suggestion);
        }
    }
    if outcome.unused_replies > 0 {
        eprintln!(
            "{}",
            style(format!("{} scripted replies were never requested", outcome.unused_replies)).yellow()
        );
    }

    if let Some(path) = save {
        let json = serde_json::to_string_pretty(&conversation.history)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{} {}", style("History saved to").dim(), style(path.display()).cyan());
    }
    Ok(())
}

#[cfg(feature = "genai")]
async fn run_ask(config: &Config, prompt: &str) -> anyhow::Result<()> {
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;

    use heat_core::{
        Conversation, ConversationOrchestrator, GenAIChatClient, SharedConversation, ToolRegistry, TurnOutcome,
        UserInput,
    };

    let client = Arc::new(GenAIChatClient::from_config(&config.provider));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = ConversationOrchestrator::new(client, Arc::new(ToolRegistry::new()))
        .with_config(config.orchestrator.clone())
        .with_events(tx);
    let conversation = SharedConversation::new(Conversation::new(
        "You are a helpful assistant. The current date and time is {{DATETIME}}.",
    ));

    // Print each assistant message as its snapshots grow
    let printer = tokio::spawn(async move {
        let mut printed: HashMap<String, usize> = HashMap::new();
        while let Some(event) = rx.recv().await {
            let ConversationEvent::MessageUpserted { message, .. } = event else {
                continue;
            };
            if message.role != Role::Assistant {
                continue;
            }
            let seen = printed.entry(message.id.clone()).or_default();
            if let Some(delta) = message.content.get(*seen..) {
                print!("{}", delta);
                let _ = std::io::stdout().flush();
                *seen = message.content.len();
            }
        }
    });

    let handle = orchestrator.spawn_turn(&conversation, UserInput::new(prompt));
    let cancel = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut report = handle.join().await?;
    report.wait_for_follow_up().await;
    interrupt.abort();
    printer.abort();
    println!();

    if report.outcome == TurnOutcome::Cancelled {
        println!("{}", style("Cancelled").yellow());
    }
    let suggestions = conversation.suggestions();
    if !suggestions.is_empty() {
        println!();
        for suggestion in suggestions {
            println!("  {} {}", style("•").cyan(), style(suggestion).dim());
        }
    }
    Ok(())
}

fn print_run_summary(run: &Run) {
    let elapsed = run.elapsed_pretty().unwrap_or_else(|| "unknown".to_string());
    println!(
        "{} {} {}",
        style("Run").bold(),
        style(&run.id).cyan(),
        style(format!("({} messages, {})", run.len(), elapsed)).dim()
    );
    let tool_calls: usize = run.steps().iter().map(|m| m.tool_calls.len()).sum();
    if tool_calls > 0 {
        println!("  {} tool calls", tool_calls);
    }
    match run.response() {
        Some(response) => println!("  {}", first_line(&response.content)),
        None => println!("  {}", style("(no response)").dim()),
    }
}

fn print_run(run: &Run, render: &RenderConfig) {
    print_run_summary(run);
    for message in &run.messages {
        print_message(message, render);
    }
    println!();
}

fn print_message(message: &Message, render: &RenderConfig) {
    let role = match message.role {
        Role::User => style(message.role.as_str()).bold().green(),
        Role::Assistant => style(message.role.as_str()).bold().blue(),
        Role::Tool => style(message.role.as_str()).bold().yellow(),
        Role::System => style(message.role.as_str()).bold().dim(),
    };
    match message.label() {
        Some(label) => println!("  {} {}", role, style(format!("[{}]", label)).dim()),
        None => println!("  {}", role),
    }

    for call in &message.tool_calls {
        println!("    {} {}({})", style("→").cyan(), style(&call.name).yellow(), call.arguments);
    }

    if message.role != Role::Assistant {
        if !message.content.is_empty() {
            println!("    {}", message.content.trim());
        }
        return;
    }

    for item in &render.parse(&message.content) {
        match item {
            Content::Text { text, .. } => {
                let text = text.trim();
                if !text.is_empty() {
                    println!("    {}", text);
                }
            }
            Content::Tag(tag) if tag.name == "thinking" || tag.name == "reflection" => {
                println!("    {}", style(tag.content.trim()).dim().italic());
            }
            Content::Tag(tag) => {
                let marker = if tag.has_closing_tag { "" } else { "…" };
                println!(
                    "    {} {}{}",
                    style(format!("<{}>", tag.name)).magenta(),
                    tag.content.trim(),
                    marker
                );
            }
        }
    }
}

fn first_line(text: &str) -> &str {
    text.trim().lines().next().unwrap_or("")
}
