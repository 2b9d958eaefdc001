use anyhow::{anyhow, Context, Result};
use std::io::Write;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use reedline::{DefaultCompleter, DefaultHinter, DefaultPrompt, Reedline, Signal};

use crate::agent::{Agent, AgentEvent};
use crate::config::Config;
use crate::llm::{self, ProviderKind};
use crate::logging::init_logging;
use crate::server;
use crate::tools::ToolRegistry;

fn print_help() {
    println!("agentx - web chat front-end for a tool-using LLM agent");
    println!();
    println!("Usage: agentx [-v] <command>");
    println!();
    println!("Commands:");
    println!("  serve [--host H] [--port P]   start the web UI and API (default)");
    println!("  chat <provider> <model>       chat in the terminal");
    println!("  models <provider>             list models of a provider");
    println!("  tools                         list the available tools");
    println!("  onboard                       write the default config");
    println!("  help                          show this help");
    println!();
    println!("Providers: openai, anthropic, deepseek, ollama");
    println!();
    println!("Chat commands:");
    println!("  /clear  - forget the conversation");
    println!("  /quit   - exit");
}

/// `serve` flags.
#[derive(Debug, Default, PartialEq)]
struct ServeArgs {
    host: Option<String>,
    port: Option<u16>,
}

fn parse_serve_args(args: &[String]) -> Result<ServeArgs> {
    let mut parsed = ServeArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--host" => {
                let host = iter.next().context("--host needs a value")?;
                parsed.host = Some(host.clone());
            }
            "--port" => {
                let port = iter.next().context("--port needs a value")?;
                parsed.port = Some(
                    port.parse()
                        .with_context(|| format!("invalid port: {}", port))?,
                );
            }
            other => return Err(anyhow!("unknown option for serve: {}", other)),
        }
    }
    Ok(parsed)
}

fn run_onboard() -> Result<()> {
    let config = Config::default();
    let path = Config::default_path();

    config.ensure_artifacts().context("failed to create artifacts directory")?;
    config.ensure_workspace().context("failed to create workspace directory")?;
    println!("Artifacts: {}", config.server.artifacts_dir.display());
    println!("Workspace: {}", config.tools.workspace_root.display());

    if path.exists() {
        println!("Config already exists: {}", path.display());
    } else {
        config.save(&path).context("failed to write config")?;
        println!("Config written: {}", path.display());
    }

    println!();
    println!("Set API keys in the environment or a .env file:");
    for kind in ProviderKind::ALL {
        if let Some(var) = kind.api_key_var() {
            println!("  {}", var);
        }
    }
    println!("Then run 'agentx serve'.");
    Ok(())
}

async fn run_serve(config: Config, args: &[String]) -> Result<()> {
    let mut config = config;
    let flags = parse_serve_args(args)?;
    if let Some(host) = flags.host {
        config.server.host = host;
    }
    if let Some(port) = flags.port {
        config.server.port = port;
    }
    server::serve(config, llm::http_client()?).await
}

async fn run_models(config: Config, args: &[String]) -> Result<()> {
    let provider = args.first().context("usage: agentx models <provider>")?;
    let kind: ProviderKind = provider.parse()?;
    let models = llm::list_models(kind, &config.providers, llm::http_client()?).await?;
    if models.is_empty() {
        println!("No models found");
    }
    for model in models {
        if model.id == model.name {
            println!("{}", model.id);
        } else {
            println!("{}  ({})", model.id, model.name);
        }
    }
    Ok(())
}

fn run_tools(config: Config) -> Result<()> {
    let registry = ToolRegistry::with_defaults(&config.tools, llm::http_client()?);
    for info in registry.infos() {
        println!("{:<16} {}", info.name, info.description);
    }
    Ok(())
}

async fn run_chat(config: Config, args: &[String]) -> Result<()> {
    let (Some(provider), Some(model)) = (args.first(), args.get(1)) else {
        return Err(anyhow!("usage: agentx chat <provider> <model>"));
    };
    let kind: ProviderKind = provider.parse()?;
    config.ensure_workspace()?;

    let client = llm::http_client()?;
    let provider = llm::create_provider(kind, model, &config.providers, client.clone())?;
    let tools = ToolRegistry::with_defaults(&config.tools, client);
    let agent = Agent::new(Some(provider), tools, config.agent.clone());
    let mut context = agent.new_context();

    println!("Chatting with {} / {}. /quit to exit, /clear to reset.", kind, model);
    println!("Tools: {}", agent.tools().names().join(", "));
    println!();

    let mut line_editor = Reedline::create()
        .with_hinter(Box::new(DefaultHinter::default()))
        .with_completer(Box::new(DefaultCompleter::default()));
    let prompt = DefaultPrompt::default();

    loop {
        match line_editor.read_line(&prompt)? {
            Signal::Success(buffer) => {
                let input = buffer.trim();
                if input.is_empty() {
                    continue;
                }
                match input {
                    "/quit" | "/exit" | "quit" | "exit" => break,
                    "/clear" => {
                        context.clear();
                        println!("Conversation cleared\n");
                        continue;
                    }
                    "/help" => {
                        println!("/clear  - forget the conversation");
                        println!("/quit   - exit\n");
                        continue;
                    }
                    _ => {}
                }

                let (tx, mut rx) = mpsc::unbounded_channel();
                let printer = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        match event {
                            AgentEvent::Delta(delta) => {
                                print!("{}", delta);
                                let _ = std::io::stdout().flush();
                            }
                            AgentEvent::ToolCall { name, arguments } => {
                                println!("[tool] {}({})", name, arguments);
                            }
                            AgentEvent::ToolResult { .. } => {}
                        }
                    }
                });

                let result = agent
                    .run(&mut context, input, true, Some(&tx), &CancellationToken::new())
                    .await;
                drop(tx);
                let _ = printer.await;

                match result {
                    Ok(_) => println!("\n"),
                    Err(e) => println!("\nError: {:#}\n", e),
                }
            }
            Signal::CtrlD => break,
            Signal::CtrlC => println!("/quit to exit"),
        }
    }

    Ok(())
}

pub async fn run_cli() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
    args.retain(|a| a != "-v" && a != "--verbose");

    let command = args.first().map(|c| c.to_lowercase()).unwrap_or_else(|| "serve".to_string());
    let rest = args.get(1..).unwrap_or_default();

    if matches!(command.as_str(), "help" | "-h" | "--help" | "h") {
        print_help();
        return Ok(());
    }

    let mut config = Config::load_default()?;
    if verbose {
        config.agent.verbose = true;
    }
    init_logging(config.agent.verbose);

    match command.as_str() {
        "serve" | "s" => run_serve(config, rest).await,
        "chat" | "c" => run_chat(config, rest).await,
        "models" => run_models(config, rest).await,
        "tools" => run_tools(config),
        "onboard" => run_onboard(),
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!();
            eprintln!("Run 'agentx help' for usage");
            std::process::exit(1);
        }
    }
}
