use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use lmlink::logging::init_logging;
use lmlink::types::config::{default_config_path, load_config};
use lmlink::{Client, ClientConfig, ParamMap, ParameterScope, QueryOutcome, QueryRequest, StreamEvent};

#[derive(Parser)]
#[command(author, version, about = "Client for a remote LLM inference server", long_about = None)]
struct Cli {
    /// Server base URL, overrides the config file and environment
    #[arg(long, global = true)]
    server: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "lmlink=warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List models the server can load
    Models,
    /// Show what the server has loaded
    Status,
    /// Load a model
    Load {
        model: String,
        /// Loading parameter as key=value (value parsed as JSON when possible)
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },
    /// Unload the current model
    Unload,
    /// Stream a response from the loaded model
    Query {
        model: String,
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        /// Send this text instead of letting the server format the prompt
        #[arg(long)]
        formatted: Option<String>,
        /// Inference parameter as key=value
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        /// Wait for the full response instead of streaming
        #[arg(long)]
        no_stream: bool,
    },
    /// Check that the server is up
    Ping,
    /// Show server platform and resources
    Info,
    /// Show the parameter schema
    Params {
        scope: ScopeArg,
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    Loading,
    Inference,
}

impl From<ScopeArg> for ParameterScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Loading => ParameterScope::Loading,
            ScopeArg::Inference => ParameterScope::Inference,
        }
    }
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing parameter name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_config(cli: &Cli) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) => load_config(&path),
        None => ClientConfig::default(),
    };
    config.apply_env()?;
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
        config.validate();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config = build_config(&cli)?;
    let client = Client::new(config)?;

    match cli.command {
        Commands::Models => {
            for model in client.fetch_models().await? {
                println!("{}", model);
            }
        }
        Commands::Status => {
            let state = client.refresh_status().await?;
            match state.model_name() {
                Some(name) if state.loaded => {
                    println!("loaded: {}", name);
                    if let Some(n_ctx) = state.context_length {
                        println!("context length: {}", n_ctx);
                    }
                }
                _ if state.loaded => println!("loaded"),
                _ => println!("no model loaded"),
            }
        }
        Commands::Load { model, params } => {
            let params: ParamMap = params.into_iter().collect();
            let state = client.load(&model, &params).await?;
            match state.context_length {
                Some(n_ctx) => println!("loaded {} (context length {})", model, n_ctx),
                None => println!("loaded {}", model),
            }
        }
        Commands::Unload => {
            client.refresh_status().await?;
            client.unload().await?;
            println!("unloaded");
        }
        Commands::Query {
            model,
            prompt,
            system,
            formatted,
            params,
            no_stream,
        } => {
            // The server owns the session; sync with it before querying
            client.refresh_status().await?;

            let mut request = QueryRequest::new(model, prompt);
            request.system_prompt = system;
            request.formatted_prompt = formatted;
            request.inference_parameters = params.into_iter().collect();

            if no_stream {
                println!("{}", client.complete(request).await?);
                return Ok(ExitCode::SUCCESS);
            }

            let mut printed = 0usize;
            let handle = client
                .query(request, move |event| print_event(event, &mut printed))
                .await?;

            let outcome = tokio::select! {
                outcome = handle.finished() => outcome,
                _ = tokio::signal::ctrl_c() => {
                    handle.cancel();
                    handle.finished().await
                }
            };
            // The error event has already been printed
            if outcome == QueryOutcome::Cancelled {
                eprintln!("\ncancelled");
            }
            return Ok(ExitCode::from(exit_status(&outcome)));
        }
        Commands::Ping => {
            let ping = client.ping().await?;
            match ping.timestamp {
                Some(ts) => println!("{} ({})", ping.status, ts),
                None => println!("{}", ping.status),
            }
        }
        Commands::Info => {
            let info = client.server_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Params { scope, model } => {
            let schema = client.parameter_schema(scope.into(), model.as_deref()).await?;
            for (key, spec) in schema.effective() {
                let range = match (spec.min, spec.max) {
                    (Some(min), Some(max)) => format!(" [{}, {}]", min, max),
                    (Some(min), None) => format!(" [{}, ..]", min),
                    (None, Some(max)) => format!(" [.., {}]", max),
                    (None, None) => String::new(),
                };
                println!("{} ({}) default {}{}  {}", key, spec.kind, spec.default, range, spec.description);
            }
        }
    }

    client.shutdown();
    Ok(ExitCode::SUCCESS)
}

fn exit_status(outcome: &QueryOutcome) -> u8 {
    match outcome {
        QueryOutcome::Completed => 0,
        QueryOutcome::Failed(_) => 1,
        QueryOutcome::Cancelled => 130,
    }
}

/// Print only the text not yet written; partials are cumulative
fn print_event(event: StreamEvent, printed: &mut usize) {
    let mut stdout = std::io::stdout();
    match event {
        StreamEvent::Processing => {}
        StreamEvent::Generating { partial } => {
            if let Some(delta) = partial.get(*printed..) {
                let _ = stdout.write_all(delta.as_bytes());
                let _ = stdout.flush();
                *printed = partial.len();
            }
        }
        StreamEvent::Complete { full } => {
            let delta = full.get(*printed..).unwrap_or("");
            let _ = writeln!(stdout, "{}", delta);
        }
        StreamEvent::Error { message } => {
            eprintln!("\nerror: {}", message);
        }
    }
}
