//! llmrotor CLI - inspect providers and run completions with fallback.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use llmrotor::{
    CompletionOptions, CompletionParams, CompletionRequest, FallbackPolicy, LlmClient, Message,
    ProvidersConfig,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "llmrotor")]
#[command(version)]
#[command(about = "Multi-provider LLM completions with key rotation, rate limiting and fallback")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Provider config file (JSON or YAML); defaults to discovery
    #[arg(short, long, global = true, env = "LLMROTOR_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers
    Providers,

    /// Show one provider's resolved configuration and key pool
    Info {
        provider: String,
    },

    /// Run a chat completion
    Complete {
        /// Model reference `provider/model`; repeat to form a fallback chain
        #[arg(short, long = "model")]
        models: Vec<String>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        /// Per-attempt deadline
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Attempts per model on key-scoped failures
        #[arg(long, default_value = "1")]
        attempts: u32,

        /// Initial wait between attempts on the same model, doubled per retry
        #[arg(long, default_value = "500")]
        retry_backoff_ms: u64,

        prompt: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ProvidersConfig> {
    match path {
        Some(path) => ProvidersConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => ProvidersConfig::discover().context("Failed to discover provider config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    llmrotor::util::init_tracing();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Providers => {
            let client = LlmClient::new(config)?;
            for name in client.providers() {
                let info = client.provider_info(&name)?;
                let marker = if info.has_keys { "ok" } else { "no keys" };
                println!("{:<12} {:<8} {}", info.name, marker, info.base_url);
            }
        }
        Commands::Info { provider } => {
            let client = LlmClient::new(config)?;
            let info = client.provider_info(&provider)?;
            println!("{}", serde_json::to_string_pretty(&info)?);

            let stats = client.pool_stats(&provider)?;
            println!(
                "keys: {} total, {} available, {} limited",
                stats.total_keys, stats.available_keys, stats.limited_keys
            );
            for key in stats.keys {
                println!("  {} claims={}", key.fingerprint, key.claims);
            }
        }
        Commands::Complete {
            models,
            temperature,
            max_tokens,
            system,
            timeout_secs,
            attempts,
            retry_backoff_ms,
            prompt,
        } => {
            let policy = FallbackPolicy::with_attempts_per_model(attempts)
                .with_retry_backoff(Duration::from_millis(retry_backoff_ms));
            let client = LlmClient::builder()
                .config(config)
                .fallback_policy(policy)
                .build()?;

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));

            let params = CompletionParams {
                temperature,
                max_tokens,
                ..Default::default()
            };
            let request = CompletionRequest::new(messages).with_params(params);

            let mut options = CompletionOptions::default();
            if let Some(secs) = timeout_secs {
                options = options.with_timeout(Duration::from_secs(secs));
            }

            let response = match models.as_slice() {
                [] => client.completion_with_options(&request, None, &options).await?,
                [single] => {
                    client
                        .completion_with_options(&request, Some(single.as_str()), &options)
                        .await?
                }
                chain => {
                    client
                        .completion_with_fallback(chain, &request, &options)
                        .await?
                }
            };

            if let Some(calls) = response.tool_calls() {
                println!("{}", serde_json::to_string_pretty(calls)?);
            } else {
                let Some(content) = response.content() else {
                    bail!("Provider returned no content");
                };
                println!("{content}");
            }

            if let Some(usage) = response.usage {
                tracing::info!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    total_tokens = usage.total_tokens,
                    "Token usage"
                );
            }
        }
    }

    Ok(())
}
