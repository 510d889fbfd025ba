use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use futures::StreamExt;
use gateway::{
    denial_headers, init_logging, rate_limit_headers, AdmissionErrorBody, AiGateway, CancellationToken,
    GatewayConfig, GatewayError, GenerateRequest, HealthStatus, IdentityContext, LoggingConfig,
    ModelOverride, QuotaGrant, TrustTier,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::net::IpAddr;
use std::time::Duration;
use tracing::Level;

#[derive(Parser)]
#[command(name = "ai-gateway")]
#[command(about = "[AI] Resilient multi-provider AI gateway")]
#[command(version)]
struct Cli {
    /// Caller identity; omit to be treated as anonymous traffic
    #[arg(long, global = true)]
    identity: Option<String>,

    /// Trust tier of the identity (none, basic, verified)
    #[arg(long, global = true, default_value = "basic")]
    tier: TrustTier,

    /// Client address used to key anonymous quota
    #[arg(long, global = true, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Structured JSON logs on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// [►] Single-shot generation through the routing policy
    Generate(PromptArgs),
    /// [►] Streamed generation, printed as it arrives
    Stream(PromptArgs),
    /// [●] Probe every configured provider
    Health,
    /// [●] Show the routing policy currently in effect
    Policy,
}

#[derive(Args)]
struct PromptArgs {
    prompt: String,

    /// Operation name the circuit breaker is keyed on
    #[arg(long, default_value = "generate")]
    operation: String,

    #[arg(long)]
    system: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,
}

impl PromptArgs {
    fn request(&self, cancel: CancellationToken) -> GenerateRequest {
        let mut request = GenerateRequest::new(&self.prompt)
            .with_override(ModelOverride {
                model: self.model.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            })
            .with_cancel(cancel);
        if let Some(system) = &self.system {
            request = request.with_system_prompt(system);
        }
        request
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    init_logging(LoggingConfig::from_env().with_level(level).with_json(cli.json_logs))?;

    let config = GatewayConfig::from_env().context("Failed to load gateway configuration")?;
    let gateway = AiGateway::from_config(&config)?;

    let context = match &cli.identity {
        Some(identity) => IdentityContext::authenticated(identity.clone(), cli.tier),
        None => IdentityContext::anonymous(),
    };

    match &cli.command {
        Commands::Generate(args) => generate(&gateway, &context, cli.ip, args).await,
        Commands::Stream(args) => stream(&gateway, &context, cli.ip, args).await,
        Commands::Health => health(&gateway).await,
        Commands::Policy => policy(&gateway).await,
    }
}

/// Cancels the returned token on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

async fn generate(gateway: &AiGateway, context: &IdentityContext, ip: IpAddr, args: &PromptArgs) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("[|][/][-][\\]")
            .template("{spinner:.cyan} {msg}")?,
    );
    spinner.set_message("Waiting for provider...");
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = gateway
        .generate(context, ip, &args.operation, args.request(cancel_on_ctrl_c()))
        .await;
    spinner.finish_and_clear();

    let generated = result.map_err(report_denial)?;
    let response = &generated.response;
    println!("{}", response.content);
    println!();
    println!(
        "{} {} / {} · {} tokens · {}¢ · {}ms",
        style("[AI]").green().bold(),
        response.provider,
        response.model,
        response.usage.total_tokens,
        generated.cost_cents,
        response.processing_time.as_millis()
    );
    print_quota(&generated.quota);
    Ok(())
}

async fn stream(gateway: &AiGateway, context: &IdentityContext, ip: IpAddr, args: &PromptArgs) -> Result<()> {
    let opened = gateway
        .generate_stream(context, ip, &args.operation, args.request(cancel_on_ctrl_c()).streaming())
        .await
        .map_err(report_denial)?;

    let mut stream = opened.stream;
    let mut stdout = io::stdout();
    while let Some(item) = stream.next().await {
        let chunk = item?;
        if chunk.done {
            break;
        }
        write!(stdout, "{}", chunk.delta)?;
        stdout.flush()?;
    }
    println!();
    println!("{} streamed by {}", style("[AI]").green().bold(), opened.provider);
    print_quota(&opened.quota);
    Ok(())
}

async fn health(gateway: &AiGateway) -> Result<()> {
    let report = gateway.router().health_check().await;
    let status = match report.status {
        HealthStatus::Healthy => style(report.status.to_string()).green().bold(),
        HealthStatus::Degraded => style(report.status.to_string()).yellow().bold(),
        HealthStatus::Unhealthy => style(report.status.to_string()).red().bold(),
    };
    println!("Gateway: {}", status);
    if report.providers.is_empty() {
        println!("  {}", style("no providers configured").dim());
        return Ok(());
    }
    print!("{}", gateway.router().status_report());
    Ok(())
}

async fn policy(gateway: &AiGateway) -> Result<()> {
    let policy = gateway.router().current_policy().await?;
    println!("{} {}", style("Primary:").bold(), policy.primary);
    let fallbacks: Vec<String> = policy.fallbacks.iter().map(|p| p.to_string()).collect();
    println!("{} {}", style("Fallbacks:").bold(), fallbacks.join(", "));
    println!(
        "{} {:?} per attempt, {} attempts, {:?} base backoff",
        style("Retry:").bold(),
        policy.timeout_per_attempt,
        policy.retry.max_attempts,
        policy.retry.base_backoff
    );
    for provider in policy.candidates() {
        let model = policy.model_config(provider);
        println!(
            "  {} {} (temperature {}, max_tokens {})",
            provider, model.model, model.temperature, model.max_tokens
        );
    }
    Ok(())
}

fn print_quota(grant: &QuotaGrant) {
    for (name, value) in rate_limit_headers(grant) {
        println!("  {} {}", style(format!("{}:", name)).dim(), value);
    }
}

/// Print admission denials the way the HTTP layer would render them
fn report_denial(error: GatewayError) -> GatewayError {
    if let Some((status, body)) = AdmissionErrorBody::from_error(&error) {
        eprintln!("{} HTTP {}", style("[!]").red().bold(), status);
        for (name, value) in denial_headers(&error) {
            eprintln!("  {}: {}", name, value);
        }
        if let Ok(json) = serde_json::to_string_pretty(&body) {
            eprintln!("{}", json);
        }
    }
    error
}
