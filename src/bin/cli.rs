//! Sandbox CLI
//!
//! Run scripts at a chosen isolation tier, validate code, check container
//! images and manage the configuration file.

use clap::{Args, Parser, Subcommand};
use console::style;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tiered_sandbox::config::{
    apply_env_overrides, config_path, load_config, load_config_from_path, parse_memory_limit,
    read_config_snapshot, save_config, validate_config, Config, LogConfig, LogFormat,
};
use tiered_sandbox::sandbox::{
    Capability, ExecutionRequest, ExecutionResult, Language, ResourceGovernor, SandboxService,
    SecurityLevel, Validator,
};
use tiered_sandbox::{Error, Result, VERSION};
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "sandbox",
    version = VERSION,
    about = "Tiered code execution sandbox",
    long_about = None
)]
struct Cli {
    /// Configuration file (JSON5 or TOML)
    #[arg(long, global = true, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Memory limit, e.g. 64m
        #[arg(long)]
        memory: Option<String>,

        /// CPU share in (0, 1]
        #[arg(long)]
        cpu: Option<f64>,

        /// Environment variable KEY=VALUE (container tier only)
        #[arg(long = "env", short = 'E')]
        env: Vec<String>,

        /// Capability stand-in to inject (canvas, audio)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a script without running it
    Check {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Report container image availability
    Images,

    /// Write a sample configuration file
    InitConfig {
        /// Destination, defaults to the standard config path
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Print the effective configuration and any issues
    ShowConfig,
}

#[derive(Args)]
struct SourceArgs {
    /// Script file
    file: Option<PathBuf>,

    /// Inline code instead of a file
    #[arg(long, short = 'e', conflicts_with = "file")]
    code: Option<String>,

    /// Script language, inferred from the file extension when omitted
    #[arg(long, short)]
    language: Option<String>,

    /// Isolation tier: maximum, high, medium, low
    #[arg(long, short)]
    tier: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load(cli.config.as_deref())?;
    init_tracing(&config.log);

    match cli.command {
        Commands::Run {
            source,
            timeout_ms,
            memory,
            cpu,
            env,
            capabilities,
            json,
        } => {
            let mut request = build_request(&source)?;
            if let Some(ms) = timeout_ms {
                request = request.with_timeout(Duration::from_millis(ms));
            }
            if let Some(memory) = memory {
                let bytes = parse_memory_limit(&memory)
                    .ok_or_else(|| Error::InvalidInput(format!("Invalid memory limit: {}", memory)))?;
                request = request.with_memory(bytes);
            }
            if let Some(cpu) = cpu {
                request = request.with_cpu_share(cpu);
            }
            for pair in env {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| Error::InvalidInput(format!("Expected KEY=VALUE, got {}", pair)))?;
                request = request.with_env(key, value);
            }
            for capability in capabilities {
                request = request.with_capability(capability.parse::<Capability>()?);
            }
            run(config, request, json).await
        }
        Commands::Check { source } => check(&config, &source),
        Commands::Images => images(config).await,
        Commands::InitConfig { path, force } => init_config(path, force),
        Commands::ShowConfig => show_config(cli.config.as_deref(), &config),
    }
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config);
            Ok(config)
        }
        None => load_config(),
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&log.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn build_request(source: &SourceArgs) -> Result<ExecutionRequest> {
    let code = match (&source.code, &source.file) {
        (Some(code), _) => code.clone(),
        (None, Some(file)) => std::fs::read_to_string(file)?,
        (None, None) => {
            return Err(Error::InvalidInput(
                "Provide a script file or --code".to_string(),
            ))
        }
    };

    let language = match (&source.language, &source.file) {
        (Some(language), _) => language.parse::<Language>()?,
        (None, Some(file)) => language_from_path(file)?,
        (None, None) => {
            return Err(Error::InvalidInput(
                "--language is required with --code".to_string(),
            ))
        }
    };

    let request = ExecutionRequest::new(code, language);
    match &source.tier {
        Some(tier) => Ok(request.with_security_level(tier.parse::<SecurityLevel>()?)),
        None => Ok(request),
    }
}

fn language_from_path(path: &Path) -> Result<Language> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("js") | Some("mjs") | Some("cjs") => Ok(Language::JavaScript),
        Some("py") => Ok(Language::Python),
        Some("lua") => Ok(Language::Lua),
        Some("csx") | Some("cs") => Ok(Language::CSharp),
        _ => Err(Error::InvalidInput(format!(
            "Cannot infer language from {}, use --language",
            path.display()
        ))),
    }
}

async fn run(config: Config, request: ExecutionRequest, json: bool) -> Result<()> {
    let level = request.level_or(config.sandbox.default_security_level);
    let service = SandboxService::new(config.sandbox).await?;

    if !json {
        println!(
            "{} {} code at {} tier...\n",
            style("Executing").cyan().bold(),
            request.language,
            level
        );
    }

    let result = service.execute(request).await;
    service.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    if !result.output.is_empty() {
        println!("{}\n{}", style("Output:").bold(), result.output);
    }

    if result.success {
        println!("\n{}", style("✓ Execution succeeded").green());
    } else {
        let kind = result
            .error_kind
            .map(|k| k.to_string())
            .unwrap_or_default();
        println!("\n{} [{}] {}", style("✗ Execution failed").red(), kind, result.error);
    }

    let meta = &result.metadata;
    println!(
        "{}",
        style(format!(
            "Time: {}ms  Memory: {} bytes  CPU: {}µs  Id: {}",
            meta.duration_ms,
            meta.resource_usage.memory_bytes,
            meta.resource_usage.cpu_time_ns / 1000,
            meta.execution_id
        ))
        .dim()
    );
}

fn check(config: &Config, source: &SourceArgs) -> Result<()> {
    let request = build_request(source)?;
    let validator = Validator::new(config.sandbox.max_code_chars)?;
    let governor = ResourceGovernor::new(&config.sandbox.tiers, &config.sandbox.environment)?;

    if let Err(e) = validator.validate(&request) {
        println!("{} {}", style("✗ Rejected:").red().bold(), e);
        std::process::exit(1);
    }

    let level = request.level_or(config.sandbox.default_security_level);
    let limits = governor.resolve_limits(&request, level).map_err(Error::from)?;
    println!("{} {} rules passed", style("✓").green().bold(), validator.rules().len());
    println!(
        "  Tier: {}  Memory: {} bytes  CPU: {}  Timeout: {}ms",
        level,
        limits.memory_bytes,
        limits.cpu_share,
        limits.timeout_ms()
    );
    Ok(())
}

async fn images(config: Config) -> Result<()> {
    let service = SandboxService::new(config.sandbox).await?;
    let report = service.check_images().await;
    service.shutdown().await;

    println!("\n{}", style("Container images").cyan().bold());
    for status in report? {
        let marker = if status.available {
            style("✓").green()
        } else {
            style("✗").red()
        };
        let note = if status.pulled { " (pulled)" } else { "" };
        println!("  {} {:<10} {}{}", marker, status.language.to_string(), status.image, note);
    }
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(config_path);
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists, use --force to overwrite",
            path.display()
        )));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    save_config(&Config::default(), &path)?;
    println!("{} Wrote {}", style("✓").green().bold(), path.display());
    Ok(())
}

fn show_config(explicit: Option<&Path>, effective: &Config) -> Result<()> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(config_path);
    let snapshot = read_config_snapshot(&path);
    debug!(path = %snapshot.path.display(), exists = snapshot.exists, "Config snapshot");

    println!("{} {}", style("Config file:").bold(), snapshot.path.display());
    for issue in &snapshot.issues {
        println!("  {} {}", style("!").yellow(), issue);
    }

    println!("\n{}", style("Effective configuration").cyan().bold());
    println!("{}", serde_json::to_string_pretty(effective)?);

    let validation = validate_config(effective);
    for issue in &validation.errors {
        println!("{} {}", style("error:").red().bold(), issue);
    }
    for issue in &validation.warnings {
        println!("{} {}", style("warning:").yellow().bold(), issue);
    }
    if validation.valid {
        println!("\n{}", style("✓ Configuration is valid").green());
    }

    let env_keys: BTreeMap<&str, bool> = [
        "SANDBOX_DEFAULT_SECURITY_LEVEL",
        "SANDBOX_MAX_CONCURRENT",
        "DOCKER_HOST",
        "RUST_LOG",
    ]
    .into_iter()
    .map(|k| (k, std::env::var(k).is_ok()))
    .collect();
    println!("\n{}", style("Environment overrides").bold());
    for (key, set) in env_keys {
        println!("  {:<32} {}", key, if set { "set" } else { "-" });
    }
    Ok(())
}
