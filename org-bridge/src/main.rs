use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use org_bridge::config::{API_KEY_VAR, BridgeConfig};
use org_bridge::ids::generate_api_key;
use org_bridge::{CreateTodoRequest, CreatedTodo, OrgBridge};

#[derive(Debug, Parser)]
#[command(
    name = "org-bridge",
    about = "File TODO entries into org-mode outline files",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Org directory; overrides ORG_FILES_DIR.
    #[arg(long, global = true)]
    org_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a TODO from command-line flags.
    Add(AddArgs),

    /// Create a TODO from a JSON request body (file path or `-` for stdin).
    Submit(SubmitArgs),

    /// Report the configured org directory and whether it exists.
    Status(StatusArgs),

    /// Print a fresh API key with setup hints.
    Keygen,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    title: String,
    /// State keyword (TODO, NEXT, WAITING, ...).
    #[arg(long, default_value = "TODO")]
    state: String,
    #[arg(long)]
    priority: Option<String>,
    /// Tag to attach; repeat for several.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Scheduled date or datetime (YYYY-MM-DD[THH:MM]).
    #[arg(long)]
    scheduled: Option<String>,
    /// Render the scheduled time of day.
    #[arg(long)]
    scheduled_time: bool,
    /// Deadline date or datetime (YYYY-MM-DD[THH:MM]).
    #[arg(long)]
    deadline: Option<String>,
    /// Render the deadline time of day.
    #[arg(long)]
    deadline_time: bool,
    /// Make the entry recurring with this interval.
    #[arg(long)]
    repeat_every: Option<u32>,
    /// hours, days, weeks, months or years.
    #[arg(long, default_value = "days")]
    repeat_unit: String,
    /// standard, from_completion or catch_up.
    #[arg(long, default_value = "standard")]
    repeat_type: String,
    /// Field carrying the repeater: scheduled or deadline.
    #[arg(long, default_value = "scheduled")]
    recurring_field: String,
    /// Property drawer entry as KEY=VALUE; repeat for several.
    #[arg(long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,
    #[arg(long)]
    body: Option<String>,
    /// Target file relative to the org directory (defaults to the inbox).
    #[arg(long = "file")]
    file_name: Option<String>,
    /// File under this heading instead of appending at end of file.
    #[arg(long)]
    heading: Option<String>,
    /// Emit JSON instead of the written text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    /// Request JSON file, or `-` to read stdin.
    input: PathBuf,
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Emit JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = BridgeConfig::from_env();
    if let Some(dir) = cli.org_dir {
        config = config.with_org_dir(dir);
    }
    log::debug!("using org directory {:?}", config.org_dir);
    let bridge = OrgBridge::new(config);

    match cli.command {
        Commands::Add(args) => handle_add(&bridge, args),
        Commands::Submit(args) => handle_submit(&bridge, args),
        Commands::Status(args) => handle_status(&bridge, args),
        Commands::Keygen => handle_keygen(),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(io::stderr())
        .apply()
        .context("installing logger")?;
    Ok(())
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing property name in {raw:?}"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn build_request(args: AddArgs) -> CreateTodoRequest {
    let AddArgs {
        title,
        state,
        priority,
        tags,
        scheduled,
        scheduled_time,
        deadline,
        deadline_time,
        repeat_every,
        repeat_unit,
        repeat_type,
        recurring_field,
        properties,
        body,
        file_name,
        heading,
        json: _,
    } = args;

    CreateTodoRequest {
        state,
        priority,
        tags,
        scheduled,
        deadline,
        include_scheduled_time: scheduled_time,
        include_deadline_time: deadline_time,
        is_recurring: repeat_every.is_some(),
        repeat_every: repeat_every.unwrap_or(1),
        repeat_unit,
        repeat_type,
        recurring_field,
        properties: properties.into_iter().collect::<IndexMap<_, _>>(),
        body,
        file_name,
        heading,
        ..CreateTodoRequest::new(title)
    }
}

fn create(bridge: &OrgBridge, request: CreateTodoRequest) -> Result<CreatedTodo> {
    bridge.create_todo(request).map_err(|err| {
        let status = err.status_code();
        anyhow::Error::new(err).context(format!("request rejected (status {status})"))
    })
}

fn handle_add(bridge: &OrgBridge, args: AddArgs) -> Result<()> {
    let json = args.json;
    let created = create(bridge, build_request(args))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&created)?);
    } else {
        println!("{}", created.text);
        eprintln!("Filed {} into {}", created.id, created.file_path);
    }
    Ok(())
}

fn handle_submit(bridge: &OrgBridge, args: SubmitArgs) -> Result<()> {
    let raw = if args.input.as_os_str() == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("reading request from stdin")?;
        buf
    } else {
        fs::read_to_string(&args.input).with_context(|| format!("reading {:?}", args.input))?
    };
    let request: CreateTodoRequest =
        serde_json::from_str(&raw).context("decoding request JSON")?;
    let created = create(bridge, request)?;
    println!("{}", serde_json::to_string_pretty(&created)?);
    Ok(())
}

fn handle_status(bridge: &OrgBridge, args: StatusArgs) -> Result<()> {
    let status = bridge.status();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("{} {}", status.message, status.version);
    println!("org directory: {}", status.org_files_dir);
    println!(
        "status: {}",
        if status.healthy {
            "healthy"
        } else {
            "org directory missing"
        }
    );
    if !status.healthy {
        anyhow::bail!("org directory {} does not exist", status.org_files_dir);
    }
    Ok(())
}

fn handle_keygen() -> Result<()> {
    let key = generate_api_key();
    println!("Generated API key: {key}");
    println!();
    println!("Shell:   export {API_KEY_VAR}={key}");
    println!(".env:    {API_KEY_VAR}={key}");
    println!("systemd: Environment=\"{API_KEY_VAR}={key}\"");
    Ok(())
}
