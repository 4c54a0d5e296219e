//! Terrafarm - ephemeral RPM build farms on DigitalOcean
//!
//! ## Usage
//!
//! ```bash
//! # Create a farm from a template and let the monitor destroy it after 3 hours
//! terrafarm create c7-multiarch --ttl 3h --max-wait 30m
//!
//! # Inspect preferences, farm and monitor
//! terrafarm status
//!
//! # Give running builds one more hour
//! terrafarm prolong 1h
//!
//! # Destroy right now
//! terrafarm destroy --force
//! ```
//!
//! The `monitor` command is internal: `create` and `prolong` spawn it as a
//! detached process.

use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand};
use colored::{ColoredString, Colorize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use terrafarm::{
    Credentials, DigitalOceanClient, FarmMonitor, FarmState, LaunchMode, MonitorLauncher,
    MonitorSpec, NodeInfo, NodeProbe, NodeState, OutputMode, PreferenceOverrides, Preferences,
    PreferencesResolver, Provisioner, SshProber, StartMode, StateStore, SystemClock,
    TerraformRunner, Validation,
    farm::{DestroyOutcome, destroy_farm, export_nodes, list_templates},
    launcher::is_alive,
    monitor::{bridge_signals, format_time},
    prefs::{self, EV_PASSWORD, EV_TOKEN, masked_token, parse_minutes},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Terrafarm: ephemeral build farms on DigitalOcean
#[derive(Parser)]
#[command(name = "terrafarm", version)]
#[command(about = "Create and destroy DigitalOcean build farms with Terraform", long_about = None)]
struct Cli {
    /// Don't ask for confirmation
    #[arg(short, long, global = true)]
    force: bool,

    /// Don't validate preferences against the DigitalOcean API
    #[arg(long, global = true)]
    no_validate: bool,

    /// Verbose logging
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(flatten)]
    prefs: PrefArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Preference overrides; durations accept `90`, `90m`, `3h`
#[derive(Args)]
struct PrefArgs {
    /// Farm time to live
    #[arg(short, long, global = true)]
    ttl: Option<String>,

    /// Grace period after TTL while builds are running
    #[arg(short = 'w', long, global = true)]
    max_wait: Option<String>,

    /// Export node list to this file
    #[arg(short, long, global = true)]
    output: Option<String>,

    /// DigitalOcean API token
    #[arg(short = 'T', long, global = true)]
    token: Option<String>,

    /// Private SSH key
    #[arg(short = 'K', long, global = true)]
    key: Option<String>,

    /// DigitalOcean region
    #[arg(short = 'R', long, global = true)]
    region: Option<String>,

    /// Droplet size
    #[arg(short = 'N', long, global = true)]
    node_size: Option<String>,

    /// Build user name
    #[arg(short = 'U', long, global = true)]
    user: Option<String>,

    /// Build user password
    #[arg(short = 'P', long, global = true)]
    password: Option<String>,

    /// Treat build locks older than this as stale
    #[arg(long, global = true)]
    max_build_time: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and run a farm
    #[command(visible_aliases = ["apply", "start"])]
    Create {
        /// Template name
        template: Option<String>,
    },

    /// Destroy the farm
    #[command(visible_aliases = ["delete", "stop"])]
    Destroy {
        /// Destroy every terrafarm droplet through the DigitalOcean API
        #[arg(long)]
        api: bool,
    },

    /// Show preferences, farm and monitor info
    #[command(visible_aliases = ["info", "state"])]
    Status,

    /// List available templates
    Templates,

    /// Move the destroy deadline forward
    Prolong {
        /// Extra time (`90`, `90m`, `2h`)
        duration: String,
    },

    /// Run the farm monitor (internal)
    #[command(hide = true)]
    Monitor {
        /// `<destroy_after>[+<max_wait>]`
        spec: Option<String>,

        /// Continue with the stored deadline
        #[arg(long, conflicts_with = "spec")]
        resume: bool,
    },
}

/// Everything a command needs, captured once at startup
struct Context {
    env: HashMap<String, String>,
    data_dir: PathBuf,
    store: StateStore,
    overrides: PreferenceOverrides,
    force: bool,
    no_validate: bool,
}

impl Context {
    fn resolver(&self) -> anyhow::Result<PreferencesResolver> {
        let cwd = std::env::current_dir()?;

        Ok(PreferencesResolver::new(&self.data_dir)
            .with_prefs_file(prefs::find_prefs_file(&cwd))
            .with_env(self.env.clone())
            .with_overrides(self.overrides.clone()))
    }

    fn runner(&self, output: OutputMode) -> TerraformRunner {
        TerraformRunner::new(&self.data_dir, self.store.terraform_state_path(), output)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env: HashMap<String, String> = std::env::vars().collect();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Commands::Monitor { spec, resume } = cli.command {
        return run_monitor(env, spec, resume, cli.debug).await;
    }

    init_console_logging(cli.debug);

    let data_dir = prefs::data_dir(&env)?;

    let ctx = Context {
        store: StateStore::new(&data_dir),
        data_dir,
        env,
        overrides: overrides(cli.prefs),
        force: cli.force,
        no_validate: cli.no_validate,
    };

    match cli.command {
        Commands::Create { template } => create(ctx, template).await,
        Commands::Destroy { api } => destroy(ctx, api).await,
        Commands::Status => status(ctx).await,
        Commands::Templates => templates(ctx),
        Commands::Prolong { duration } => prolong(ctx, &duration).await,
        Commands::Monitor { .. } => Ok(()),
    }
}

fn overrides(args: PrefArgs) -> PreferenceOverrides {
    PreferenceOverrides {
        ttl: args.ttl,
        max_wait: args.max_wait,
        output: args.output,
        token: args.token,
        key: args.key,
        region: args.region,
        node_size: args.node_size,
        user: args.user,
        password: args.password,
        template: None,
        max_build_time: args.max_build_time,
    }
}

fn init_console_logging(debug: bool) {
    let default = if debug { "terrafarm=debug" } else { "terrafarm=warn" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn init_monitor_logging(data_dir: &Path, debug: bool) -> WorkerGuard {
    let default = if debug { "terrafarm=debug" } else { "terrafarm=info" };
    let appender = tracing_appender::rolling::never(data_dir, terrafarm::state::MONITOR_LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();

    guard
}

/// Detached monitor process
async fn run_monitor(
    env: HashMap<String, String>,
    spec: Option<String>,
    resume: bool,
    debug: bool,
) -> anyhow::Result<()> {
    // Leave the terminal session; fails harmlessly if already a group leader
    let _ = nix::unistd::setsid();

    let data_dir = prefs::data_dir(&env)?;
    std::fs::create_dir_all(&data_dir)?;
    let _guard = init_monitor_logging(&data_dir, debug);

    info!("{}", "-".repeat(80));
    info!("Terrafarm {} monitor started", env!("CARGO_PKG_VERSION"));

    let mode = match (resume, spec) {
        (true, _) => StartMode::Resume,
        (false, Some(spec)) => {
            let spec: MonitorSpec = spec.parse()?;
            StartMode::Fresh {
                destroy_after: spec.destroy_after,
                max_wait: spec.max_wait,
            }
        }
        (false, None) => {
            error!(critical = true, "Monitor needs a deadline or --resume");
            bail!("Monitor needs a deadline or --resume");
        }
    };

    let credentials = Credentials {
        token: env.get(EV_TOKEN).cloned().unwrap_or_default(),
        password: env.get(EV_PASSWORD).cloned().unwrap_or_default(),
    };

    let store = StateStore::new(&data_dir);
    let runner = TerraformRunner::new(&data_dir, store.terraform_state_path(), OutputMode::Log);

    let monitor = match FarmMonitor::start(
        store,
        mode,
        std::process::id(),
        runner,
        SshProber::new(),
        SystemClock,
        credentials,
    ) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!(critical = true, "Can't start monitor: {}", e);
            return Err(e.into());
        }
    };

    let (tx, rx) = mpsc::channel(8);
    let _signals = bridge_signals(tx)?;

    let exit = monitor.run(rx).await?;
    info!("Monitor finished: {:?}", exit);

    Ok(())
}

async fn create(ctx: Context, template: Option<String>) -> anyhow::Result<()> {
    let runner = ctx.runner(OutputMode::Console);
    runner.check_binary()?;

    if !runner.state().map(|s| s.is_empty()).unwrap_or(false) {
        bail!("Farm already works or its state can't be read. Destroy it first.");
    }

    let mut resolver = ctx.resolver()?;
    if template.is_some() {
        let overrides = PreferenceOverrides {
            template,
            ..ctx.overrides.clone()
        };
        resolver = resolver.with_overrides(overrides);
    }

    let prefs = resolver.resolve()?;

    let checks = remote_checks(&ctx, &prefs).await;
    print_preferences(&prefs, checks.as_ref());

    if let Some(checks) = &checks {
        if checks.any_invalid() {
            bail!("Preferences are not valid, fix them and try again");
        }
    }

    if !ctx.force && !confirm("Create farm?")? {
        return Ok(());
    }

    let guard = interrupt_guard();
    let applied = runner.apply(&prefs).await;
    guard.abort();
    applied?;

    let price = match &checks {
        Some(_) => match DigitalOceanClient::new(&prefs.token) {
            Ok(client) => client.size_price(&prefs.node_size).await,
            Err(_) => None,
        },
        None => None,
    };

    let now = chrono::Utc::now().timestamp();
    ctx.store.save_farm(&FarmState::new(&prefs, now, price))?;

    if let Some(output) = &prefs.output {
        let nodes: Vec<NodeInfo> = runner.state()?.nodes.iter().map(NodeInfo::new).collect();
        export_nodes(output, &nodes, &prefs.user, &prefs.password)?;
    }

    if prefs.ttl > 0 {
        let spec = MonitorSpec::from_minutes(now, prefs.ttl, prefs.max_wait);
        MonitorLauncher::new(ctx.store.clone(), Credentials::from(&prefs))?
            .launch(LaunchMode::Fresh(spec))
            .await
            .context("Farm created, but monitor failed to start")?;
    }

    println!("{}", "Farm successfully created!".green());

    Ok(())
}

async fn destroy(ctx: Context, api: bool) -> anyhow::Result<()> {
    let prefs = ctx.resolver()?.merge()?;

    if api {
        if !ctx.force && !confirm("Destroy every terrafarm droplet?")? {
            return Ok(());
        }

        let destroyed = DigitalOceanClient::new(&prefs.token)?
            .destroy_farm_droplets()
            .await?;

        ctx.store.delete_farm()?;
        println!("{} droplets destroyed", destroyed.len());
        return Ok(());
    }

    let runner = ctx.runner(OutputMode::Console);
    runner.check_binary()?;

    if !runner.state()?.is_empty() && !ctx.force && !confirm("Destroy farm?")? {
        return Ok(());
    }

    let guard = interrupt_guard();
    let outcome = destroy_farm(&runner, &ctx.store, &prefs).await;
    guard.abort();

    match outcome? {
        DestroyOutcome::Destroyed => println!("{}", "Farm successfully destroyed!".green()),
        DestroyOutcome::NothingToDestroy => {
            println!("{}", "Terrafarm does not works, nothing to destroy".yellow())
        }
    }

    Ok(())
}

async fn status(ctx: Context) -> anyhow::Result<()> {
    let prefs = ctx.resolver()?.merge()?;
    let checks = remote_checks(&ctx, &prefs).await;

    print_preferences(&prefs, checks.as_ref());

    for problem in prefs.validate(&ctx.data_dir) {
        println!("  {} {}", "✘".red(), problem);
    }

    let runner = ctx.runner(OutputMode::Console);
    let provisioned = runner.state().unwrap_or_default();
    // Unreadable farm state reads as not provisioned
    let farm = ctx.store.read_farm().ok().flatten();

    println!();

    let works = !provisioned.is_empty();
    println!(
        "{:>14}: {}",
        "Farm",
        if works { "works".green() } else { "stopped".dimmed() }
    );

    if let Some(farm) = &farm {
        println!("{:>14}: {}", "Template", farm.preferences.template);
        println!("{:>14}: {}", "Created", format_time(farm.started));
    }

    let now = chrono::Utc::now().timestamp();
    let monitor = ctx.store.read_monitor().ok().flatten().filter(|m| is_alive(m.pid));

    match monitor {
        Some(state) if now < state.destroy_after => {
            let left = humantime::format_duration(std::time::Duration::from_secs(
                (state.destroy_after - now) as u64,
            ));
            println!("{:>14}: {} (destroy in {})", "Monitor", "works".green(), left);
        }
        Some(_) => println!("{:>14}: {}", "Monitor", "destroying".yellow()),
        None => println!("{:>14}: {}", "Monitor", "stopped".dimmed()),
    }

    if works && !provisioned.nodes.is_empty() {
        let probe_prefs = match &farm {
            Some(farm) => farm.preferences.with_credentials(&Credentials::from(&prefs)),
            None => prefs.clone(),
        };

        let nodes = SshProber::new().probe(&probe_prefs, &provisioned.nodes).await;

        println!();
        for node in &nodes {
            println!(
                "  {:<24} {:<16} {:<7} {}",
                node.name,
                node.ip,
                node.arch,
                node_state(node.state)
            );
        }
    }

    Ok(())
}

fn templates(ctx: Context) -> anyhow::Result<()> {
    let templates = list_templates(&ctx.data_dir)
        .with_context(|| format!("Can't read templates from {}", ctx.data_dir.display()))?;

    if templates.is_empty() {
        println!("{}", "No templates found".yellow());
        return Ok(());
    }

    for template in templates {
        println!("  {} ({} nodes)", template.name.bold(), template.builders);
    }

    Ok(())
}

async fn prolong(ctx: Context, duration: &str) -> anyhow::Result<()> {
    let minutes = parse_minutes(duration)
        .filter(|m| *m > 0)
        .with_context(|| format!("Invalid duration: {}", duration))?;

    let prefs = ctx.resolver()?.merge()?;
    let seconds = i64::try_from(minutes.saturating_mul(60))?;

    let state = MonitorLauncher::new(ctx.store.clone(), Credentials::from(&prefs))?
        .prolong(seconds)
        .await?;

    println!(
        "Farm will be destroyed after {}",
        format_time(state.destroy_after).bold()
    );

    Ok(())
}

/// Results of the DigitalOcean preference checks
struct RemoteChecks {
    token: Validation,
    fingerprint: Validation,
    region: Validation,
    size: Validation,
}

impl RemoteChecks {
    fn any_invalid(&self) -> bool {
        [self.token, self.fingerprint, self.region, self.size].contains(&Validation::Invalid)
    }
}

async fn remote_checks(ctx: &Context, prefs: &Preferences) -> Option<RemoteChecks> {
    if ctx.no_validate || prefs.token.is_empty() {
        return None;
    }

    let client = DigitalOceanClient::new(&prefs.token).ok()?;

    let (token, fingerprint, region, size) = tokio::join!(
        client.validate_token(),
        client.validate_fingerprint(&prefs.fingerprint),
        client.validate_region(&prefs.region),
        client.validate_size(&prefs.node_size),
    );

    Some(RemoteChecks {
        token,
        fingerprint,
        region,
        size,
    })
}

fn print_preferences(prefs: &Preferences, checks: Option<&RemoteChecks>) {
    let mark = |v: fn(&RemoteChecks) -> Validation| match checks.map(v) {
        Some(Validation::Valid) => " ✔".green(),
        Some(Validation::Invalid) => " ✘".red(),
        Some(Validation::Unreachable) => " ?".yellow(),
        None => "".normal(),
    };

    println!("{:>14}: {}", "Template", or_dash(&prefs.template));
    println!("{:>14}: {}{}", "Token", or_dash(&masked_token(&prefs.token)), mark(|c| c.token));
    println!("{:>14}: {}", "Key", prefs.key.display());
    println!("{:>14}: {}{}", "Fingerprint", or_dash(&prefs.fingerprint), mark(|c| c.fingerprint));
    println!("{:>14}: {}{}", "Region", prefs.region, mark(|c| c.region));
    println!("{:>14}: {}{}", "Node size", prefs.node_size, mark(|c| c.size));
    println!("{:>14}: {}", "User", prefs.user);
    println!("{:>14}: {}", "TTL", ttl_label(prefs.ttl));

    if prefs.max_wait > 0 {
        println!("{:>14}: {}", "Max wait", minutes_label(prefs.max_wait));
    }

    if prefs.max_build_time > 0 {
        println!("{:>14}: {}", "Max build time", minutes_label(prefs.max_build_time));
    }

    if let Some(output) = &prefs.output {
        println!("{:>14}: {}", "Output", output.display());
    }
}

fn ttl_label(ttl: u64) -> ColoredString {
    let label = minutes_label(ttl);

    match ttl {
        t if t > 360 => label.red(),
        t if t > 120 => label.yellow(),
        _ => label.green(),
    }
}

fn minutes_label(minutes: u64) -> String {
    humantime::format_duration(std::time::Duration::from_secs(minutes * 60)).to_string()
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() { "-" } else { value }
}

fn node_state(state: NodeState) -> ColoredString {
    match state {
        NodeState::Active => "active".green(),
        NodeState::Inactive => "inactive".normal(),
        NodeState::Down => "down".red(),
        NodeState::Unknown => "unknown".dimmed(),
    }
}

/// Keep Ctrl-C from abandoning a running terraform
fn interrupt_guard() -> JoinHandle<()> {
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "You can't cancel command execution at this time".yellow());
        }
    })
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{} [y/N]: ", question);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().to_lowercase().starts_with('y'))
}
