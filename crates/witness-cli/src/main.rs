mod config_file;
mod scenarios;

use compact_str::CompactString;
use facet::Facet;
use figue as args;
use std::sync::Arc;
use tracing::info;
use witness::{OrderChecker, TracingSink, WitnessConfig};
use witness_trace_capture::BacktraceCapture;
use witness_types::{NoStacks, StackCapture};

use crate::config_file::ConfigFile;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// JSON file with checker settings, order hints and blessed pairs.
    #[facet(args::named, default)]
    config: Option<CompactString>,
    /// Print the graph as a JSON snapshot instead of text dumps.
    #[facet(args::named, default)]
    json: bool,
    #[facet(args::subcommand)]
    command: Command,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum Command {
    /// Two threads take the same two mutexes in opposite orders.
    LockOrderInversion,
    /// Two locks of one type held together.
    DuplicateType,
    /// Recursive and upgraded holds.
    Recursion,
    /// A lock taken while handing off another.
    InterlockHandoff,
    /// Every scenario in turn.
    All,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("witness")
                .description("Run lock-order scenarios against a fresh checker and dump what it learned")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?
        .value;

    let mut config = WitnessConfig::default();
    if let Some(path) = &cli.config {
        ConfigFile::load(path)?.apply(&mut config);
    }
    let stacks: Arc<dyn StackCapture> = if config.trace {
        Arc::new(BacktraceCapture::default())
    } else {
        Arc::new(NoStacks)
    };
    let checker = OrderChecker::new(config, Arc::new(TracingSink), stacks);
    witness_sync::install(checker.clone()).map_err(|_| "a lock-order checker is already installed".to_owned())?;

    match cli.command {
        Command::LockOrderInversion => scenarios::lock_order_inversion::run()?,
        Command::DuplicateType => scenarios::duplicate_type::run()?,
        Command::Recursion => scenarios::recursion::run()?,
        Command::InterlockHandoff => scenarios::interlock_handoff::run()?,
        Command::All => {
            scenarios::lock_order_inversion::run()?;
            scenarios::duplicate_type::run()?;
            scenarios::recursion::run()?;
            scenarios::interlock_handoff::run()?;
        }
    }
    info!(state = %checker.state(), generation = checker.generation(), "scenario finished");

    if cli.json {
        let snapshot = checker.snapshot();
        println!(
            "{}",
            facet_json::to_string_pretty(&snapshot).map_err(|e| format!("encode snapshot: {e}"))?
        );
        return Ok(());
    }
    print!("{}", checker.full_graph());
    println!();
    print!("{}", checker.display_tree());
    println!();
    print!("{}", checker.bad_stacks());
    Ok(())
}
