//! DC-014: CLI subcommands: init, validate, plan, run, completions.

use crate::core::cookbook::Cookbook;
use crate::core::executor::{RecipeReport, RunReport, StepStatus};
use crate::core::parser::SETTINGS_FILE;
use crate::core::step::LoadFilter;
use crate::core::types::{Overrides, RunMode, StepKind};
use crate::steps;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "dbchef",
    version,
    about = "Reproducible dev/test database environments from declarative, tag-targeted recipes"
)]
pub struct Cli {
    /// More log output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Which recipes and steps to load.
#[derive(Args, Debug, Clone)]
pub struct Selection {
    /// Config root holding dbchef.yaml and one folder per recipe
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,

    /// Recipes to load (default: all)
    pub recipes: Vec<String>,

    /// Restrict every step to datasources matching these tags
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Keep only these steps (`name` or `name@datasource`)
    #[arg(short = 's', long = "step")]
    pub step_names: Vec<String>,

    /// Keep only steps of these kinds
    #[arg(long = "type", value_enum)]
    pub kinds: Vec<StepKind>,
}

impl Selection {
    pub fn filter(&self) -> LoadFilter {
        LoadFilter {
            tags: self.tags.clone(),
            step_names: self.step_names.clone(),
            step_kinds: self.kinds.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: Selection,

    /// Override the settings' execution mode
    #[arg(long, value_enum)]
    pub mode: Option<RunMode>,

    /// Run steps even when they report nothing to do
    #[arg(long, conflicts_with = "dry_run")]
    pub force: bool,

    /// Evaluate every step, change nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Apply at most this many migrations per datasource
    #[arg(long, conflicts_with = "target_version", value_parser = clap::value_parser!(u32).range(1..))]
    pub steps: Option<u32>,

    /// Apply migrations up to and including this version
    #[arg(long)]
    pub target_version: Option<i64>,

    /// Append run events to this directory
    #[arg(long)]
    pub journal: Option<PathBuf>,
}

impl RunArgs {
    /// Step option overrides named on the command line.
    pub fn overrides(&self) -> Overrides {
        let mut overrides = Overrides::new();
        if self.force {
            overrides = overrides.set("force", true);
        }
        if self.dry_run {
            overrides = overrides.set("dry_run", true);
        }
        if let Some(steps) = self.steps {
            overrides = overrides.set("steps", steps);
        }
        if let Some(version) = self.target_version {
            overrides = overrides.set("target_version", version);
        }
        overrides
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a config root with an example recipe
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Load every recipe without touching any datasource
    Validate {
        #[command(flatten)]
        selection: Selection,
    },

    /// Show the steps a run would execute, tier by tier
    Plan {
        #[command(flatten)]
        selection: Selection,
    },

    /// Run recipes
    Run(RunArgs),

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { selection } => cmd_validate(&selection),
        Commands::Plan { selection } => cmd_plan(&selection),
        Commands::Run(args) => cmd_run(args).await,
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "dbchef", &mut std::io::stdout());
            Ok(())
        }
    }
}

const SETTINGS_TEMPLATE: &str = r#"# Execution mode for steps sharing a priority: sequential | parallel
mode: sequential

# Values available to templates as {{params.<key>}}
params: {}

connect:
  attempts: 3
  timeout_secs: 5
  retry_delay_ms: 500
"#;

const DATASOURCES_TEMPLATE: &str = r#"datasources:
  seed:
    type: file
    engine: csv
    path: seed.csv
    tags: [seed]
  export:
    type: file
    engine: json
    path: out/export.json
    tags: ["env:dev"]
"#;

const SEED_TEMPLATE: &str = "id,name\n1,alice\n2,bob\n";

const STEP_TEMPLATE: &str = r#"type: sync
priority: 10
tags: ["env:dev"]
source: seed
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let settings = path.join(SETTINGS_FILE);
    if settings.exists() {
        return Err(format!("{} already exists", settings.display()));
    }

    let recipe = path.join("example");
    std::fs::create_dir_all(&recipe)
        .map_err(|e| format!("cannot create {}: {}", recipe.display(), e))?;

    let files = [
        (settings, SETTINGS_TEMPLATE),
        (recipe.join("datasources.yaml"), DATASOURCES_TEMPLATE),
        (recipe.join("seed.csv"), SEED_TEMPLATE),
        (recipe.join("export.yaml"), STEP_TEMPLATE),
    ];
    for (file, content) in &files {
        std::fs::write(file, content)
            .map_err(|e| format!("cannot write {}: {}", file.display(), e))?;
    }

    println!("Initialized dbchef config root at {}", path.display());
    for (file, _) in &files {
        println!("  Created: {}", file.display());
    }
    Ok(())
}

fn load(selection: &Selection) -> Result<Cookbook, String> {
    Cookbook::load(
        &selection.root,
        &selection.recipes,
        &steps::builtin(),
        &selection.filter(),
    )
    .map_err(|e| e.to_string())
}

fn cmd_validate(selection: &Selection) -> Result<(), String> {
    let cookbook = load(selection)?;
    let stats = cookbook.statistics();
    println!(
        "OK: {} ({} recipes, {} steps)",
        selection.root.display(),
        stats.per_recipe.len(),
        stats.total
    );
    Ok(())
}

fn cmd_plan(selection: &Selection) -> Result<(), String> {
    let cookbook = load(selection)?;
    println!(
        "Planning: {} (mode: {})",
        selection.root.display(),
        cookbook.mode()
    );

    for name in cookbook.recipe_names() {
        let Some(recipe) = cookbook.recipe(name) else {
            continue;
        };
        println!();
        println!("{} ({} steps):", name, recipe.step_count());
        for (priority, steps) in recipe.tiers() {
            println!("  priority {}:", priority);
            for step in steps {
                println!("    {} [{}]", step.name(), step.kind());
            }
        }
    }

    let stats = cookbook.statistics();
    println!();
    println!(
        "Plan: {} steps in {} recipes.",
        stats.total,
        stats.per_recipe.len()
    );
    Ok(())
}

async fn cmd_run(args: RunArgs) -> Result<(), String> {
    let mut cookbook = load(&args.selection)?;
    if let Some(mode) = args.mode {
        cookbook.set_mode(mode);
    }
    if let Some(journal) = &args.journal {
        let journal = std::path::absolute(journal)
            .map_err(|e| format!("cannot resolve {}: {}", journal.display(), e))?;
        cookbook.settings.journal = Some(journal);
    }
    cookbook
        .post_load(&args.overrides())
        .map_err(|e| e.to_string())?;

    let root = CancellationToken::new();
    let interrupt = root.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            interrupt.cancel();
        }
    });

    let report = cookbook.run(&root).await;
    watcher.abort();
    cookbook.close().await;

    print_report(&report, args.dry_run);
    let failed = report.recipes.iter().filter(|r| r.failed()).count();
    if failed > 0 {
        return Err(format!("{} recipe(s) failed", failed));
    }
    Ok(())
}

fn recipe_line(r: &RecipeReport) -> String {
    let mut line = format!(
        "{}: {} finished, {} skipped, {} cancelled, {} failed ({:.1}s)",
        r.recipe,
        r.count(StepStatus::Finished),
        r.count(StepStatus::Skipped),
        r.count(StepStatus::Cancelled),
        r.failures(),
        r.duration.as_secs_f64()
    );
    if r.interrupted {
        line.push_str(" INTERRUPTED");
    }
    line
}

/// Display a run report to stdout.
fn print_report(report: &RunReport, dry_run: bool) {
    for r in &report.recipes {
        println!("{}", recipe_line(r));
        if let Some(e) = &r.error {
            println!("  ERROR: {}", e);
        }
        for step in r.steps.iter().filter(|s| s.status.is_failure()) {
            println!(
                "  {} {} [{}]: {}",
                step.status,
                step.name,
                step.kind,
                step.error.as_deref().unwrap_or("")
            );
        }
    }

    println!();
    if dry_run {
        println!("Dry run: no changes applied.");
    }
    if report.failed() {
        println!(
            "Run completed with errors ({:.1}s).",
            report.duration.as_secs_f64()
        );
    } else {
        println!("Run complete ({:.1}s).", report.duration.as_secs_f64());
    }
}
