use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use debate_core::{
    ConfigError, KnownVariants, OutcomeCode, PlanEntry, ResultRecord, Variant,
    DEFAULT_MODELS_PATH, DEFAULT_SETTINGS_PATH,
};
use debate_log::{init_logging, LogConfig, LogConfigError, LoggingOptions, SYSTEM};
use debate_runner::{
    build_plan, execute_plan, ExecuteOptions, PlanError, ProcessInvoker, RunSummary,
};
use debate_store::{ResultStore, StoreError, DEFAULT_TABLE_PATH};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "debate-batch",
    version,
    about = "Run batches of debates across helper types and collect their results"
)]
struct Cli {
    /// YAML file describing the structured log channels.
    #[arg(long, global = true)]
    log_config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute one debate process per (helper type, claim) entry.
    Run {
        #[arg(long, visible_alias = "helper_types", num_args = 1..)]
        helper_types: Vec<String>,
        #[arg(long, visible_alias = "claim_indexes", num_args = 1..)]
        claim_indexes: Vec<u32>,
        #[arg(long, visible_alias = "settings_path", default_value = DEFAULT_SETTINGS_PATH)]
        settings_path: PathBuf,
        #[arg(long, visible_alias = "models_path", default_value = DEFAULT_MODELS_PATH)]
        models_path: PathBuf,
        /// List available helper types and exit.
        #[arg(long, visible_alias = "list_helpers")]
        list_helpers: bool,
        /// Run each requested claim index as its own process.
        #[arg(long)]
        sequential: bool,
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Debate program and its leading arguments; repeat per token.
        #[arg(long = "command", allow_hyphen_values = true)]
        command: Vec<String>,
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List the helper types declared in the settings file.
    ListHelpers {
        #[arg(long, visible_alias = "settings_path", default_value = DEFAULT_SETTINGS_PATH)]
        settings_path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Append one debate result to the shared results table.
    Record {
        #[arg(long, default_value = DEFAULT_TABLE_PATH)]
        table: PathBuf,
        #[arg(long)]
        topic_id: String,
        #[arg(long)]
        claim: String,
        #[arg(long)]
        helper_type: String,
        /// 1 = convinced, 0 = not convinced, 2 = other.
        #[arg(long)]
        result: u8,
        #[arg(long)]
        rounds: u32,
        #[arg(long)]
        chat_id: String,
        #[arg(long, default_value_t = 30)]
        lock_timeout_secs: u64,
        #[arg(long)]
        json: bool,
    },
}

struct CommandOutput {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutput {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }

    fn json(payload: Value, exit_code: i32) -> Self {
        Self {
            payload: Some(payload),
            exit_code,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_command = json_command_name(&cli.command);
    let outcome =
        setup_logging(cli.log_config.as_deref()).and_then(|()| run_command(cli.command));

    match outcome {
        Ok(output) => {
            if let Some(payload) = output.payload {
                emit_json(&payload);
            }
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
            Ok(())
        }
        Err(err) => match json_command {
            Some(command) => {
                emit_json(&failure_payload(command, &err));
                std::process::exit(1);
            }
            None => Err(err),
        },
    }
}

fn setup_logging(log_config: Option<&Path>) -> Result<()> {
    let multiplexer = match log_config {
        Some(path) => {
            let config = LogConfig::load(path)?;
            let base_dir = std::env::current_dir()?;
            Some(Arc::new(config.build(&base_dir)?))
        }
        None => None,
    };
    init_logging(LoggingOptions {
        multiplexer,
        ..LoggingOptions::default()
    });
    Ok(())
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run {
            helper_types,
            claim_indexes,
            settings_path,
            models_path,
            list_helpers,
            sequential,
            concurrency,
            command,
            workdir,
            json,
        } => {
            if list_helpers {
                return list_helper_types(&settings_path, json);
            }
            let known = KnownVariants::load(&settings_path)?;
            if helper_types.is_empty() && !json {
                println!(
                    "No helper types specified, using all available: {:?}",
                    known.names()
                );
            }
            let plan = build_plan(
                non_empty(&helper_types),
                non_empty(&claim_indexes),
                &known,
                sequential,
            )?;
            if !json {
                print_plan(&plan);
            }

            let mut invoker = if command.is_empty() {
                ProcessInvoker::default()
            } else {
                ProcessInvoker::new(command)
            };
            invoker = invoker.settings_path(settings_path).models_path(models_path);
            if let Some(dir) = workdir {
                invoker = invoker.workdir(dir);
            }
            let options = ExecuteOptions {
                concurrency,
                ..ExecuteOptions::default()
            };
            debug!(
                msg_type = SYSTEM,
                entries = plan.len(),
                concurrency = options.concurrency,
                "Executing plan"
            );
            let summary = execute_plan(&plan, &invoker, &options);
            if json {
                return Ok(CommandOutput::json(
                    json!({
                        "ok": summary.all_succeeded(),
                        "command": "run",
                        "plan": plan.iter().map(plan_entry_to_json).collect::<Vec<_>>(),
                        "summary": summary_to_json(&summary),
                    }),
                    summary.exit_code(),
                ));
            }
            print_summary(&summary);
            Ok(CommandOutput {
                payload: None,
                exit_code: summary.exit_code(),
            })
        }
        Commands::ListHelpers {
            settings_path,
            json,
        } => list_helper_types(&settings_path, json),
        Commands::Record {
            table,
            topic_id,
            claim,
            helper_type,
            result,
            rounds,
            chat_id,
            lock_timeout_secs,
            json,
        } => {
            let outcome = OutcomeCode::try_from(result)
                .map_err(|e| anyhow!(e))
                .context("invalid --result")?;
            let record = ResultRecord {
                topic_id,
                claim_text: claim,
                variant: Variant::new(helper_type),
                outcome,
                rounds,
                run_id: chat_id,
            };
            let store =
                ResultStore::new(table.clone()).with_lock_timeout(Duration::from_secs(lock_timeout_secs));
            store
                .append(&record)
                .with_context(|| format!("failed to record debate {}", record.run_id))?;
            if json {
                return Ok(CommandOutput::json(
                    json!({
                        "ok": true,
                        "command": "record",
                        "table": table.display().to_string(),
                        "chat_id": record.run_id,
                    }),
                    0,
                ));
            }
            println!("recorded: {} -> {}", record.run_id, table.display());
            Ok(CommandOutput::done())
        }
    }
}

fn list_helper_types(settings_path: &Path, json: bool) -> Result<CommandOutput> {
    let known = KnownVariants::load(settings_path)?;
    if json {
        return Ok(CommandOutput::json(
            json!({
                "ok": true,
                "command": "list-helpers",
                "helper_types": known.names(),
            }),
            0,
        ));
    }
    println!("Available helper types:");
    for name in known.names() {
        println!("  - {}", name);
    }
    Ok(CommandOutput::done())
}

fn non_empty<T>(values: &[T]) -> Option<&[T]> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn print_plan(plan: &[PlanEntry]) {
    println!();
    println!("Planning to run {} debate configurations:", plan.len());
    for (i, entry) in plan.iter().enumerate() {
        println!("  {}. {} - {}", i + 1, entry.variant, entry.claim_label());
    }
    println!();
    println!("Starting runs...");
}

fn print_summary(summary: &RunSummary) {
    let rule = "=".repeat(50);
    println!();
    println!("{}", rule);
    println!("SUMMARY");
    println!("{}", rule);
    println!("Total runs: {}", summary.total);
    println!("Successful: {}", summary.succeeded);
    println!("Failed: {}", summary.failed);
    println!("Time elapsed: {:.1} seconds", summary.elapsed.as_secs_f64());
    if summary.all_succeeded() {
        println!("All runs completed successfully!");
    } else {
        for failure in &summary.failures {
            println!("  failed: {} ({})", failure.entry, failure.reason);
        }
    }
}

/// One JSON document per line on stdout; diagnostics stay on stderr.
fn emit_json(value: &Value) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let written = serde_json::to_writer(&mut out, value)
        .map_err(std::io::Error::from)
        .and_then(|()| writeln!(out));
    if let Err(e) = written {
        eprintln!("debate-batch: cannot write JSON output: {}", e);
    }
}

/// Maps the failure onto a stable code a calling script can branch on.
fn failure_code(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<PlanError>() {
            return match e {
                PlanError::UnknownVariant { .. } => "unknown_helper_type",
                PlanError::NoVariants => "no_helper_types",
            };
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return "settings_invalid";
        }
        if cause.downcast_ref::<LogConfigError>().is_some() {
            return "log_config_invalid";
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return match e {
                StoreError::LockTimeout { .. } => "table_lock_timeout",
                _ => "table_write_failed",
            };
        }
    }
    "command_failed"
}

fn failure_payload(command: &str, err: &anyhow::Error) -> Value {
    json!({
        "ok": false,
        "command": command,
        "error": {
            "code": failure_code(err),
            "message": err.to_string(),
            "causes": err.chain().skip(1).map(|c| c.to_string()).collect::<Vec<_>>(),
        }
    })
}

/// Subcommand name when `--json` was requested.
fn json_command_name(command: &Commands) -> Option<&'static str> {
    match command {
        Commands::Run { json: true, .. } => Some("run"),
        Commands::ListHelpers { json: true, .. } => Some("list-helpers"),
        Commands::Record { json: true, .. } => Some("record"),
        _ => None,
    }
}

fn plan_entry_to_json(entry: &PlanEntry) -> Value {
    json!({
        "helper_type": entry.variant.as_str(),
        "claim_index": entry.sub_index,
    })
}

fn summary_to_json(summary: &RunSummary) -> Value {
    json!({
        "total": summary.total,
        "succeeded": summary.succeeded,
        "failed": summary.failed,
        "elapsed_secs": summary.elapsed.as_secs_f64(),
        "failures": summary.failures.iter().map(|f| json!({
            "helper_type": f.entry.variant.as_str(),
            "claim_index": f.entry.sub_index,
            "reason": f.reason,
        })).collect::<Vec<_>>(),
    })
}
