use attractor::interviewer::{
    Answer, AutoApproveInterviewer, ConsoleInterviewer, Interviewer, QueueInterviewer,
};
use attractor::{
    apply_builtin_transforms, checkpoint_file_path, parse_dot, validate, Checkpoint, Diagnostic,
    EngineConfig, Event, EventSink, PipelineEngine, SharedEventObserver, Severity, StageStatus,
};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "attractor")]
#[command(about = "Execute DOT pipeline graphs", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline from a DOT file.
    Run(RunArgs),
    /// Resume a pipeline from a checkpoint file.
    Resume(ResumeArgs),
    /// Validate a DOT file and print diagnostics without executing.
    Validate(ValidateArgs),
    /// Print the contents of a checkpoint file.
    InspectCheckpoint(InspectCheckpointArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to the .dot pipeline definition.
    dot_file: PathBuf,
    #[arg(long)]
    logs_root: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    #[arg(long, default_value_t = 1000)]
    max_steps: u32,
    #[arg(long = "no-checkpoint", action = ArgAction::SetTrue)]
    no_checkpoint: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long, value_enum, default_value_t = InterviewerMode::Auto)]
    interviewer: InterviewerMode,
    /// Pre-filled answers for the queue interviewer; repeatable.
    #[arg(long = "human-answer")]
    human_answers: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct ResumeArgs {
    dot_file: PathBuf,
    /// Checkpoint to resume from; defaults to <logs-root>/checkpoint.json.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    logs_root: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long, value_enum, default_value_t = InterviewerMode::Auto)]
    interviewer: InterviewerMode,
    #[arg(long = "human-answer")]
    human_answers: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    dot_file: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct InspectCheckpointArgs {
    checkpoint: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InterviewerMode {
    Auto,
    Console,
    Queue,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Resume(args) => resume_command(args).await,
        Commands::Validate(args) => validate_command(args),
        Commands::InspectCheckpoint(args) => inspect_checkpoint_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(2)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let dot_source = std::fs::read_to_string(&args.dot_file)?;
    let config = EngineConfig {
        logs_root: args.logs_root.clone(),
        dry_run: args.dry_run,
        max_steps: args.max_steps,
        checkpoint_enabled: !args.no_checkpoint,
        interviewer: Some(build_interviewer(args.interviewer, &args.human_answers)),
        event_sink: EventSink::with_observer(event_printer(args.event_json)),
        ..EngineConfig::default()
    };

    let engine = PipelineEngine::new(config);
    let result = engine.run_dot(&dot_source).await?;

    print_summary(result.outcome.status, &result.completed_nodes);
    Ok(exit_code_for(result.outcome.status))
}

async fn resume_command(args: ResumeArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let dot_source = std::fs::read_to_string(&args.dot_file)?;
    let mut graph = parse_dot(&dot_source)?;
    apply_builtin_transforms(&mut graph)?;

    let checkpoint_path = match (&args.checkpoint, &args.logs_root) {
        (Some(path), _) => path.clone(),
        (None, Some(root)) => checkpoint_file_path(root),
        (None, None) => return Err("resume requires --checkpoint or --logs-root".into()),
    };
    let checkpoint = Checkpoint::load(&checkpoint_path)?;

    let config = EngineConfig {
        logs_root: args.logs_root.clone(),
        interviewer: Some(build_interviewer(args.interviewer, &args.human_answers)),
        event_sink: EventSink::with_observer(event_printer(args.event_json)),
        ..EngineConfig::default()
    };
    let engine = PipelineEngine::new(config);
    let result = engine.run_with_resume(&graph, Some(checkpoint)).await?;

    print_summary(result.outcome.status, &result.completed_nodes);
    Ok(exit_code_for(result.outcome.status))
}

fn validate_command(args: ValidateArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let dot_source = std::fs::read_to_string(&args.dot_file)?;
    let mut graph = parse_dot(&dot_source)?;
    apply_builtin_transforms(&mut graph)?;
    let diagnostics = validate(&graph, &[]);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    } else if diagnostics.is_empty() {
        println!("ok: no findings");
    } else {
        for diagnostic in &diagnostics {
            print_diagnostic(diagnostic);
        }
    }

    let has_errors = diagnostics.iter().any(Diagnostic::is_error);
    Ok(if has_errors {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn inspect_checkpoint_command(
    args: InspectCheckpointArgs,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let checkpoint = Checkpoint::load(&args.checkpoint)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
    } else {
        println!("current_node: {}", checkpoint.current_node);
        println!("completed_nodes: {}", checkpoint.completed_nodes.join(", "));
        println!("context entries: {}", checkpoint.context_values.len());
        println!("log lines: {}", checkpoint.logs.len());
        for (node_id, retries) in &checkpoint.node_retries {
            println!("retries[{node_id}]: {retries}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn build_interviewer(mode: InterviewerMode, human_answers: &[String]) -> Arc<dyn Interviewer> {
    match mode {
        InterviewerMode::Auto => Arc::new(AutoApproveInterviewer),
        InterviewerMode::Console => Arc::new(ConsoleInterviewer),
        InterviewerMode::Queue => Arc::new(QueueInterviewer::new(
            human_answers
                .iter()
                .map(|answer| Answer::Selected(answer.clone())),
        )),
    }
}

fn event_printer(as_json: bool) -> SharedEventObserver {
    Arc::new(move |event: &Event| {
        if as_json {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{line}");
            }
        } else {
            let node = event.node_id.as_deref().unwrap_or("-");
            println!("[{:>4}] {:<18} {}", event.sequence_no, event.kind.as_str(), node);
        }
    })
}

fn print_diagnostic(diagnostic: &Diagnostic) {
    let severity = match diagnostic.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    };
    let location = diagnostic
        .node_id
        .as_deref()
        .map(|node_id| format!(" node={node_id}"))
        .or_else(|| {
            diagnostic
                .edge
                .as_ref()
                .map(|(from, to)| format!(" edge={from}->{to}"))
        })
        .unwrap_or_default();
    println!(
        "{severity}[{}]{location}: {}",
        diagnostic.rule, diagnostic.message
    );
}

fn print_summary(status: StageStatus, completed_nodes: &[String]) {
    println!(
        "pipeline finished: {} ({} nodes completed)",
        status.as_str(),
        completed_nodes.len()
    );
}

fn exit_code_for(status: StageStatus) -> ExitCode {
    if status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
