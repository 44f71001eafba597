//! taskpilot
//!
//! Runs the autonomous task controller with an operator console on stdin,
//! and offers task pool management subcommands against the same database.

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use std::sync::Arc;
use taskpilot::cli::operator::{HELP, OperatorCommand};
use taskpilot::cli::task::TaskCommand;
use taskpilot::cli::{ApprovalsArgs, Cli, Command, HistoryArgs, RunArgs};
use taskpilot::clock::{SystemClock, now_ms};
use taskpilot::config::Config;
use taskpilot::controller::{Collaborators, Controller, ControllerSettings};
use taskpilot::db::Database;
use taskpilot::events::{ControllerEvent, EventBus};
use taskpilot::executor::ProcessExecutor;
use taskpilot::format::{
    OutputFormat, format_action_log_markdown, format_approvals_markdown, format_controller_line,
    format_stats_markdown, format_task_markdown, format_tasks_markdown, render,
};
use taskpilot::logging::{self, LogTarget};
use taskpilot::risk::PatternClassifier;
use taskpilot::types::{ApprovalStatus, TaskStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    let (mut config, config_path) = Config::resolve(cli.config.as_deref())?;
    if let Some(path) = &config_path {
        info!(path = %path.display(), "Loaded configuration");
    }

    // CLI flags win over file and environment
    if let Some(db_path) = &cli.database {
        config.database.path = db_path.clone();
    }

    let format = OutputFormat::from_str(&cli.format)
        .ok_or_else(|| anyhow!("unknown output format '{}'", cli.format))?;

    config.ensure_db_dir()?;
    let db = Database::open(&config.database.path)?;
    debug!(path = %config.database.path.display(), "Opened database");

    match cli.command {
        Some(Command::Run(args)) => run_controller(config, db, args, format).await?,
        None => run_controller(config, db, RunArgs::default(), format).await?,
        Some(Command::Task(cmd)) => run_task_command(&db, cmd, format)?,
        Some(Command::Approvals(args)) => run_approvals(&db, args, format)?,
        Some(Command::History(args)) => run_history(&db, args, format)?,
    }

    Ok(())
}

async fn run_controller(
    mut config: Config,
    db: Database,
    args: RunArgs,
    format: OutputFormat,
) -> Result<()> {
    if let Some(program) = args.program {
        config.executor.program = program;
    }
    if let Some(timeout) = args.timeout {
        config.controller.execution_timeout_secs = timeout;
    }
    config.validate()?;

    let classifier = PatternClassifier::new(&config.risk.extra_rules)?;
    let bus = Arc::new(EventBus::new(config.controller.event_capacity));
    let parts = Collaborators {
        executor: Arc::new(ProcessExecutor::new(config.executor.clone())),
        classifier: Arc::new(classifier),
        events: bus.clone(),
        activity: Arc::new(db.clone()),
        clock: Arc::new(SystemClock),
    };
    let controller = Arc::new(Controller::new(
        db,
        parts,
        ControllerSettings::from_config(&config),
    )?);

    let shutdown = CancellationToken::new();
    let driver = tokio::spawn({
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        async move { controller.run(shutdown).await }
    });
    let event_log = tokio::spawn(log_events(bus.subscribe()));

    if !args.no_activate {
        controller.activate()?;
    }
    println!("{}", format_controller_line(&controller.snapshot()));

    operator_loop(&controller, format).await?;

    controller.deactivate().await?;
    shutdown.cancel();
    driver.await?;
    event_log.abort();
    Ok(())
}

/// Read operator commands until `stop`, EOF or Ctrl-C.
async fn operator_loop(controller: &Controller, format: OutputFormat) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<OperatorCommand>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        if command == OperatorCommand::Stop {
            break;
        }

        match handle_operator(controller, command, format).await {
            Ok(reply) => println!("{}", reply),
            Err(e) => eprintln!("error: {}", e),
        }
    }
    Ok(())
}

async fn handle_operator(
    controller: &Controller,
    command: OperatorCommand,
    format: OutputFormat,
) -> Result<String> {
    let acknowledge = |done: bool, what: &str| {
        if done {
            what.to_string()
        } else {
            format!("ignored: {} while {}", what, controller.status())
        }
    };

    let reply = match command {
        OperatorCommand::Status => render(format, &*controller.snapshot(), format_controller_line),
        OperatorCommand::Activate => acknowledge(controller.activate()?, "activate"),
        OperatorCommand::Deactivate => acknowledge(controller.deactivate().await?, "deactivate"),
        OperatorCommand::Pause => acknowledge(controller.pause()?, "pause"),
        OperatorCommand::Resume => acknowledge(controller.resume()?, "resume"),
        OperatorCommand::Approvals => {
            let pending = controller.pending_approvals()?;
            render(format, &pending, |p| format_approvals_markdown(p))
        }
        OperatorCommand::Approve(id) => match controller.approve_request(&id)? {
            Some(req) => format!("approved {} ({})", req.id, req.task_title),
            None => format!("no pending request {}", id),
        },
        OperatorCommand::Reject { id, reason } => {
            match controller.reject_request(&id, reason.as_deref())? {
                Some(req) => format!("rejected {} ({})", req.id, req.task_title),
                None => format!("no pending request {}", id),
            }
        }
        OperatorCommand::Cancel(task_id) => {
            if controller.cancel_task(&task_id).await {
                format!("cancelled {}", task_id)
            } else {
                format!("{} is not running", task_id)
            }
        }
        OperatorCommand::Help => HELP.to_string(),
        OperatorCommand::Stop => String::new(),
    };
    Ok(reply)
}

async fn log_events(mut rx: broadcast::Receiver<ControllerEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => debug!(event = event.name(), payload = %event.payload, "Controller event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn run_task_command(db: &Database, cmd: TaskCommand, format: OutputFormat) -> Result<()> {
    let now = now_ms();
    match cmd {
        TaskCommand::Add(args) => {
            let input = args.to_input(now).map_err(|e| anyhow!(e))?;
            let task = db.create_task(input, now)?;
            println!("{}", render(format, &task, format_task_markdown));
        }
        TaskCommand::List(args) => {
            let mut tasks = match &args.project {
                Some(project) => db.list_tasks_by_project(project)?,
                None => db.list_tasks()?,
            };
            if let Some(status) = &args.status {
                let status: TaskStatus = status.parse().map_err(|e: String| anyhow!(e))?;
                tasks.retain(|t| t.status == status);
            }
            println!("{}", render(format, &tasks, |t| format_tasks_markdown(t)));
        }
        TaskCommand::Show { id } => {
            let Some(task) = db.get_task(&id)? else {
                bail!("task not found: {}", id);
            };
            println!("{}", render(format, &task, format_task_markdown));
        }
        TaskCommand::Delete { id } => {
            if !db.delete_task(&id)? {
                bail!("task not found: {}", id);
            }
            println!("deleted {}", id);
        }
        TaskCommand::Stats { project } => {
            let stats = db.get_stats(project.as_deref(), now)?;
            println!("{}", render(format, &stats, format_stats_markdown));
        }
        TaskCommand::Depend(args) => {
            if args.remove {
                if !db.remove_dependency(&args.task_id, &args.depends_on, now)? {
                    bail!("{} does not depend on {}", args.task_id, args.depends_on);
                }
                println!("{} no longer waits for {}", args.task_id, args.depends_on);
            } else {
                db.add_dependency(&args.task_id, &args.depends_on, now)?;
                println!("{} now waits for {}", args.task_id, args.depends_on);
            }
        }
    }
    Ok(())
}

fn run_approvals(db: &Database, args: ApprovalsArgs, format: OutputFormat) -> Result<()> {
    let filter = (!args.all).then_some(ApprovalStatus::Pending);
    let requests = db.list_approvals(filter)?;
    println!(
        "{}",
        render(format, &requests, |r| format_approvals_markdown(r))
    );
    Ok(())
}

fn run_history(db: &Database, args: HistoryArgs, format: OutputFormat) -> Result<()> {
    let entries = match &args.task {
        Some(task_id) => db.action_log_for_task(task_id)?,
        None => db.list_action_log(args.limit)?,
    };
    println!(
        "{}",
        render(format, &entries, |e| format_action_log_markdown(e))
    );
    Ok(())
}
