use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use foreman::automaton::host::TmuxHost;
use foreman::automaton::session::ClaudeTranscripts;
use foreman::config::Config;
use foreman::credentials::EnvCredentials;
use foreman::persist::FileKv;
use foreman::store::BeadsCli;
use foreman::{
    BranchStrategy, Error, NewPlan, Orchestrator, OrchestratorEvent, Plan, PlanId, PlanStatus,
    Result, Services,
};

/// foreman - runs a plan of tasks through parallel AI coding agents
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.foreman/foreman.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create, inspect and drive plans
    #[command(subcommand)]
    Plan(PlanCommand),

    /// Show the dependency graph of a plan's tasks
    Graph {
        plan: String,

        /// Print the graph as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a plan's activity log
    Activities { plan: String },

    /// Resume every running plan and keep dispatching until Ctrl-C
    Run,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Create a new plan
    Create {
        title: String,

        #[arg(long)]
        description: Option<String>,

        /// Repository id to work in (repeatable; default: all configured)
        #[arg(long = "repo")]
        repos: Vec<String>,

        /// Maximum number of agents working at once
        #[arg(long)]
        max_agents: Option<usize>,

        /// feature_branch or raise_prs
        #[arg(long, default_value = "feature_branch")]
        strategy: String,
    },

    /// List all plans
    List,

    /// Show one plan
    Show {
        plan: String,

        #[arg(long)]
        json: bool,
    },

    /// Start discussing a draft plan with an agent
    Discuss {
        plan: String,

        #[arg(long, default_value = "claude")]
        agent: String,
    },

    /// Approve the discussion and record its outcome
    Approve {
        plan: String,

        #[arg(long)]
        summary: Option<String>,
    },

    /// Abandon the discussion and return to draft
    Reject { plan: String },

    /// Hand the plan to its agents and dispatch tasks until Ctrl-C
    Execute {
        plan: String,

        #[arg(long, default_value = "claude")]
        agent: String,
    },

    /// Stop a running plan
    Cancel { plan: String },

    /// Reset a failed plan
    Restart { plan: String },

    /// Accept a plan whose tasks are all done
    Complete { plan: String },

    /// Delete a plan with its worktrees and records
    Delete { plan: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    foreman::log::init_with_debug(cli.debug);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    let config = Config::load()?;
    let orch = orchestrator(config)?;

    match command {
        Command::Plan(cmd) => run_plan(&orch, cmd).await,
        Command::Graph { plan, json } => run_graph(&orch, &plan, json).await,
        Command::Activities { plan } => {
            let id = resolve_plan(&orch, &plan).await?;
            for activity in orch.activities(&id)? {
                println!(
                    "{}  {:<8} {}",
                    activity.created_at.format("%Y-%m-%d %H:%M:%S"),
                    activity.kind,
                    activity.message
                );
            }
            Ok(())
        }
        Command::Run => {
            let resumed = orch.recover().await?;
            println!("Dispatching for {} plan(s). Press Ctrl-C to stop.", resumed.len());
            follow(&orch, None).await;
            orch.shutdown().await;
            Ok(())
        }
    }
}

/// Production collaborators: tmux, the `bd` CLI and on-disk records.
fn orchestrator(config: Config) -> Result<Orchestrator> {
    let data_root = config.data_root()?;
    let services = Services {
        kv: Arc::new(FileKv::new(&data_root.join("state"))?),
        tasks: Arc::new(BeadsCli::default()),
        host: Arc::new(TmuxHost::new(config.automaton.capture_interval())),
        credentials: Arc::new(EnvCredentials::new(
            config.credential_env.clone(),
            config.login_command.clone(),
        )),
        records: Arc::new(ClaudeTranscripts::from_home()?),
    };
    Ok(Orchestrator::new(config, data_root, services))
}

async fn run_plan(orch: &Orchestrator, cmd: PlanCommand) -> Result<()> {
    match cmd {
        PlanCommand::Create {
            title,
            description,
            repos,
            max_agents,
            strategy,
        } => {
            let plan = orch
                .create_plan(NewPlan {
                    title,
                    description,
                    repository_ids: repos,
                    max_parallel_agents: max_agents,
                    branch_strategy: strategy.parse::<BranchStrategy>()?,
                })
                .await?;
            println!("Created plan {} ({})", plan.id.short(), plan.title);
            Ok(())
        }
        PlanCommand::List => {
            let plans = orch.list_plans().await?;
            if plans.is_empty() {
                println!("No plans.");
            }
            for plan in plans {
                println!(
                    "{}  {:<28} {}",
                    plan.id.short(),
                    format_status(plan.status),
                    plan.title
                );
            }
            Ok(())
        }
        PlanCommand::Show { plan, json } => {
            let id = resolve_plan(orch, &plan).await?;
            let plan = orch.get_plan(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
            Ok(())
        }
        PlanCommand::Discuss { plan, agent } => {
            let id = resolve_plan(orch, &plan).await?;
            let plan = orch.start_discussion(&id, &agent).await?;
            println!("Discussion for {} is {}.", plan.id.short(), plan.status);
            println!("Attach with: tmux attach -t foreman-{}-discussion", plan.id.short());
            follow(orch, Some(id)).await;
            Ok(())
        }
        PlanCommand::Approve { plan, summary } => {
            let id = resolve_plan(orch, &plan).await?;
            let plan = orch.complete_discussion(&id, summary).await?;
            println!("Plan {} is {}", plan.id.short(), format_status(plan.status));
            Ok(())
        }
        PlanCommand::Reject { plan } => {
            let id = resolve_plan(orch, &plan).await?;
            let plan = orch.cancel_discussion(&id).await?;
            println!("Plan {} is {}", plan.id.short(), format_status(plan.status));
            Ok(())
        }
        PlanCommand::Execute { plan, agent } => {
            let id = resolve_plan(orch, &plan).await?;
            let plan = orch.execute_plan(&id, &agent).await?;
            println!(
                "Plan {} is {}. Press Ctrl-C to stop dispatching.",
                plan.id.short(),
                format_status(plan.status)
            );
            follow(orch, Some(id)).await;
            orch.shutdown().await;
            Ok(())
        }
        PlanCommand::Cancel { plan } => {
            let id = resolve_plan(orch, &plan).await?;
            let plan = orch.cancel_plan(&id).await?;
            // Let the worktree cleanup finish before the process exits.
            orch.context().await_cleanup(&id).await;
            println!("Plan {} is {}", plan.id.short(), format_status(plan.status));
            Ok(())
        }
        PlanCommand::Restart { plan } => {
            let id = resolve_plan(orch, &plan).await?;
            let plan = orch.restart_plan(&id).await?;
            println!("Plan {} is {}", plan.id.short(), format_status(plan.status));
            Ok(())
        }
        PlanCommand::Complete { plan } => {
            let id = resolve_plan(orch, &plan).await?;
            let plan = orch.complete_plan(&id).await?;
            println!("Plan {} is {}", plan.id.short(), format_status(plan.status));
            Ok(())
        }
        PlanCommand::Delete { plan } => {
            let id = resolve_plan(orch, &plan).await?;
            orch.delete_plan(&id).await?;
            println!("Deleted plan {}", id.short());
            Ok(())
        }
    }
}

async fn run_graph(orch: &Orchestrator, plan: &str, json: bool) -> Result<()> {
    let id = resolve_plan(orch, plan).await?;
    let graph = orch.graph(&id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&graph)?);
        return Ok(());
    }
    if graph.is_empty() {
        println!("No tasks yet.");
        return Ok(());
    }

    let mut nodes: Vec<_> = graph.nodes.iter().collect();
    nodes.sort_by_key(|n| (n.depth.unwrap_or(usize::MAX), n.id.clone()));
    for node in nodes {
        let depth = node.depth.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string());
        let marker = if node.is_on_critical_path { "*" } else { " " };
        println!(
            "{} [{:>2}] {:<12} {:<12} {}",
            marker, depth, node.id, node.status, node.title
        );
        if !node.blocked_by.is_empty() {
            println!("           blocked by {}", node.blocked_by.join(", "));
        }
    }
    let s = graph.stats;
    println!();
    println!(
        "{} tasks: {} completed, {} in progress, {} sent, {} ready, {} blocked, {} failed",
        s.total, s.completed, s.in_progress, s.sent, s.ready, s.blocked, s.failed
    );
    if !graph.critical_path.is_empty() {
        println!("Critical path: {}", graph.critical_path.join(" -> "));
    }
    if graph.has_cycle {
        println!("Warning: the task dependencies contain a cycle");
    }
    Ok(())
}

/// Accept a full plan id or a unique prefix of one.
async fn resolve_plan(orch: &Orchestrator, arg: &str) -> Result<PlanId> {
    if let Ok(id) = arg.parse::<PlanId>() {
        return Ok(id);
    }
    let matches: Vec<PlanId> = orch
        .list_plans()
        .await?
        .into_iter()
        .filter(|p| p.id.to_string().starts_with(arg))
        .map(|p| p.id)
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(Error::Validation(format!("no plan matches '{}'", arg))),
        _ => Err(Error::Validation(format!(
            "'{}' matches {} plans",
            arg,
            matches.len()
        ))),
    }
}

/// Print activities as they happen until Ctrl-C, or until the followed plan
/// settles.
async fn follow(orch: &Orchestrator, plan: Option<PlanId>) {
    let mut events = orch.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(OrchestratorEvent::ActivityAdded { plan_id, activity }) => {
                    if plan.map_or(true, |p| p == plan_id) {
                        println!("[{}] {:<8} {}", plan_id.short(), activity.kind, activity.message);
                    }
                }
                Ok(OrchestratorEvent::PlanUpdated(updated)) => {
                    if plan == Some(updated.id) && settled(updated.status) {
                        println!("Plan {} is {}", updated.id.short(), format_status(updated.status));
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn settled(status: PlanStatus) -> bool {
    matches!(
        status,
        PlanStatus::Draft | PlanStatus::Discussed | PlanStatus::Completed | PlanStatus::Failed
    )
}

fn print_plan(plan: &Plan) {
    println!("  ID:          {}", plan.id);
    println!("  Title:       {}", plan.title);
    if let Some(description) = &plan.description {
        println!("  Description: {}", description);
    }
    println!("  Status:      {}", format_status(plan.status));
    println!("  Strategy:    {}", plan.branch_strategy);
    if let Some(branch) = &plan.feature_branch {
        println!("  Branch:      {}", branch);
    }
    println!("  Max agents:  {}", plan.max_parallel_agents);
    if !plan.repository_ids.is_empty() {
        println!("  Repos:       {}", plan.repository_ids.join(", "));
    }
    if let Some(discussion) = &plan.discussion {
        println!(
            "  Discussion:  {} ({})",
            if discussion.approved { "approved" } else { "open" },
            discussion.agent_profile
        );
        if let Some(summary) = &discussion.summary {
            println!("  Summary:     {}", summary);
        }
    }
    let active = plan.active_worktrees().count();
    println!("  Worktrees:   {} active, {} total", active, plan.worktrees.len());
    if let Some(error) = &plan.last_error {
        println!("  Last error:  {}", error);
    }
    println!("  Created:     {}", plan.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Updated:     {}", plan.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
}

fn format_status(status: PlanStatus) -> String {
    match status {
        PlanStatus::Completed => format!("\x1b[32m{}\x1b[0m", status),
        PlanStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),
        PlanStatus::Delegating | PlanStatus::InProgress => format!("\x1b[33m{}\x1b[0m", status),
        PlanStatus::ReadyForReview => format!("\x1b[36m{}\x1b[0m", status),
        PlanStatus::Discussing | PlanStatus::Discussed => format!("\x1b[34m{}\x1b[0m", status),
        PlanStatus::Draft => format!("\x1b[90m{}\x1b[0m", status),
    }
}
