mod config;

use clap::{Parser, Subcommand};
use emblem_core::{EmblemConfig, Message, Payload, Topic};
use emblem_orchestrator::{
    spawn_agent, standard_workers, Arbiter, Bus, MemoryAgent, PipelineScript, Planner,
};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "emblem", about = "Emblem: generate, review and refine emblem designs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "emblem.toml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one job against the stand-in workers and print its completion
    Run {
        /// Request text
        #[arg(short, long)]
        text: String,
        /// Reference image
        #[arg(short, long)]
        image: Option<String>,
        /// Round budget (overrides config)
        #[arg(short, long)]
        rounds: Option<u32>,
        /// Round from which the stand-in critics pass; 0 never passes
        #[arg(long, default_value_t = 1)]
        converge_at: u32,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let mut config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            text,
            image,
            rounds,
            converge_at,
        } => {
            if let Some(rounds) = rounds {
                config.planner.max_rounds = rounds;
                config.validate()?;
            }
            let script = match converge_at {
                0 => PipelineScript::never_converging(),
                n => PipelineScript::converging_at(n),
            };
            let report = run_job(&config, &script, text, image).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {
            print!("{}", config::render_config(&config)?);
        }
    }

    Ok(())
}

/// Upper bound on one job's run: every join of every round timing out.
fn job_deadline(config: &EmblemConfig) -> Duration {
    let joins = config.planner.max_rounds.saturating_mul(4).saturating_add(6);
    config.planner.required_timeout().saturating_mul(joins)
}

/// Wire the engine and the stand-in workers on one bus, submit a job and wait
/// for its completion or abort.
async fn run_job(
    config: &EmblemConfig,
    script: &PipelineScript,
    user_text: String,
    image_path: Option<String>,
) -> anyhow::Result<serde_json::Value> {
    let bus = Arc::new(Bus::with_config(config.bus.clone()));
    let planner = Arc::new(Planner::new(bus.clone(), config.planner.clone()));

    let mut handles = vec![
        spawn_agent(planner.clone()),
        spawn_agent(Arc::new(Arbiter::new(bus.clone(), config.arbiter.clone()))),
        spawn_agent(Arc::new(MemoryAgent::new(bus.clone()))),
    ];
    handles.extend(standard_workers(&bus, script));
    let reaper = planner.spawn_reaper(Duration::from_secs(1));

    let job_id = uuid::Uuid::new_v4().to_string();
    let mut errors = bus.observe(Topic::PipelineError);
    let completion = bus.expect(Topic::Completion, job_id.as_str());
    bus.publish(Message::new(
        job_id.as_str(),
        "cli",
        Payload::IntentRequest {
            user_text,
            image_path,
        },
    ));
    info!(job_id = %job_id, agents = handles.len(), "Job submitted");

    // Only a planner abort ends the job; worker failures surface as timeouts.
    let aborted = async {
        while let Some(msg) = errors.next().await {
            if msg.job_id != job_id {
                continue;
            }
            if let Payload::PipelineError { err, agent, .. } = msg.payload {
                if agent == "Planner" {
                    return err;
                }
                warn!(job_id = %job_id, agent = %agent, error = %err, "Worker failed");
            }
        }
        "error stream closed".to_string()
    };

    let deadline = job_deadline(config);
    let outcome = tokio::select! {
        done = completion.wait(deadline) => done.map_err(anyhow::Error::from),
        err = aborted => Err(anyhow::anyhow!("job {job_id} aborted: {err}")),
    };

    let report = match outcome {
        Ok(done) => Ok(serde_json::json!({
            "job_id": job_id,
            "completion": done.payload,
            "jobs": planner.monitor().to_json().await,
            "bus": bus.stats(),
        })),
        Err(e) => Err(e),
    };

    for handle in &handles {
        handle.abort();
    }
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    report
}
