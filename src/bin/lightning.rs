//! Lightning command-line entry point
//!
//! Plan generation, validation, execution, and plan-application management
//! against the configured providers. Exits 0 on success, 1 on validation or
//! I/O failure.

use clap::{Parser, Subcommand};
use lightning_runtime::instruction::{InstructionProcessor, Planner};
use lightning_runtime::plan::{validate_plan_value, ValidationContext};
use lightning_runtime::provider::{Document, DocumentStore, StorageProvider};
use lightning_runtime::registry::PlannerTool;
use lightning_runtime::{factory, LightningRuntime, Result, RuntimeConfig, RuntimeError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

const PLAN_APPS_CONTAINER: &str = "plan_apps";

#[derive(Debug, Parser)]
#[command(
    name = "lightning",
    about = "Event-driven orchestration runtime: plans, validation, and plan applications",
    version
)]
struct Cli {
    /// Path to a JSON config file (defaults + LIGHTNING_* env apply)
    #[arg(long, env = "LIGHTNING_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a plan from a natural-language instruction
    Generate {
        instruction: String,

        /// Write the generated plan to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, default_value = "default")]
        user: String,
    },

    /// Validate a plan file
    Validate {
        plan_file: PathBuf,
    },

    /// Validate a plan file and emit a plan.execute event
    Execute {
        plan_file: PathBuf,

        #[arg(short, long, default_value = "default")]
        user: String,
    },

    /// Validate a plan file and emit a plan.setup event
    Setup {
        plan_file: PathBuf,

        #[arg(short, long, default_value = "default")]
        user: String,
    },

    /// List available tools
    ListTools,

    /// List available external events
    ListEvents,

    /// Register a plan as a first-class application
    RegisterApp {
        plan_file: PathBuf,

        #[arg(short, long, default_value = "default")]
        user: String,
    },

    /// Unregister a plan application
    UnregisterApp {
        plan_id: String,
    },

    /// List all registered plan applications
    ListApps,

    /// Show a registered plan application
    ShowApp {
        plan_id: String,
    },
}

/// Deterministic template planner used when no LLM planner is wired in.
/// Real deployments register a model-backed `Planner` through the library.
struct TemplatePlanner;

#[async_trait::async_trait]
impl Planner for TemplatePlanner {
    async fn generate_plan(
        &self,
        prompt: &str,
        registry_subset: &HashMap<String, PlannerTool>,
        _model: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<serde_json::Value> {
        // Pick the summarize tool when available, else any planner tool
        let (action, tool) = registry_subset
            .get_key_value("llm.summarize")
            .or_else(|| registry_subset.iter().next())
            .ok_or_else(|| RuntimeError::Planner("no planner tools registered".to_string()))?;

        let args: serde_json::Map<String, serde_json::Value> = tool
            .inputs
            .keys()
            .map(|input| (input.clone(), serde_json::json!(format!("<{}>", input))))
            .collect();

        let slug: String = prompt
            .lines()
            .next()
            .unwrap_or("plan")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .take(6)
            .collect::<Vec<_>>()
            .join("-");

        Ok(serde_json::json!({
            "plan": {
                "plan_name": slug,
                "graph_type": "reactive",
                "events": [{"name": "event.manual.trigger", "kind": "manual"}],
                "steps": [
                    {
                        "name": "run",
                        "on": ["event.manual.trigger"],
                        "action": action,
                        "args": args,
                        "emits": ["event.plan.finished"]
                    }
                ]
            },
            "summary": "Template plan; refine with a model-backed planner."
        }))
    }
}

fn load_plan_file(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        RuntimeError::Config(format!("Failed to read plan file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&text).map_err(Into::into)
}

async fn validate_file(path: &Path) -> Result<serde_json::Value> {
    let plan = load_plan_file(path)?;
    let report = validate_plan_value(&plan, &ValidationContext::global()).await?;
    for warning in report.warnings() {
        eprintln!("warning ({}): {}", warning.name, warning.message);
    }
    let name = plan
        .get("plan_name")
        .and_then(|v| v.as_str())
        .unwrap_or("<unnamed>");
    println!("Plan '{}' validated successfully", name);
    Ok(plan)
}

fn app_store(config: &RuntimeConfig) -> Result<(Arc<dyn StorageProvider>, Arc<dyn DocumentStore>)> {
    let provider = factory::global().create_storage_provider(config)?;
    let store = provider.document_store(PLAN_APPS_CONTAINER)?;
    Ok((provider, store))
}

async fn run(cli: Cli) -> Result<()> {
    let config = RuntimeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Generate { instruction, output, user } => {
            let ctx = ValidationContext::global();
            let processor = InstructionProcessor::new(
                Arc::new(TemplatePlanner),
                Arc::new(lightning_runtime::MemoryPlanStore::new()),
                ctx,
            );
            let record = lightning_runtime::InstructionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                name: instruction.clone(),
                description: None,
                trigger: lightning_runtime::InstructionTrigger {
                    event_type: "manual".to_string(),
                    providers: vec![],
                    conditions: serde_json::json!({}),
                },
                action: lightning_runtime::InstructionAction {
                    action_type: "generic".to_string(),
                    config: serde_json::json!({}),
                },
                enabled: true,
            };
            let plan_id = processor.generate_and_store(&record, &user).await?;
            let stored = processor
                .plan_store()
                .get(&plan_id)
                .await?
                .ok_or_else(|| RuntimeError::NotFound(format!("Plan not found: {}", plan_id)))?;
            let rendered = serde_json::to_string_pretty(&stored.plan)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered).map_err(|e| {
                        RuntimeError::Config(format!(
                            "Failed to write plan file {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    println!("Plan written to {}", path.display());
                }
                None => println!("{}", rendered),
            }
        }

        Command::Validate { plan_file } => {
            validate_file(&plan_file).await?;
        }

        Command::Execute { plan_file, user } => {
            let plan = validate_file(&plan_file).await?;
            let runtime = LightningRuntime::builder(config).build()?;
            runtime.start().await?;
            runtime.emit_plan_execute(&plan, &user).await?;
            println!("Emitted plan.execute for user {}", user);
            runtime.shutdown().await?;
        }

        Command::Setup { plan_file, user } => {
            let plan = validate_file(&plan_file).await?;
            let runtime = LightningRuntime::builder(config).build()?;
            runtime.start().await?;
            runtime.emit_plan_setup(&plan, &user).await?;
            println!("Emitted plan.setup for user {}", user);
            runtime.shutdown().await?;
        }

        Command::ListTools => {
            let registry = lightning_runtime::registry::tools::global();
            for tool in registry.list(None, None, None) {
                let inputs = tool
                    .inputs
                    .as_ref()
                    .map(|inputs| {
                        let mut pairs: Vec<String> =
                            inputs.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
                        pairs.sort();
                        pairs.join(", ")
                    })
                    .unwrap_or_default();
                println!("{:<24} {:<48} ({})", tool.id, tool.description, inputs);
            }
        }

        Command::ListEvents => {
            let registry = lightning_runtime::registry::events::global();
            for event in registry.external_events() {
                let kind = event.kind.map(|k| k.as_str()).unwrap_or("-");
                let schedule = event.schedule_pattern.as_deref().unwrap_or("");
                println!("{:<28} {:<14} {}", event.name, kind, schedule);
            }
        }

        Command::RegisterApp { plan_file, user } => {
            let plan = validate_file(&plan_file).await?;
            let (provider, store) = app_store(&config)?;
            provider
                .create_container_if_not_exists(PLAN_APPS_CONTAINER, "/partition_key")
                .await?;
            let document = Document::new(serde_json::json!({
                "plan": plan,
                "user_id": user,
            }));
            let created = store.create(document).await?;
            println!("Registered plan application {}", created.id);
        }

        Command::UnregisterApp { plan_id } => {
            let (_provider, store) = app_store(&config)?;
            if store.delete(&plan_id, None).await? {
                println!("Unregistered plan application {}", plan_id);
            } else {
                return Err(RuntimeError::NotFound(format!(
                    "Plan application not found: {}",
                    plan_id
                )));
            }
        }

        Command::ListApps => {
            let (_provider, store) = app_store(&config)?;
            for doc in store.list_all(None, None).await? {
                let name = doc
                    .data
                    .pointer("/plan/plan_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<unnamed>");
                let user = doc
                    .data
                    .get("user_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-");
                println!("{}  {:<32} user={}", doc.id, name, user);
            }
        }

        Command::ShowApp { plan_id } => {
            let (_provider, store) = app_store(&config)?;
            let doc = store.read(&plan_id, None).await?.ok_or_else(|| {
                RuntimeError::NotFound(format!("Plan application not found: {}", plan_id))
            })?;
            println!("{}", serde_json::to_string_pretty(&doc.data)?);
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
