use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tabled::{Table, Tabled};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::LocalSet;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cirrus_model::{
    Action, AdminClient, BulkRequest, CollectionEvent, Context, EntityEvent, Envelope,
    FetchOptions, Kind, MachineView, ModelConfig, Pane, ViewPrefs,
};

mod output;

#[derive(Parser)]
#[command(name = "cirrus")]
#[command(about = "Console for the cirrus compute API", long_about = None)]
struct Cli {
    /// Compute API base URL
    #[arg(long)]
    api: Option<String>,

    /// X-Auth-Token sent with every request
    #[arg(long)]
    token: Option<String>,

    /// Response envelope spoken by the API (legacy or current)
    #[arg(long)]
    envelope: Option<Envelope>,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bulk admin endpoint
    #[arg(long)]
    admin_url: Option<String>,

    /// Always fetch full server lists
    #[arg(long)]
    no_incremental: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a resource (defaults to the saved pane)
    List {
        #[arg(value_enum)]
        resource: Option<Resource>,
    },

    /// Show details of a VM
    Show {
        /// VM id or name
        vm: String,
    },

    /// Run an action on a VM
    Action {
        /// VM id or name
        vm: String,

        /// start, shutdown, reboot, destroy, console, resize, connect,
        /// disconnect, firewall, rename, set-metadata, delete-metadata
        action: String,

        /// Action arguments, e.g. the flavor for resize
        args: Vec<String>,
    },

    /// Create a VM
    Create {
        #[arg(short, long)]
        name: String,

        /// Image id
        #[arg(long)]
        image: String,

        /// Flavor id
        #[arg(long)]
        flavor: String,
    },

    /// Follow VM state changes
    Watch {
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Queue one action on several VMs and run them together
    Bulk {
        action: String,

        /// VM ids or names
        #[arg(required = true)]
        vms: Vec<String>,
    },

    /// Run a bulk admin operation
    Admin {
        /// Operation, e.g. suspend, resume or contact
        op: String,

        /// Target type, e.g. vm or user
        target: String,

        #[arg(required = true)]
        ids: Vec<String>,

        /// Message subject (contact)
        #[arg(long)]
        subject: Option<String>,

        /// Message text (contact)
        #[arg(long)]
        text: Option<String>,
    },

    /// Show or change the saved view
    View {
        /// Pane index (0 machines, 1 networks, 2 volumes, 3 images, 4 keys)
        #[arg(long)]
        pane: Option<u8>,

        /// Machine view index (0 table, 1 compact)
        #[arg(long)]
        machine: Option<u8>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Resource {
    Servers,
    Images,
    Flavors,
    Networks,
    Volumes,
    Keys,
    Quotas,
    Pools,
}

impl Resource {
    fn kind(self) -> Kind {
        match self {
            Resource::Servers => Kind::VirtualMachine,
            Resource::Images => Kind::Image,
            Resource::Flavors => Kind::Flavor,
            Resource::Networks => Kind::Network,
            Resource::Volumes => Kind::Volume,
            Resource::Keys => Kind::PublicKey,
            Resource::Quotas => Kind::Quota,
            Resource::Pools => Kind::FloatingIpPool,
        }
    }
}

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "RESULT")]
    result: String,
}

fn model_config(cli: &Cli) -> anyhow::Result<ModelConfig> {
    let mut config = match &cli.config {
        Some(path) => ModelConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ModelConfig::default(),
    };
    if let Some(api) = &cli.api {
        config.api_url = api.clone();
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    if let Some(envelope) = cli.envelope {
        config.envelope = envelope;
    }
    if let Some(url) = &cli.admin_url {
        config.admin_url = Some(url.clone());
    }
    if cli.no_incremental {
        config.incremental = false;
    }
    Ok(config)
}

/// Collections a listing of `kind` needs to resolve its references.
fn dependencies(kind: Kind) -> Vec<Kind> {
    match kind {
        Kind::VirtualMachine => vec![Kind::Flavor, Kind::Image, Kind::VirtualMachine],
        Kind::Volume => vec![Kind::VirtualMachine, Kind::Volume],
        other => vec![other],
    }
}

async fn load(ctx: &Context, kinds: &[Kind]) -> anyhow::Result<()> {
    for &kind in kinds {
        let options = FetchOptions {
            critical: true,
            ..FetchOptions::full()
        };
        ctx.fetch(kind, options)
            .await
            .with_context(|| format!("Failed to fetch {}s", kind))?;
    }
    Ok(())
}

fn load_prefs() -> (Option<PathBuf>, ViewPrefs) {
    let path = match ViewPrefs::default_path() {
        Ok(path) => path,
        Err(e) => {
            warn!("{}", e);
            return (None, ViewPrefs::default());
        }
    };
    let prefs = ViewPrefs::load(&path).unwrap_or_else(|e| {
        warn!("{}", e);
        ViewPrefs::default()
    });
    (Some(path), prefs)
}

fn describe(event: &CollectionEvent) -> Option<String> {
    match event {
        CollectionEvent::Add(vm) => Some(format!(
            "+ {} {} {}",
            vm.id(),
            output::text(vm, "name"),
            output::text(vm, "state")
        )),
        CollectionEvent::Remove(vm) => Some(format!("- {} {}", vm.id(), output::text(vm, "name"))),
        CollectionEvent::Change { entity, keys } if keys.iter().any(|k| k == "state") => {
            Some(format!(
                "~ {} {} {}",
                entity.id(),
                output::text(entity, "name"),
                output::text(entity, "state")
            ))
        }
        CollectionEvent::Entity {
            entity,
            event: EntityEvent::ActionFail { action, reason },
        } => Some(format!("! {} {} failed: {}", entity.id(), action, reason)),
        _ => None,
    }
}

async fn watch(ctx: &Rc<Context>, seconds: Option<u64>) -> anyhow::Result<()> {
    load(ctx, &dependencies(Kind::VirtualMachine)).await?;
    load(ctx, &[Kind::Quota]).await?;
    println!("{}", output::table(Kind::VirtualMachine, &ctx.vms().entities(), MachineView::Table));

    let mut notices = ctx.subscribe_notices();
    ctx.vms().on(|event| {
        if let Some(line) = describe(event) {
            println!("{} {}", chrono::Local::now().format("%H:%M:%S"), line);
        }
    });
    ctx.start_polling(&[Kind::VirtualMachine, Kind::Quota]);

    let deadline = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            _ = &mut deadline => break Ok(()),
            notice = notices.recv() => match notice {
                Ok(notice) if notice.is_unauthorized() => {
                    break Err(anyhow::anyhow!("Session ended: {}", notice.message));
                }
                Ok(notice) => eprintln!("{}: {}", notice.namespace, notice.message),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };
    ctx.shutdown();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = model_config(&cli)?;

    match cli.command {
        Commands::List { resource } => {
            let (_, prefs) = load_prefs();
            let kind = resource
                .map(Resource::kind)
                .unwrap_or_else(|| prefs.pane().kind());
            let ctx = Context::with_http(config)?;
            load(&ctx, &dependencies(kind)).await?;

            let entities = ctx.collection(kind).entities();
            if entities.is_empty() {
                println!("No {}s found", kind);
            } else {
                println!("{}", output::table(kind, &entities, prefs.machine()));
            }
        }

        Commands::Show { vm } => {
            let ctx = Context::with_http(config)?;
            load(&ctx, &dependencies(Kind::VirtualMachine)).await?;
            let vm = ctx.find_vm(&vm)?;
            if let Err(e) = ctx.refresh_stats(&vm).await {
                warn!("No stats for {}: {}", vm.id(), e);
            }

            println!("ID:       {}", vm.id());
            println!("Name:     {}", output::text(&vm, "name"));
            println!("State:    {}", output::text(&vm, "state"));
            println!("Status:   {}", output::text(&vm, "status"));
            println!("Flavor:   {}", output::related_name(&vm, "flavor"));
            println!("Image:    {}", output::related_name(&vm, "image"));
            println!("Actions:  {}", output::list(&vm, "actions"));
            println!("Created:  {}", output::text(&vm, "created"));
            if let Some(serde_json::Value::Object(metadata)) = vm.get("metadata")
                && !metadata.is_empty()
            {
                println!("Metadata:");
                for (key, value) in &metadata {
                    println!("  {} = {}", key, value.as_str().unwrap_or_default());
                }
            }
            if let Some(cpu) = vm
                .get("stats")
                .and_then(|s| s.get("cpuBar").and_then(|b| b.as_array().cloned()))
                .and_then(|bars| bars.last().and_then(serde_json::Value::as_f64))
            {
                println!("CPU:      {:.1}%", cpu);
            }
        }

        Commands::Action { vm, action, args } => {
            let action = Action::parse(&action, &args)?;
            let ctx = Context::with_http(config)?;
            load(&ctx, &dependencies(Kind::VirtualMachine)).await?;
            load(&ctx, &[Kind::Quota]).await?;
            let vm = ctx.find_vm(&vm)?;

            ctx.call(&vm, action.clone()).await?;
            println!(
                "{} {}: {} (state: {})",
                vm.id(),
                output::text(&vm, "name"),
                action,
                output::text(&vm, "state")
            );
            if action == Action::Console
                && let Some(url) = vm.get("console").and_then(|c| c.get("url").cloned())
            {
                println!("Console:  {}", url.as_str().unwrap_or_default());
            }
        }

        Commands::Create {
            name,
            image,
            flavor,
        } => {
            let ctx = Context::with_http(config)?;
            load(&ctx, &[Kind::Flavor, Kind::Image, Kind::Quota]).await?;
            let vm = ctx.create_vm(&name, &image, &flavor).await?;
            println!("Created VM: {} (state: {})", vm.id(), output::text(&vm, "state"));
        }

        Commands::Watch { seconds } => {
            let ctx = Context::with_http(config)?;
            watch(&ctx, seconds).await?;
        }

        Commands::Bulk { action, vms } => {
            let ctx = Context::with_http(config)?;
            load(&ctx, &dependencies(Kind::VirtualMachine)).await?;
            load(&ctx, &[Kind::Quota]).await?;

            let action: Action = action.parse()?;
            for key in &vms {
                let vm = ctx.find_vm(key)?;
                ctx.set_pending(&vm, action.clone(), "cli")
                    .with_context(|| format!("Cannot queue {} for {}", action, key))?;
            }

            let results = ctx.confirm_all().await;
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            let rows = results.into_iter().map(|(vm, result)| ResultRow {
                vm,
                result: match result {
                    Ok(()) => "ok".to_string(),
                    Err(e) => e.to_string(),
                },
            });
            println!("{}", Table::new(rows));
            if failed > 0 {
                bail!("{} of {} actions failed", failed, vms.len());
            }
        }

        Commands::Admin {
            op,
            target,
            ids,
            subject,
            text,
        } => {
            let Some(url) = config.admin_url.clone() else {
                bail!("No admin endpoint configured (use --admin-url)");
            };
            let mut request = BulkRequest::new(op, target, ids);
            if let (Some(subject), Some(text)) = (subject, text) {
                request = request.with_message(subject, text);
            }
            let outcome = AdminClient::new(url, config.token.clone())
                .submit(&request)
                .await?;
            println!("Result: {}", outcome.result);
            if !outcome.is_success() {
                bail!("Failed for: {}", outcome.error_ids.join(", "));
            }
        }

        Commands::View { pane, machine } => {
            let (path, mut prefs) = load_prefs();
            if pane.is_some() || machine.is_some() {
                if let Some(pane) = pane {
                    prefs.pane_view = pane;
                }
                if let Some(machine) = machine {
                    prefs.machine_view = machine;
                }
                let Some(path) = path else {
                    bail!("No config directory to save the view in");
                };
                prefs.save(&path)?;
            }
            let pane: Pane = prefs.pane();
            println!("Pane:     {:?} ({})", pane, pane.index());
            println!("Machines: {:?} ({})", prefs.machine(), prefs.machine().index());
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cirrus_model=warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    LocalSet::new().run_until(run(cli)).await
}
