use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use crate::display::{AuditRow, InterfaceRow, StatusRow};
use crate::logging::{self, LogFormat};
use crate::output::{self, OutputFormat};
use crate::ui;

use nicplug_controller::HotplugController;
use nicplug_controller::controller::{ConvergenceStatus, Delivery, HotplugReport};
use nicplug_controller::patch::AddInterface;
use nicplug_controller::sim::{SimConfig, SimulatedCluster};
use nicplug_core::HotplugError;
use nicplug_core::audit::AuditEntry;
use nicplug_core::config::{Config, StrategyKind};
use nicplug_core::instance::VmRef;
use nicplug_core::naming;
use nicplug_core::template::DesiredConfiguration;

#[derive(Parser)]
#[command(
    name = "nicplugctl",
    version,
    about = "Hotplug secondary network interfaces into running VMs"
)]
struct Cli {
    /// Output format: table, json
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: String,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add and then remove an interface on a simulated running VM
    Simulate {
        /// VM as <namespace>/<name> or <name>
        #[arg(long, default_value = "default/testvm")]
        vm: String,
        /// Interface (and network) name to hotplug
        #[arg(long, default_value = "iface1")]
        interface: String,
        /// Network attachment definition to bind to
        #[arg(long, default_value = "skynet")]
        attachment: String,
        /// Delivery strategy: in-place or migration (overrides config)
        #[arg(long)]
        strategy: Option<String>,
        /// Make the first migration fail
        #[arg(long)]
        fail_migration: bool,
        /// Restart the VM after the interface is added
        #[arg(long)]
        restart: bool,
        /// Use millisecond-scale simulated delays
        #[arg(long)]
        fast: bool,
        /// Config file (TOML)
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<String>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

// ============================================================================
// Command dispatch
// ============================================================================

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    logging::init(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Human
    });

    let out_fmt = OutputFormat::from_str_arg(&cli.output);

    match cli.command {
        Commands::Simulate {
            vm,
            interface,
            attachment,
            strategy,
            fail_migration,
            restart,
            fast,
            config,
        } => {
            let opts = SimulateOpts {
                vm,
                interface,
                attachment,
                strategy,
                fail_migration,
                restart,
                fast,
            };
            cmd_simulate(opts, config.as_deref(), out_fmt)
        }
        Commands::Config { config } => cmd_config(config.as_deref()),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let config = match path {
        Some(p) => Config::from_file(Path::new(p))?,
        None => Config::default(),
    };
    config.with_env_overrides()
}

fn cmd_config(path: Option<&str>) -> Result<()> {
    let config = load_config(path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

fn cmd_completions(shell: clap_complete::Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "nicplugctl", &mut std::io::stdout());
    Ok(())
}

// ============================================================================
// Simulation
// ============================================================================

struct SimulateOpts {
    vm: String,
    interface: String,
    attachment: String,
    strategy: Option<String>,
    fail_migration: bool,
    restart: bool,
    fast: bool,
}

#[derive(Serialize)]
struct SimulationReport {
    strategy: StrategyKind,
    add: HotplugReport,
    after_add: ConvergenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    after_restart: Option<ConvergenceStatus>,
    remove: HotplugReport,
    after_remove: ConvergenceStatus,
    audit: Vec<AuditEntry>,
}

fn cmd_simulate(opts: SimulateOpts, config_path: Option<&str>, out_fmt: OutputFormat) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(s) = &opts.strategy {
        config.hotplug.strategy = s.parse()?;
    }
    let (ns, name) = naming::parse_vm_path(&opts.vm)?;
    let vm = VmRef::new(ns, name);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(simulate(opts, config, vm, out_fmt))
}

async fn simulate(
    opts: SimulateOpts,
    config: Config,
    vm: VmRef,
    out_fmt: OutputFormat,
) -> Result<()> {
    let human = out_fmt == OutputFormat::Table;
    let sim_config = if opts.fast {
        SimConfig::fast()
    } else {
        SimConfig::default()
    };
    debug!(?sim_config, vm = %vm, "Starting simulated cluster");
    let sim = SimulatedCluster::new(sim_config);
    let mut hotplug = config.hotplug;
    if opts.fast {
        hotplug.poll_interval_ms = hotplug.poll_interval_ms.min(20);
    }
    let controller = HotplugController::new(Arc::new(sim.clone()), Arc::new(sim.clone()), hotplug);
    let strategy = controller.strategy_kind();
    let total = if opts.restart { 4 } else { 3 };

    if human {
        ui::info(&format!("Simulating {} with {} delivery", vm, strategy));
        ui::step(1, total, "Start VM with the pod network only");
    }
    sim.create_vm(&vm, DesiredConfiguration::with_pod_network(), true)
        .await?;
    let booted = sim.wait_running(&vm).await?;
    if human {
        ui::status_line("Instance", booted.uid());
        ui::status_line("Node", &booted.status.node_name);
    }

    if opts.fail_migration {
        sim.fail_next_migration("simulated target failure").await;
    }

    if human {
        ui::step(
            2,
            total,
            &format!("Add {} on attachment {}", opts.interface, opts.attachment),
        );
    }
    let add = match controller
        .add_interface(&vm, AddInterface::bridge(&opts.interface, &opts.attachment))
        .await
    {
        Ok(report) => report,
        Err(e) => {
            if let HotplugError::MigrationFailed {
                source_preserved, ..
            } = &e
            {
                let current = sim.instance(&vm).await;
                if human {
                    ui::warn(&format!(
                        "Source instance preserved: {}",
                        if *source_preserved { "yes" } else { "no" }
                    ));
                    if let Some(inst) = current {
                        let rows: Vec<StatusRow> =
                            inst.secondary_statuses().iter().map(StatusRow::from).collect();
                        println!("{}", output::table(&rows));
                    }
                }
            }
            return Err(e).with_context(|| format!("Failed to hotplug {}", opts.interface));
        }
    };
    let after_add = controller.convergence_status(&vm).await?;
    if human {
        print_delivery(&add);
        print_status(&after_add);
    }

    let after_restart = if opts.restart {
        if human {
            ui::step(3, total, "Restart VM and confirm the interface survives");
        }
        let inst = controller.restart(&vm).await?;
        if human {
            ui::status_line("Instance", inst.uid());
        }
        let status = controller.convergence_status(&vm).await?;
        if human {
            print_status(&status);
        }
        Some(status)
    } else {
        None
    };

    if human {
        ui::step(total, total, &format!("Mark {} absent", opts.interface));
    }
    let remove = controller.remove_interface(&vm, &opts.interface).await?;
    let after_remove = controller.convergence_status(&vm).await?;
    if human {
        print_delivery(&remove);
        print_status(&after_remove);
    }

    let audit = controller.audit_trail();
    match out_fmt {
        OutputFormat::Table => {
            let rows: Vec<AuditRow> = audit.iter().map(AuditRow::from).collect();
            println!("\n{}", output::table(&rows));
            ui::success("Simulation complete");
            Ok(())
        }
        OutputFormat::Json => output::print_json(&SimulationReport {
            strategy,
            add,
            after_add,
            after_restart,
            remove,
            after_remove,
            audit,
        }),
    }
}

fn print_delivery(report: &HotplugReport) {
    match &report.delivery {
        Delivery::NoChange => ui::info("Instance already matched the template"),
        Delivery::TemplateOnly => ui::warn("No running instance; template updated only"),
        Delivery::Delivered(outcome) => {
            ui::success(&format!(
                "{} delivered via {} on instance {}",
                report.interface, outcome.strategy, outcome.instance_uid
            ));
            if outcome.replaced_instance() {
                ui::status_line("Replaced", &outcome.previous_uid);
            }
            if let Some(id) = &outcome.migration_id {
                ui::status_line("Migration", id);
            }
        }
    }
}

fn print_status(status: &ConvergenceStatus) {
    ui::status_line("Converged", if status.converged { "yes" } else { "no" });
    let rows: Vec<InterfaceRow> = status.interfaces.iter().map(InterfaceRow::from).collect();
    println!("{}", output::table(&rows));
}
