use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nagios_provision::{
    build_provisioner,
    config::Config,
    logging,
    provision::ProvisionReport,
    system::ensure_systemd_available,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "nagios-provision", about = "Provision a Nagios monitoring server from inventory")]
struct Cli {
    /// Print results as JSON instead of a summary
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge this host into a Nagios server
    Run,
    /// Render every managed file into a directory without touching the host
    Render {
        #[arg(long)]
        output: PathBuf,
    },
    /// Print the aggregated inventory used for rendering
    Inventory,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    info!(
        node = %config.local_node.name,
        environment = %config.local_node.environment,
        "configuration loaded"
    );

    match cli.command {
        Commands::Run => {
            ensure_systemd_available()?;
            let provisioner = build_provisioner(config)?;
            let report = provisioner.run().await?;
            print_report(&report, cli.json)?;
        }
        Commands::Render { output } => {
            let provisioner = build_provisioner(config)?;
            for path in provisioner.render_to(&output).await? {
                println!("{}", path.display());
            }
        }
        Commands::Inventory => {
            let provisioner = build_provisioner(config)?;
            let aggregation = provisioner.aggregate().await?;
            println!("{}", serde_json::to_string_pretty(&aggregation)?);
        }
    }

    Ok(())
}

fn print_report(report: &ProvisionReport, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for record in &report.steps {
        println!("{:<28} {}", record.step, record.status);
    }
    println!(
        "{} of {} steps changed in {} ms",
        report.changed_steps().len(),
        report.steps.len(),
        (report.finished_at - report.started_at).num_milliseconds()
    );
    Ok(())
}
