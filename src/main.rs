use clap::{Parser, Subcommand};

use commands::GlobalArgs;

mod commands;
mod output;

use commands::{copy, inspect, tasks, tools};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "fabalicious")]
#[command(version = VERSION)]
#[command(about = "Deployment orchestration for named environments over SSH")]
struct Cli {
    /// Path to fabfile.yaml (default: search upwards from the working directory)
    #[arg(long, short = 'f', global = true)]
    file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reset a configuration (database updates, caches, common commands)
    Reset(tasks::ResetArgs),
    /// Deploy the configured branch, then reset
    Deploy(tasks::DeployArgs),
    /// Back up database and files
    Backup(tasks::BackupArgs),
    /// Back up the database only
    #[command(name = "backup-db")]
    BackupDb(tasks::ConfigArgs),
    /// Run any task through all methods of a configuration
    Run(tasks::RunArgs),
    /// Copy database and files from another configuration
    #[command(name = "copy-from")]
    CopyFrom(copy::CopyFromArgs),
    /// Copy the database from another configuration
    #[command(name = "copy-db-from")]
    CopyDbFrom(copy::CopyArgs),
    /// Copy files from another configuration
    #[command(name = "copy-files-from")]
    CopyFilesFrom(copy::CopyArgs),
    /// Run a docker host task for the configuration's container
    Docker(tools::DockerArgs),
    /// Run a drush command in the site folder
    Drush(tools::CommandArgs),
    /// Run a Drupal Console command, or `install` it
    Drupalconsole(tools::CommandArgs),
    /// Run a composer command in the git root
    Composer(tools::CommandArgs),
    /// Run a named script
    Script(tools::ScriptArgs),
    /// Send a Slack notification
    Notify(tools::NotifyArgs),
    /// Show the deployed version
    Version(tasks::ConfigArgs),
    /// List configurations
    List,
    /// Print one configuration value
    #[command(name = "get-property")]
    GetProperty(inspect::PropertyArgs),
    /// Show the resolved configuration
    About(tasks::ConfigArgs),
}

fn is_interactive(command: &Commands) -> bool {
    matches!(command, Commands::Docker(args) if tools::is_interactive(args))
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let global = GlobalArgs { file: cli.file };

    if let Err(err) = fabalicious::tunnel::install_exit_handler() {
        fabalicious::log_status!("warning", "Could not install Ctrl-C handler: {}", err.message);
    }

    if is_interactive(&cli.command) && !commands::require_tty_for_interactive() {
        let err = fabalicious::Error::validation_invalid_argument(
            "tty",
            "This command requires an interactive TTY",
        );
        report(Err(err));
        return std::process::ExitCode::from(2);
    }

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    fabalicious::tunnel::terminate_all();
    report(json_result);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn report(result: fabalicious::Result<serde_json::Value>) {
    if let Err(err) = output::print_json_result(result) {
        eprintln!("{}", err.message);
    }
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
