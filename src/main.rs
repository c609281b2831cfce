use budget_sync::args::{
    Args, Command, ExpenseCommand, PeriodCommand, TemplateCommand, UpDown,
};
use budget_sync::{commands, Config, Mode, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, error, trace};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_level = args.common().log_level();
    init_logger(log_level);
    debug!("Log level set to {}", log_level.to_string().to_lowercase());

    match main_inner(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Exiting with error: {e}");
            ExitCode::FAILURE
        }
    }
}

pub async fn main_inner(args: Args) -> Result<()> {
    trace!("{args:?}");
    let home = args.common().budget_home().path();

    // This allows for running the program without a remote server. When BUDGET_SYNC_IN_TEST_MODE
    // is set and non-zero in length, then the mode will be Mode::Test, otherwise it will be
    // Mode::Http.
    let mode = Mode::from_env();

    // Route to appropriate command handler
    let _: () = match args.command() {
        Command::Init(init_args) => commands::init(home, init_args).await?.print(),

        Command::Period(period_command) => {
            let config = Config::load(home).await?;
            match period_command {
                PeriodCommand::Create(args) => {
                    commands::create_period(config, mode, args.clone())
                        .await?
                        .print()
                }
                PeriodCommand::Archive(args) => {
                    commands::archive_period(config, mode, args.clone())
                        .await?
                        .print()
                }
                PeriodCommand::Unarchive(args) => {
                    commands::unarchive_period(config, mode, args.clone())
                        .await?
                        .print()
                }
                PeriodCommand::List => commands::list_periods(config, mode).await?.print(),
            }
        }

        Command::Template(template_command) => {
            let config = Config::load(home).await?;
            match template_command {
                TemplateCommand::Save(args) => commands::save_template(config, mode, args.clone())
                    .await?
                    .print(),
                TemplateCommand::Delete(args) => {
                    commands::delete_template(config, mode, args.clone())
                        .await?
                        .print()
                }
            }
        }

        Command::Expense(expense_command) => {
            let config = Config::load(home).await?;
            match expense_command {
                ExpenseCommand::Add(args) => commands::add_expense(config, mode, args.clone())
                    .await?
                    .print(),
                ExpenseCommand::Update(args) => {
                    commands::update_expense(config, mode, args.clone())
                        .await?
                        .print()
                }
                ExpenseCommand::Delete(args) => {
                    commands::delete_expense(config, mode, args.clone())
                        .await?
                        .print()
                }
                ExpenseCommand::List(args) => commands::list_expenses(config, mode, args.clone())
                    .await?
                    .print(),
            }
        }

        Command::Sync(sync_args) => {
            let config = Config::load(home).await?;
            match sync_args.direction() {
                UpDown::Up => commands::sync_up(config, mode).await?.print(),
                UpDown::Down => commands::sync_down(config, mode).await?.print(),
            }
        }

        Command::Status => commands::status(Config::load(home).await?, mode)
            .await?
            .print(),

        Command::Restore(restore_args) => {
            let config = Config::load(home).await?;
            commands::restore(config, mode, restore_args.clone())
                .await?
                .print()
        }
    };
    Ok(())
}

/// Initializes the tracing subscriber.
pub fn init_logger(level: LevelFilter) {
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(_) => {
            // RUST_LOG exists; use it.
            EnvFilter::from_default_env()
        }
        None => {
            // RUST_LOG does not exist; use default log level for this crate only.
            EnvFilter::new(format!(
                "{}={},{}={}",
                env!("CARGO_CRATE_NAME"),
                level,
                env!("CARGO_BIN_NAME"),
                level
            ))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
