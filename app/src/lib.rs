mod cli;
mod commands;
mod display;
mod events;
mod state;

pub mod logging;

use anyhow::Result;
use log::{error, info};

use cli::{Action, Cli};
use events::Reporter;
use state::{AppState, Settings};

pub async fn run() -> Result<()> {
    let cli = match cli::parse_from(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => match e.downcast::<clap::Error>() {
            Ok(clap_err) => clap_err.exit(),
            Err(e) => return Err(e),
        },
    };

    logging::init(logging::level_for(cli.verbosity));
    info!("🚀 Screen recorder starting...");

    let reporter = Reporter::new(cli.json);
    let result = dispatch(cli, reporter).await;
    if let Err(e) = &result {
        error!("❌ {:#}", e);
    }
    result
}

async fn dispatch(cli: Cli, reporter: Reporter) -> Result<()> {
    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.action {
        Action::Probe { display } => {
            reporter.probe(&commands::probe(display, &settings.candidate_widths));
            Ok(())
        }
        Action::Record(args) => {
            commands::apply_overrides(&mut settings, &args);
            let state = AppState::new(settings)?;
            let mut triggers = commands::StopTriggers::listen();
            commands::record(&state, reporter, args.duration, &mut triggers)
                .await
                .map(|_| ())
        }
    }
}
