//! ssh-agent-switcher - stable SSH agent socket for forwarded agents

use std::process::ExitCode;

use ssh_agent_switcher::cli::exit_code;
use ssh_agent_switcher::cli::{Cli, run};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_with_defaults();

    if let Err(e) = ssh_agent_switcher::logging::init(cli.verbose, cli.quiet) {
        eprintln!("ssh-agent-switcher: {}", e);
        return exit_code::ExitCode::GeneralError.into();
    }

    match run::execute(cli).await {
        Ok(()) => exit_code::ExitCode::Success.into(),
        Err(e) => {
            tracing::error!("{:#}", e);
            exit_code::ExitCode::from_error(&e).into()
        }
    }
}
