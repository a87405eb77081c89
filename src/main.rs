use anyhow::Result;
use argh::FromArgs;
use shell_engine::terminal::{Terminal, Tty};
use shell_engine::{Shell, ShellConfig, logging};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(FromArgs)]
/// Interactive shell with job control.
struct Args {
    /// run this line and exit with its status
    #[argh(option, short = 'c')]
    command: Option<String>,

    /// configuration file to use instead of the per-user one
    #[argh(option)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let config = ShellConfig::load(args.config.as_deref())?;
    logging::init(&config.log_level)?;

    let status = match args.command {
        Some(line) => {
            let mut shell = Shell::with_config(config);
            let status = shell.run_line(&line).await;
            shell.exit_requested().unwrap_or(status)
        }
        None => {
            let terminal = Tty::acquire()?.map(|tty| Arc::new(tty) as Arc<dyn Terminal>);
            let mut shell = Shell::interactive(config, terminal)?;
            shell.repl().await?
        }
    };
    std::process::exit(status);
}
