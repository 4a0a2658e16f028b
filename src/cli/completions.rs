//! Shell completion generation.

use crate::cli::{Cli, CompletionsArgs};
use clap::CommandFactory;
use clap_complete::generate;

pub fn handle_completions(args: &CompletionsArgs) {
    let mut command = Cli::command();
    generate(args.shell, &mut command, "baton", &mut std::io::stdout());
}
