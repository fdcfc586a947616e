use clap::{Arg, ArgAction, Command};

pub(super) const NODE_NAME: &str = "node-name";
pub(super) const PRINT_SETTINGS: &str = "print-settings";

pub(super) fn root_cli() -> Command {
    Command::new("processor")
        .about("Creates processor tasks from filters and hands them out to worker nodes")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_run_subcommand())
}

fn add_run_subcommand() -> Command {
    Command::new("run")
        .about("Run the task scheduler on this node")
        .arg(
            Arg::new(NODE_NAME)
                .long(NODE_NAME)
                .help("Node name, overrides PROCESSOR_NODE_NAME"),
        )
        .arg(
            Arg::new(PRINT_SETTINGS)
                .long(PRINT_SETTINGS)
                .action(ArgAction::SetTrue)
                .help("Log the resolved settings and exit"),
        )
}
