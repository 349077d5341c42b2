use colored::Colorize;
use dove::commands::command_argument_builder;
use dove::handlers::*;
use dove_core::print_banner;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");
    let verbose = chosen_command.get_flag("verbose");

    init_logging(verbose);

    // Show banner unless --quiet flag is set; the feed goes to stdout untouched
    if !quiet && chosen_command.subcommand_name() != Some("feed") {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        // No subcommand provided, just show the banner
        return;
    }

    let result = match chosen_command.subcommand() {
        Some(("init", primary_command)) => handle_init(primary_command),
        Some(("mirror", primary_command)) => match primary_command.subcommand() {
            Some(("add", secondary_command)) => handle_mirror_add(secondary_command),
            Some(("remove", secondary_command)) => handle_mirror_remove(secondary_command),
            Some(("list", secondary_command)) => handle_mirror_list(secondary_command),
            _ => unreachable!("clap should ensure we don't get here"),
        },
        Some(("channel", primary_command)) => match primary_command.subcommand() {
            Some(("add", secondary_command)) => handle_channel_add(secondary_command),
            Some(("remove", secondary_command)) => handle_channel_remove(secondary_command),
            Some(("list", secondary_command)) => handle_channel_list(secondary_command),
            _ => unreachable!("clap should ensure we don't get here"),
        },
        Some(("scan", primary_command)) => handle_scan(primary_command, quiet).await,
        Some(("feed", primary_command)) => handle_feed(primary_command),
        Some(("nodes", primary_command)) => handle_nodes(primary_command),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}
