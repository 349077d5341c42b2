use crate::CLAP_STYLING;
use clap::{arg, command};
use url::Url;

pub const DEFAULT_DATA_DIR: &str = "~/.config/dove/";

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("dove")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("dove")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and progress output").required(false))
        .arg(arg!(-v --"verbose" "Enable debug logging").required(false))
        .arg(
            arg!(--"data-dir" <PATH>)
                .required(false)
                .global(true)
                .help("Directory holding the dove database")
                .default_value(DEFAULT_DATA_DIR),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Initializes the dove database on your filesystem")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Location to store the dove database (default: --data-dir)"),
                )
                .arg(
                    arg!(-f - -"force")
                        .help("Deletes any existing database at the specified location first.")
                        .required(false),
                ),
        )
        .subcommand(
            command!("mirror")
                .about("Manage mirror pages that publish links")
                .subcommand_required(true)
                .subcommand(
                    command!("add")
                        .about("Adds a mirror")
                        .arg(arg!(<NAME>).help("Short unique name for the mirror"))
                        .arg(
                            arg!(<URL>)
                                .help("Page to fetch links from")
                                .value_parser(clap::value_parser!(Url)),
                        ),
                )
                .subcommand(
                    command!("remove")
                        .about("Removes a mirror")
                        .arg(arg!(<NAME>).help("Name of the mirror")),
                )
                .subcommand(command!("list").about("List all mirrors")),
        )
        .subcommand(
            command!("channel")
                .about("Manage public channels whose messages carry links")
                .subcommand_required(true)
                .subcommand(
                    command!("add")
                        .about("Adds a channel")
                        .arg(arg!(<USERNAME>).help("Public channel username")),
                )
                .subcommand(
                    command!("remove")
                        .about("Removes a channel")
                        .arg(arg!(<USERNAME>).help("Public channel username")),
                )
                .subcommand(command!("list").about("List all channels")),
        )
        .subcommand(
            command!("scan")
                .about(
                    "Collect links, verify them and the stored inventory, then commit the \
                result.",
                )
                .arg(
                    arg!(--"source" <SOURCE>)
                        .required(false)
                        .help("Which upstream sources to read")
                        .value_parser(["all", "channels", "mirrors"])
                        .default_value("all"),
                )
                .arg(
                    arg!(-L --"links-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of extra links")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-t --"threads" <NUM_WORKERS>)
                        .required(false)
                        .help("How many probes run at once")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("4"),
                )
                .arg(
                    arg!(--"engine" <PATH>)
                        .required(false)
                        .help("Tunneling engine binary")
                        .default_value("xray"),
                )
                .arg(
                    arg!(--"transfer-tool" <PATH>)
                        .required(false)
                        .help("Transfer tool used to pull the payload through the tunnel")
                        .default_value("curl"),
                )
                .arg(
                    arg!(--"payload-url" <URL>)
                        .required(false)
                        .help("Fixed-size payload downloaded through each tunnel")
                        .value_parser(clap::value_parser!(Url))
                        .default_value("http://speedtest.tele2.net/1MB.zip"),
                )
                .arg(
                    arg!(--"payload-kb" <KB>)
                        .required(false)
                        .help("Size of the payload in KB")
                        .value_parser(clap::value_parser!(f64))
                        .default_value("1024"),
                )
                .arg(
                    arg!(--"tcp-timeout" <SECS>)
                        .required(false)
                        .help("TCP reachability timeout")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("10"),
                )
                .arg(
                    arg!(--"max-latency" <MS>)
                        .required(false)
                        .help("Reject endpoints whose TCP connect takes this long or longer")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("1050"),
                )
                .arg(
                    arg!(--"startup-timeout" <SECS>)
                        .required(false)
                        .help("How long the engine may take to open its control port")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("10"),
                )
                .arg(
                    arg!(--"transfer-timeout" <SECS>)
                        .required(false)
                        .help("Timeout for the payload transfer")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("20"),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save report to file (default: display to screen)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
        .subcommand(
            command!("feed")
                .about("Print the subscription feed of working links")
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Write the feed to a file instead of stdout")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                ),
        )
        .subcommand(
            command!("nodes")
                .about("Show the stored inventory")
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Output format: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
}
