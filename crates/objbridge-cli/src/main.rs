use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::Verbosity;

mod commands;
mod error;

#[derive(Parser, Debug)]
#[command(name = "objbridge")]
#[command(about = "Inspect and exercise C struct layouts that reference foreign objects", long_about = None)]
struct Args {
    #[command(flatten)]
    verbose: Verbosity,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the field descriptor table
    Describe {
        /// Project file with `[[struct]]` metadata
        #[arg(value_name = "PROJECT")]
        project: PathBuf,
        /// Only print this struct
        #[arg(short, long, value_name = "NAME")]
        r#type: Option<String>,
    },

    /// Validate every layout and cross-check declared offsets
    Check {
        /// Project file with `[[struct]]` metadata
        #[arg(value_name = "PROJECT")]
        project: PathBuf,
    },

    /// Read a populated struct and write it back through the bridge
    Roundtrip {
        /// Project file with `[[struct]]` metadata
        #[arg(value_name = "PROJECT")]
        project: PathBuf,
        /// Struct to exercise
        #[arg(short, long, value_name = "NAME")]
        r#type: String,
    },
}

fn main() -> miette::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    match args.command {
        Command::Describe { project, r#type } => commands::describe::handle_describe(&project, r#type.as_deref())?,
        Command::Check { project } => commands::check::handle_check(&project)?,
        Command::Roundtrip { project, r#type } => commands::roundtrip::handle_roundtrip(&project, &r#type)?,
    }
    Ok(())
}
