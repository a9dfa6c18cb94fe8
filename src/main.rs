//! CLI entry point for stack alignment

use clap::Parser;
use stackalign::io::cli::{App, Cli};
use stackalign::io::logging;

fn main() -> stackalign::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_options())?;
    App::new(cli).run()
}
