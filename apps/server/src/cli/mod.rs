mod actions;
mod arguments;
use clap::Parser;

pub fn run() -> eyre::Result<()> {
    actions::run(arguments::Args::parse())
}
