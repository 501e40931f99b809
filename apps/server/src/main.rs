use eyre::Result;

mod cli;

fn main() -> Result<()> {
    cli::run()
}
