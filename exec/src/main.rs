use clap::Parser;
use tabulon_exec::Cli;
use tabulon_exec::run_main;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_main(cli))
}
