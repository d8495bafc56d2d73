use clap::Parser;
use tabulon_cli::MultitoolCli;
use tabulon_cli::Subcommand;
use tabulon_cli::proto;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = MultitoolCli::parse();
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        match cli.subcommand {
            None => tabulon_exec::run_main(cli.exec).await,
            Some(Subcommand::Exec(exec_cli)) => tabulon_exec::run_main(exec_cli).await,
            Some(Subcommand::Proto(proto_cli)) => proto::run_main(proto_cli).await,
        }
    })
}
