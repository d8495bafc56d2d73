pub mod proto;

use clap::Parser;
use tabulon_exec::Cli as ExecCli;

use crate::proto::ProtoCli;

/// Conversational analytics gateway.
///
/// If no subcommand is specified, behaves like `exec` and expects its usual
/// arguments.
#[derive(Debug, Parser)]
#[clap(author, version, subcommand_negates_reqs = true)]
pub struct MultitoolCli {
    #[clap(flatten)]
    pub exec: ExecCli,

    #[clap(subcommand)]
    pub subcommand: Option<Subcommand>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    /// Run a single-shot, non-interactive query.
    #[clap(visible_alias = "e")]
    Exec(ExecCli),

    /// Run the line-delimited JSON event protocol over stdin/stdout.
    #[clap(visible_alias = "p")]
    Proto(ProtoCli),
}
