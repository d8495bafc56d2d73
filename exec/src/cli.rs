use clap::Parser;
use clap::ValueEnum;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Dataset to query.
    #[arg(long = "dataset", short = 'd')]
    pub dataset_id: String,

    /// Resume an existing conversation thread rather than starting a new one.
    #[arg(long = "thread")]
    pub thread_id: Option<Uuid>,

    /// Write the assistant's final message to this file in addition to stdout.
    #[arg(long = "output-last-message", value_name = "FILE")]
    pub last_message_file: Option<std::path::PathBuf>,

    /// Specifies color settings for use in the output.
    #[arg(long = "color", value_enum, default_value_t = Color::Auto)]
    pub color: Color,

    /// Natural-language question, `SQL: ...`, or `PYTHON: ...` submission.
    /// Reads from stdin when omitted or passed as `-`.
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Color {
    Always,
    Never,
    #[default]
    Auto,
}
