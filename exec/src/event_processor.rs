use chrono::Utc;
use owo_colors::OwoColorize;
use owo_colors::Style;
use tabulon_protocol::AgentEvent;

pub(crate) struct EventProcessor {
    bold: Style,
    dimmed: Style,
    magenta: Style,
    red: Style,
    green: Style,
}

macro_rules! ts_println {
    ($($arg:tt)*) => {{
        let now = Utc::now();
        let formatted = now.format("%Y-%m-%dT%H:%M:%S").to_string();
        print!("[{}] ", formatted);
        println!($($arg)*);
    }};
}

impl EventProcessor {
    pub(crate) fn create_with_ansi(with_ansi: bool) -> Self {
        if with_ansi {
            Self {
                bold: Style::new().bold(),
                dimmed: Style::new().dimmed(),
                magenta: Style::new().magenta(),
                red: Style::new().red(),
                green: Style::new().green(),
            }
        } else {
            Self {
                bold: Style::new(),
                dimmed: Style::new(),
                magenta: Style::new(),
                red: Style::new(),
                green: Style::new(),
            }
        }
    }

    /// Returns `true` once a `Done` event has been processed.
    pub(crate) fn process_event(&mut self, event: AgentEvent) -> bool {
        match event {
            AgentEvent::Token { text } => {
                print!("{text}");
            }
            AgentEvent::ToolCall { call_id: _, name, input } => {
                let label = format!("tool: {name}").style(self.magenta);
                let args = serde_json::to_string(&input).unwrap_or_default();
                ts_println!("{label} {}", args.style(self.dimmed));
            }
            AgentEvent::ToolResult { call_id: _, name, output } => {
                let label = format!("{name} ->").style(self.bold);
                let truncated: String = output.lines().take(20).collect::<Vec<_>>().join("\n");
                ts_println!("{label}");
                println!("{}", truncated.style(self.dimmed));
            }
            AgentEvent::Result { response } => {
                println!();
                let status_style = match response.status {
                    tabulon_protocol::SurfaceStatus::Succeeded => self.green,
                    tabulon_protocol::SurfaceStatus::Rejected
                    | tabulon_protocol::SurfaceStatus::TimedOut
                    | tabulon_protocol::SurfaceStatus::Failed
                    | tabulon_protocol::SurfaceStatus::NotFound => self.red,
                };
                let status_line = format!("status: {:?}", response.status);
                ts_println!("{}", status_line.style(status_style));
                println!("{}", response.assistant_message);
                if response.result.row_count > 0 {
                    let summary = format!(
                        "{} row(s), {}ms",
                        response.result.row_count, response.result.exec_time_ms
                    );
                    println!("{}", summary.style(self.dimmed));
                }
            }
            AgentEvent::Done => return true,
            AgentEvent::Error { message } => {
                let prefix = "ERROR:".style(self.red);
                ts_println!("{prefix} {message}");
            }
        }
        false
    }
}
