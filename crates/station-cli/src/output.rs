//! Output formatting for diag-station (text, json)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    #[default]
    Text,
    /// JSON, one document per result
    Json,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Print a success message (text mode, unless quiet)
    pub fn success(&self, msg: &str) {
        if !self.quiet && !self.is_json() {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (text mode, unless quiet)
    pub fn info(&self, msg: &str) {
        if !self.quiet && !self.is_json() {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print a result: key-value lines in text mode, the serialized value in json mode
    pub fn print_result<T: Serialize>(&self, value: &T, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Text => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => print_json(value, true),
        }
    }

    /// Print rows as a table in text mode, the serialized value in json mode
    pub fn print_table<T: Tabled, V: Serialize>(&self, rows: &[T], value: &V) {
        match self.format {
            OutputFormat::Text => {
                if rows.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(rows));
                }
            }
            OutputFormat::Json => print_json(value, true),
        }
    }

    /// Print one stream item on its own line
    pub fn print_line<T: Serialize>(&self, text: &str, value: &T) {
        match self.format {
            OutputFormat::Text => println!("{}", text),
            OutputFormat::Json => print_json(value, false),
        }
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    println!("{}", rendered.unwrap_or_else(|_| "{}".to_string()));
}

/// ECU row for the ecu-check command
#[derive(Debug, Tabled)]
pub struct EcuRow {
    #[tabled(rename = "ECU")]
    pub ecu: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Errors")]
    pub error_count: u32,
    #[tabled(rename = "Detail")]
    pub detail: String,
}
