//! Output formatting for CLI

use chrono::{TimeZone, Utc};
use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use elvisp_common::Allocation;
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Allocation display wrapper for serialization
#[derive(Serialize)]
pub struct AllocationDisplay {
    pub client: String,
    pub address: String,
    pub prefix: u8,
    pub created: String,
    pub renewed: String,
}

impl From<&Allocation> for AllocationDisplay {
    fn from(allocation: &Allocation) -> Self {
        Self {
            client: allocation.client_id.to_string(),
            address: allocation.address.to_string(),
            prefix: allocation.prefix,
            created: timestamp(allocation.created_at),
            renewed: timestamp(allocation.last_renewed_at),
        }
    }
}

impl TableDisplay for AllocationDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Client", "Address", "Prefix", "Created", "Renewed"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.client.clone(),
            self.address.clone(),
            format!("/{}", self.prefix),
            self.created.clone(),
            self.renewed.clone(),
        ]
    }
}

fn timestamp(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(T::headers());
            table.add_row(item.row());

            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item).unwrap_or_default());
        }
        OutputFormat::Plain => {
            let row = item.row();
            for (header, value) in T::headers().iter().zip(row.iter()) {
                println!("{}: {}", header, value);
            }
        }
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if items.is_empty() {
        if let OutputFormat::Json = format {
            println!("[]");
        } else {
            println!("No allocations.");
        }
        return;
    }

    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }

            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
        OutputFormat::Plain => {
            for item in items {
                println!("{}", item.row().join("\t"));
            }
        }
    }
}

/// Print a simple message
pub fn print_message(message: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "message": message }));
        }
        _ => {
            println!("{}", message);
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✔".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✘".red(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow(), message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("{} {}", "i".blue(), message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use elvisp_common::PublicKey;

    #[test]
    fn test_allocation_row() {
        let allocation = Allocation {
            client_id: PublicKey::from_bytes([3; 32]),
            address: "fd00::3".parse().unwrap(),
            prefix: 64,
            created_at: 0,
            last_renewed_at: 86_400,
        };
        let display = AllocationDisplay::from(&allocation);
        let row = display.row();
        assert_eq!(row.len(), AllocationDisplay::headers().len());
        assert_eq!(row[1], "fd00::3");
        assert_eq!(row[2], "/64");
        assert_eq!(row[3], "1970-01-01 00:00:00");
        assert_eq!(row[4], "1970-01-02 00:00:00");
    }
}
