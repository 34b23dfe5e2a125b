//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use chrono::{Local, TimeZone};
use serde::Serialize;

use finishline_core::models::format_token;
use finishline_core::storage::EventDevice;
use finishline_core::{Assignment, EventReplica};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print the event a device is working on
    pub fn print_replica(&self, replica: &EventReplica, assignments: usize) {
        match self.format {
            OutputFormat::Human => {
                println!("Event:       {} ({})", replica.name, replica.event_id);
                println!("Next token:  {}", format_token(replica.next_token));
                println!(
                    "Holding:     {}",
                    if replica.current_token == 0 {
                        "-".to_string()
                    } else {
                        format_token(replica.current_token)
                    }
                );
                println!("Assignments: {}", assignments);
            }
            OutputFormat::Json => self.json(&serde_json::json!({
                "event": replica,
                "assignments": assignments,
            })),
            OutputFormat::Quiet => println!("{}", replica.event_id),
        }
    }

    /// Print a single assignment
    pub fn print_assignment(&self, assignment: &Assignment) {
        match self.format {
            OutputFormat::Human => println!("{}", assignment_line(assignment)),
            OutputFormat::Json => self.json(assignment),
            OutputFormat::Quiet => println!("{}", assignment.label()),
        }
    }

    /// Print a list of assignments
    pub fn print_assignments(&self, assignments: &[Assignment]) {
        match self.format {
            OutputFormat::Human => {
                if assignments.is_empty() {
                    println!("No assignments yet.");
                    return;
                }
                for assignment in assignments {
                    println!("{}", assignment_line(assignment));
                }
                println!("\n{} assignment(s)", assignments.len());
            }
            OutputFormat::Json => self.json(assignments),
            OutputFormat::Quiet => {
                for assignment in assignments {
                    println!("{}\t{}", assignment.label(), assignment.athlete_barcode);
                }
            }
        }
    }

    /// Print the devices seen in an event
    pub fn print_devices(&self, devices: &[EventDevice]) {
        match self.format {
            OutputFormat::Human => {
                if devices.is_empty() {
                    println!("No devices recorded.");
                    return;
                }
                for device in devices {
                    println!(
                        "{} | {} | last seen {}",
                        short_id(&device.device_id),
                        truncate(device.display_name.as_deref().unwrap_or("(unnamed)"), 24),
                        format_millis(device.last_seen)
                    );
                }
            }
            OutputFormat::Json => self.json(devices),
            OutputFormat::Quiet => {
                for device in devices {
                    println!("{}", device.device_id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn assignment_line(assignment: &Assignment) -> String {
    let athlete = if assignment.athlete_barcode.is_empty() {
        "(no barcode)".to_string()
    } else {
        assignment.athlete_barcode.clone()
    };
    let name = if assignment.athlete_name.is_empty() {
        String::new()
    } else {
        format!(" {}", truncate(&assignment.athlete_name, 24))
    };
    format!(
        "{} | {}{} | {} | {}{}",
        assignment.label(),
        athlete,
        name,
        assignment.entry_method,
        format_millis(assignment.timestamp),
        if assignment.is_local { " *" } else { "" }
    )
}

/// Local time of a millisecond timestamp
pub fn format_millis(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => millis.to_string(),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finishline_core::EntryMethod;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("Łódź Maraton Miejski", 8), "Łódź...");
    }

    #[test]
    fn test_assignment_line() {
        let assignment = Assignment {
            token: 42,
            athlete_barcode: "A123".to_string(),
            athlete_name: "Sam".to_string(),
            entry_method: EntryMethod::Scan,
            timestamp: 0,
            origin_id: "abc123".to_string(),
            is_local: true,
        };
        let line = assignment_line(&assignment);
        assert!(line.starts_with("P0042 | A123 Sam | scan |"));
        assert!(line.ends_with(" *"));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0f8fad5b-d9cb-469f"), "0f8fad5b");
        assert_eq!(short_id("abc"), "abc");
    }
}
