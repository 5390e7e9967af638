//! Interactive command interpreter
//!
//! A thin shell over the engine: tokenizes a line, validates the command
//! shape, and dispatches. Invalid input prints a usage line; engine errors
//! are rendered, never panicked on.

use crate::aggregate::Reduction;
use crate::bench;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tickdb_core::{Engine, EngineConfig, Record, TickError, Timestamp};

/// Command keywords, also reserved as database names
const RESERVED_NAMES: &[&str] = &[
    "help", "create", "use", "append", "readall", "readrange", "readfrom", "last", "get", "stats",
    "bench", "exit", "quit",
];

/// Interactive shell state
pub struct Repl {
    data_dir: PathBuf,
    current: Option<OpenDatabase>,
}

struct OpenDatabase {
    name: String,
    engine: Engine,
}

impl Repl {
    /// Create a shell storing databases under `data_dir`
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            current: None,
        }
    }

    /// Run the interactive loop until `exit`, `quit` or EOF
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.print_help();
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("tickdb> ");
            io::stdout().flush()?;
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            let command = line.trim();
            if command == "exit" || command == "quit" {
                break;
            }
            if !command.is_empty() {
                self.handle_command(command);
            }
        }
        Ok(())
    }

    /// Print the command summary
    pub fn print_help(&self) {
        println!("TickDB Command Line Interface");
        println!("Commands:");
        println!("  help                                - Show this help message");
        println!("  create <name>                       - Create a new database");
        println!("  use <name>                          - Switch to an existing database");
        println!("  append <timestamp> <value>          - Append a record");
        println!("  readall [reduction]                 - Read all records");
        println!("  readrange <start> <end> [reduction] - Read records in a time range");
        println!("  readfrom <timestamp>                - Read the record at a timestamp");
        println!("  last                                - Show the most recent record");
        println!("  get <index>                         - Read the record at an index");
        println!("  stats                               - Show database statistics");
        println!("  bench <n>                           - Benchmark n appends");
        println!("  exit, quit                          - Exit the CLI");
        println!("Reductions: count, sum, avg, min, max, first, last");
    }

    /// Dispatch one already-trimmed command line
    pub fn handle_command(&mut self, command: &str) {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        let Some(&keyword) = tokens.first() else {
            return;
        };

        match keyword {
            "help" => self.print_help(),
            "create" => {
                if validate_create_command(&tokens) {
                    self.create_database(tokens[1]);
                } else {
                    println!("Invalid create command. Usage: create <name>");
                }
            }
            "use" => {
                if validate_use_command(&tokens) {
                    self.use_database(tokens[1]);
                } else {
                    println!("Invalid use command. Usage: use <name>");
                }
            }
            "append" => {
                if validate_append_command(&tokens) {
                    if let (Ok(timestamp), Ok(value)) = (tokens[1].parse(), tokens[2].parse()) {
                        self.append_record(timestamp, value);
                    }
                } else {
                    println!("Invalid append command. Usage: append <timestamp> <value>");
                }
            }
            "readall" => {
                if validate_read_all_command(&tokens) {
                    self.read_all(tokens.get(1).and_then(|t| Reduction::parse(t)));
                } else {
                    println!("Invalid readall command. Usage: readall [reduction]");
                }
            }
            "readrange" => {
                if validate_read_range_command(&tokens) {
                    if let (Ok(start), Ok(end)) = (tokens[1].parse(), tokens[2].parse()) {
                        self.read_range(start, end, tokens.get(3).and_then(|t| Reduction::parse(t)));
                    }
                } else {
                    println!("Invalid readrange command. Usage: readrange <start> <end> [reduction]");
                }
            }
            "readfrom" => {
                if validate_read_from_command(&tokens) {
                    if let Ok(timestamp) = tokens[1].parse() {
                        self.read_from(timestamp);
                    }
                } else {
                    println!("Invalid readfrom command. Usage: readfrom <timestamp>");
                }
            }
            "last" => self.show_last(),
            "get" => {
                if validate_get_command(&tokens) {
                    if let Ok(index) = tokens[1].parse() {
                        self.get_record(index);
                    }
                } else {
                    println!("Invalid get command. Usage: get <index>");
                }
            }
            "stats" => self.show_stats(),
            "bench" => {
                if validate_bench_command(&tokens) {
                    if let Ok(count) = tokens[1].parse() {
                        self.run_bench(count);
                    }
                } else {
                    println!("Invalid bench command. Usage: bench <n>");
                }
            }
            _ => println!("Unknown command: {}", command),
        }
    }

    fn engine(&self) -> Option<&Engine> {
        match &self.current {
            Some(db) => Some(&db.engine),
            None => {
                println!("No database selected. Use: create <name> | use <name>");
                None
            }
        }
    }

    fn database_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.tsdb", name))
    }

    fn create_database(&mut self, name: &str) {
        let path = self.database_path(name);
        if path.exists() {
            println!("Database '{}' already exists", name);
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&self.data_dir) {
            println!("Error: {}", e);
            return;
        }
        match Engine::open(&path, EngineConfig::default()) {
            Ok(engine) => {
                println!("Created database '{}'", name);
                self.current = Some(OpenDatabase {
                    name: name.to_string(),
                    engine,
                });
            }
            Err(e) => render_error(&e),
        }
    }

    fn use_database(&mut self, name: &str) {
        let path = self.database_path(name);
        if !path.exists() {
            println!("Database '{}' does not exist", name);
            return;
        }
        match Engine::open(&path, EngineConfig::default()) {
            Ok(engine) => {
                println!("Using database '{}'", name);
                self.current = Some(OpenDatabase {
                    name: name.to_string(),
                    engine,
                });
            }
            Err(e) => render_error(&e),
        }
    }

    fn append_record(&self, timestamp: Timestamp, value: f64) {
        let Some(engine) = self.engine() else { return };
        if engine.append(Record::new(timestamp, value)) {
            println!("Record accepted, pending persistence");
        } else {
            println!(
                "Rejected: timestamp {} is not newer than {}",
                timestamp,
                engine.last_timestamp()
            );
        }
    }

    fn read_all(&self, reduction: Option<Reduction>) {
        let Some(engine) = self.engine() else { return };
        match engine.read_all() {
            Ok(records) => render(&records, reduction),
            Err(e) => render_error(&e),
        }
    }

    fn read_range(&self, start: Timestamp, end: Timestamp, reduction: Option<Reduction>) {
        let Some(engine) = self.engine() else { return };
        match engine.read_range(start, end) {
            Ok(records) => render(&records, reduction),
            Err(e) => render_error(&e),
        }
    }

    fn read_from(&self, timestamp: Timestamp) {
        let Some(engine) = self.engine() else { return };
        match engine.read_from_time(timestamp) {
            Ok(Some(record)) => println!("Timestamp: {}, Value: {}", record.timestamp, record.value),
            Ok(None) => println!("No record at timestamp {}", timestamp),
            Err(e) => render_error(&e),
        }
    }

    fn show_last(&self) {
        let Some(engine) = self.engine() else { return };
        match engine.get_last_record() {
            Ok(Some(record)) => println!("Timestamp: {}, Value: {}", record.timestamp, record.value),
            Ok(None) => println!("Database is empty"),
            Err(e) => render_error(&e),
        }
    }

    fn get_record(&self, index: usize) {
        let Some(engine) = self.engine() else { return };
        match engine.get_record(index) {
            Ok(record) => println!("Timestamp: {}, Value: {}", record.timestamp, record.value),
            Err(e) => render_error(&e),
        }
    }

    fn show_stats(&self) {
        let Some(db) = &self.current else {
            println!("No database selected. Use: create <name> | use <name>");
            return;
        };
        let engine = &db.engine;
        let header = engine.header();
        println!("Database: {}", db.name);
        println!("File: {:?}", engine.path());
        println!(
            "Format: magic {} version {} record size {}",
            String::from_utf8_lossy(&header.magic),
            header.version,
            header.record_size
        );
        println!("Records persisted: {}", engine.record_count());
        if engine.last_timestamp() == Timestamp::MIN {
            println!("Last timestamp: -");
        } else {
            println!("Last timestamp: {}", engine.last_timestamp());
        }
        println!(
            "Sparse index: {} entries (step {})",
            engine.sparse_index_len(),
            engine.sparse_index_step()
        );
    }

    fn run_bench(&self, count: usize) {
        let Some(engine) = self.engine() else { return };
        match bench::run_append_bench(engine, count) {
            Ok(report) => println!(
                "Appended {} records in {:?} ({:.0} appends/sec)",
                report.appended,
                report.elapsed,
                report.throughput()
            ),
            Err(e) => render_error(&e),
        }
    }
}

/// Corruption is rendered distinctly: the backing file is damaged and no
/// retyped command will clear it.
fn render_error(e: &TickError) {
    if e.is_corruption() {
        println!("Corruption detected: {}", e);
    } else {
        println!("Error: {}", e);
    }
}

fn render(records: &[Record], reduction: Option<Reduction>) {
    match reduction {
        Some(reduction) => match reduction.reduce(records.iter().map(|r| r.value)) {
            Some(result) => println!("{}: {}", reduction.name(), result),
            None => println!("{}: no records", reduction.name()),
        },
        None => {
            for record in records {
                println!("Timestamp: {}, Value: {}", record.timestamp, record.value);
            }
        }
    }
}

/// True for a well-formed database name that is not a command keyword
pub fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !RESERVED_NAMES.contains(&name)
}

pub fn validate_create_command(tokens: &[&str]) -> bool {
    tokens.len() == 2 && is_valid_database_name(tokens[1])
}

pub fn validate_use_command(tokens: &[&str]) -> bool {
    tokens.len() == 2 && is_valid_database_name(tokens[1])
}

pub fn validate_append_command(tokens: &[&str]) -> bool {
    tokens.len() == 3 && tokens[1].parse::<i64>().is_ok() && tokens[2].parse::<f64>().is_ok()
}

pub fn validate_read_all_command(tokens: &[&str]) -> bool {
    match tokens.len() {
        1 => true,
        2 => Reduction::parse(tokens[1]).is_some(),
        _ => false,
    }
}

pub fn validate_read_range_command(tokens: &[&str]) -> bool {
    let arity_ok = match tokens.len() {
        3 => true,
        4 => Reduction::parse(tokens[3]).is_some(),
        _ => false,
    };
    arity_ok && tokens[1].parse::<i64>().is_ok() && tokens[2].parse::<i64>().is_ok()
}

pub fn validate_read_from_command(tokens: &[&str]) -> bool {
    tokens.len() == 2 && tokens[1].parse::<i64>().is_ok()
}

pub fn validate_get_command(tokens: &[&str]) -> bool {
    tokens.len() == 2 && tokens[1].parse::<usize>().is_ok()
}

pub fn validate_bench_command(tokens: &[&str]) -> bool {
    tokens.len() == 2 && tokens[1].parse::<usize>().map_or(false, |n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_read_range_command() {
        assert!(validate_read_range_command(&["readrange", "1000", "2000"]));
        assert!(validate_read_range_command(&["readrange", "1000", "2000", "avg"]));
        assert!(!validate_read_range_command(&["readrange", "1000"]));
        assert!(!validate_read_range_command(&["readrange", "abc", "def"]));
        assert!(!validate_read_range_command(&["readrange", "1000", "2000", "extra"]));
    }

    #[test]
    fn test_validate_append_command() {
        assert!(validate_append_command(&["append", "1000", "42.5"]));
        assert!(validate_append_command(&["append", "-5", "42"]));
        assert!(!validate_append_command(&["append", "1000"]));
        assert!(!validate_append_command(&["append", "x", "42.5"]));
    }

    #[test]
    fn test_database_name_rules() {
        assert!(is_valid_database_name("metrics-2024"));
        assert!(is_valid_database_name("cpu_load"));
        assert!(!is_valid_database_name(""));
        assert!(!is_valid_database_name("bad name"));
        assert!(!is_valid_database_name("stats"));
        assert!(!validate_create_command(&["create", "exit"]));
    }

    #[test]
    fn test_commands_drive_the_engine() {
        let dir = TempDir::new().unwrap();
        let mut repl = Repl::new(dir.path().to_path_buf());

        repl.handle_command("create metrics");
        repl.handle_command("append 1000 42.0");
        repl.handle_command("append 900 41.0");

        let db = repl.current.as_ref().unwrap();
        assert_eq!(db.name, "metrics");
        db.engine.flush().unwrap();

        let records = db.engine.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 1000);
    }

    #[test]
    fn test_create_refuses_existing_database() {
        let dir = TempDir::new().unwrap();
        let mut repl = Repl::new(dir.path().to_path_buf());

        repl.handle_command("create metrics");
        repl.current = None;
        repl.handle_command("create metrics");
        assert!(repl.current.is_none());

        repl.handle_command("use metrics");
        assert!(repl.current.is_some());
    }
}
