//! Offline sub-commands of the `benchrig` binary.
//!
//!   benchrig                               – run the rig service (default)
//!   benchrig init                          – write the default config file
//!   benchrig journal [kind] [limit]        – print the newest journal entries
//!   benchrig calibrate <name> <code> [notes…] – store a calibration point
//!   benchrig help                          – show this list

use colored::Colorize;

use benchrig_hal::PotRails;
use benchrig_journal::{CalibrationPoint, EntryKind, JournalEntry, SqliteJournal};
use benchrig_types::WiperCode;

const DEFAULT_JOURNAL_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Run,
    Init,
    Journal {
        kind: Option<EntryKind>,
        limit: usize,
    },
    Calibrate {
        name: String,
        code: i64,
        notes: String,
    },
    Help,
}

impl Invocation {
    /// Parse the arguments after the program name.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let Some((first, rest)) = args.split_first() else {
            return Ok(Invocation::Run);
        };
        match first.as_str() {
            "run" => Ok(Invocation::Run),
            "init" => Ok(Invocation::Init),
            "help" | "--help" | "-h" => Ok(Invocation::Help),
            "journal" => parse_journal(rest),
            "calibrate" => parse_calibrate(rest),
            other => Err(format!("Unknown sub-command '{other}'. Try `benchrig help`.")),
        }
    }
}

fn parse_journal(args: &[String]) -> Result<Invocation, String> {
    let mut kind = None;
    let mut limit = DEFAULT_JOURNAL_LIMIT;
    for arg in args {
        if let Ok(n) = arg.parse::<usize>() {
            limit = n;
        } else {
            kind = Some(arg.parse::<EntryKind>().map_err(|e| e.to_string())?);
        }
    }
    Ok(Invocation::Journal { kind, limit })
}

fn parse_calibrate(args: &[String]) -> Result<Invocation, String> {
    let [name, code, notes @ ..] = args else {
        return Err("usage: benchrig calibrate <name> <code> [notes…]".to_string());
    };
    let code = code
        .parse::<i64>()
        .map_err(|_| format!("'{code}' is not a wiper code"))?;
    Ok(Invocation::Calibrate {
        name: name.clone(),
        code,
        notes: notes.join(" "),
    })
}

pub fn print_help() {
    println!();
    println!("  {}", "Sub-commands:".bold());
    println!("    {}                        run the rig service", "(none)".cyan());
    println!("    {}                          write ~/.benchrig/config.toml", "init".cyan());
    println!("    {}        newest journal entries", "journal [kind] [limit]".cyan());
    println!("    {}  store a calibration point", "calibrate <name> <code> [notes]".cyan());
    println!();
    let kinds: Vec<&str> = EntryKind::ALL.iter().map(|k| k.as_str()).collect();
    println!("  Journal kinds: {}", kinds.join(", ").dimmed());
    println!();
}

/// One printable line per entry, oldest first.
pub fn journal_lines(
    journal: &SqliteJournal,
    kind: Option<EntryKind>,
    limit: usize,
) -> Result<Vec<String>, String> {
    let entries = journal
        .recent(kind, limit)
        .map_err(|e| format!("Failed to read journal: {e}"))?;
    Ok(entries.iter().map(format_entry).collect())
}

fn format_entry(entry: &JournalEntry) -> String {
    format!(
        "{}  {:<12} {}",
        entry.timestamp.to_rfc3339(),
        entry.kind.as_str(),
        entry.payload
    )
}

/// Store `code` together with the voltage the rails predict for it.
pub fn calibrate(
    journal: &SqliteJournal,
    rails: PotRails,
    name: &str,
    code: i64,
    notes: &str,
) -> Result<CalibrationPoint, String> {
    let code = WiperCode::new(code).map_err(|e| e.to_string())?;
    let point = CalibrationPoint {
        name: name.to_string(),
        code: code.value(),
        voltage: rails.voltage_for_code(code),
        notes: notes.to_string(),
    };
    journal
        .record_calibration(&point)
        .map_err(|e| format!("Failed to store calibration point: {e}"))?;
    Ok(point)
}
