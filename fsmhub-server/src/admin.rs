//! Administrative commands.
//!
//! Commands are single text lines, answered with text. They reach the
//! service either directly through [`crate::Service::admin`] or as bus
//! `query` events addressed to `automata`.

use crate::config::Inventory;
use crate::context::short_duration;
use crate::error::ServerError;
use chrono::{DateTime, Utc};
use fsmhub_core::Registry;
use std::fmt::Write;

/// Entity that bus queries for this service are addressed to.
pub const ADMIN_ENTITY: &str = "automata";

/// Lines kept by `logs`.
pub const LOG_TAIL: usize = 25;

pub const HELP: &str = "\
status: get status
switch device on|off: switch device
logs: get recent event logs
script: run a script
state: manually update automaton state";

/// A parsed administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Status,
    State { automaton: String, state: String },
    Logs,
    Script(String),
    Switch(Vec<String>),
    Help,
}

impl AdminCommand {
    pub fn parse(line: &str) -> Result<Self, ServerError> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match name {
            "status" => Ok(AdminCommand::Status),
            "state" => match args.as_slice() {
                [automaton, state] => Ok(AdminCommand::State {
                    automaton: automaton.to_string(),
                    state: state.to_string(),
                }),
                _ => Err(ServerError::InvalidRequest(
                    "usage: state automata state".to_string(),
                )),
            },
            "logs" => Ok(AdminCommand::Logs),
            "script" if rest.is_empty() => Err(ServerError::InvalidRequest(
                "usage: script name [args...]".to_string(),
            )),
            "script" => Ok(AdminCommand::Script(rest.to_string())),
            "switch" => Ok(AdminCommand::Switch(
                args.into_iter().map(str::to_string).collect(),
            )),
            "help" | "" => Ok(AdminCommand::Help),
            other => Err(ServerError::InvalidRequest(format!(
                "unknown command '{}', try help",
                other
            ))),
        }
    }
}

/// Renders every automaton's state and how long it has held it, grouped by
/// the id prefix before the first `.`.
pub fn format_status(registry: &Registry, devices: &Inventory, now: DateTime<Utc>) -> String {
    let mut automata: Vec<_> = registry.automata().collect();
    automata.sort_by(|a, b| a.id().cmp(b.id()));

    let mut out = String::new();
    let mut group = "";
    for automaton in automata {
        let id = automaton.id();
        let prefix = id.split('.').next().unwrap_or_default();
        if prefix != group {
            group = prefix;
            let _ = writeln!(out, "{}", group);
        }

        let name = devices.get(id).map(|d| d.name.as_str()).unwrap_or(id);
        let _ = writeln!(
            out,
            "- {}: {} for {}",
            name,
            automaton.state_name(),
            short_duration(now - automaton.since())
        );
    }
    out
}

/// Switch-capable device ids, sorted.
pub fn switchable(devices: &Inventory) -> Vec<&str> {
    let mut ids: Vec<&str> = devices
        .iter()
        .filter(|(_, d)| d.has_cap("switch"))
        .map(|(id, _)| id.as_str())
        .collect();
    ids.sort_unstable();
    ids
}

/// Resolves a device from a loose name: an exact id, a display name
/// (ignoring case), or a unique substring of a switch-capable id.
pub fn resolve_switch<'a>(devices: &'a Inventory, name: &str) -> Result<&'a str, ServerError> {
    if let Some((id, _)) = devices.get_key_value(name) {
        return Ok(id.as_str());
    }
    if let Some((id, _)) = devices.iter().find(|(_, d)| d.name.eq_ignore_ascii_case(name)) {
        return Ok(id.as_str());
    }

    let matches: Vec<&str> = switchable(devices)
        .into_iter()
        .filter(|id| id.contains(name))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(ServerError::InvalidRequest(format!("device {} not found", name))),
        _ => Err(ServerError::InvalidRequest(format!(
            "device {} is ambiguous",
            matches.join(", ")
        ))),
    }
}
