//! Console front-end
//!
//! Line-oriented driver for the smart box: reads commands from stdin and
//! prints link status, messages and the slot table as events arrive.

use crate::domain::models::{AppEvent, MessageSeverity, StatusMessage};
use crate::domain::slots::{Slot, SlotTable};
use crate::infrastructure::bluetooth::link::CancelHandle;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::service::SmartboxService;
use crate::infrastructure::bluetooth::transport::BleTransport;
use anyhow::Result;
use std::fmt::Write as _;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const HELP: &str = "\
Commands:
  connect                          scan for the smart box and connect
  disconnect                       drop the connection
  status                           show link status
  list                             show all slots
  search <text>                    filter slots by brand / model
  set <id> <brand>,<model>,<color>,<year>
                                   store a car in a slot
  clear <id>                       mark a slot as free
  light <id> on|off                switch the slot LED
  scalar <number>                  legacy numeric write (old firmware)
  help                             this text
  quit                             exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    Status,
    List,
    Search(String),
    Set {
        id: String,
        brand: String,
        model: String,
        color: String,
        year: String,
    },
    Clear(String),
    Light { id: String, on: bool },
    Scalar(i64),
    Help,
    Quit,
}

fn required_id<'a>(id: Option<&'a str>, usage: &str) -> Result<&'a str, String> {
    let id = id.ok_or_else(|| format!("Usage: {}", usage))?;
    protocol::validate_id(id).map_err(|e| e.to_string())?;
    Ok(id)
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match word.to_lowercase().as_str() {
        "connect" => Ok(ConsoleCommand::Connect),
        "disconnect" => Ok(ConsoleCommand::Disconnect),
        "status" => Ok(ConsoleCommand::Status),
        "list" | "ls" => Ok(ConsoleCommand::List),
        "search" => Ok(ConsoleCommand::Search(rest.to_string())),
        "set" => {
            let usage = "set <id> <brand>,<model>,<color>,<year>";
            let (id, fields) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let id = required_id(Some(id).filter(|s| !s.is_empty()), usage)?;
            let fields: Vec<&str> = fields.split(',').map(str::trim).collect();
            if fields.len() != 4 {
                return Err(format!("Usage: {}", usage));
            }
            protocol::validate_slot(id, fields[0], fields[1], fields[2], fields[3])
                .map_err(|e| e.to_string())?;
            Ok(ConsoleCommand::Set {
                id: id.to_string(),
                brand: fields[0].to_string(),
                model: fields[1].to_string(),
                color: fields[2].to_string(),
                year: fields[3].to_string(),
            })
        }
        "clear" => {
            let id = required_id(rest.split_whitespace().next(), "clear <id>")?;
            Ok(ConsoleCommand::Clear(id.to_string()))
        }
        "light" => {
            let usage = "light <id> on|off";
            let mut parts = rest.split_whitespace();
            let id = required_id(parts.next(), usage)?;
            let on = match parts.next().map(|s| s.to_lowercase()).as_deref() {
                Some("on") | Some("true") => true,
                Some("off") | Some("false") => false,
                _ => return Err(format!("Usage: {}", usage)),
            };
            Ok(ConsoleCommand::Light {
                id: id.to_string(),
                on,
            })
        }
        "scalar" => rest
            .parse()
            .map(ConsoleCommand::Scalar)
            .map_err(|_| "Usage: scalar <number>".to_string()),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        "" => Err(String::new()),
        other => Err(format!("Unknown command {:?}. Type 'help'.", other)),
    }
}

fn render_slot(out: &mut String, slot: &Slot) {
    if slot.is_empty {
        let _ = writeln!(out, "  [{:>3}] (empty)", slot.id);
    } else {
        let _ = writeln!(
            out,
            "  [{:>3}] {} - {}, {}",
            slot.id,
            slot.display_title(),
            slot.color,
            slot.year
        );
    }
}

pub fn render_slots<'a>(slots: impl IntoIterator<Item = &'a Slot>) -> String {
    let mut out = String::new();
    for slot in slots {
        render_slot(&mut out, slot);
    }
    if out.is_empty() {
        out.push_str("  (no slots)\n");
    }
    out
}

pub fn render_table(table: &SlotTable) -> String {
    format!(
        "Slots ({} of {} occupied):\n{}",
        table.occupied_count(),
        table.len(),
        render_slots(table)
    )
}

fn render_message(message: &StatusMessage) -> String {
    let tag = match message.severity {
        MessageSeverity::Info => "info",
        MessageSeverity::Success => " ok ",
        MessageSeverity::Warning => "warn",
        MessageSeverity::Error => "FAIL",
    };
    format!("[{}] {}", tag, message.message)
}

/// Ctrl-C cancels the in-flight connect until the returned task is aborted
fn cancel_on_ctrl_c(cancel: CancelHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}

async fn execute<T: BleTransport>(service: &mut SmartboxService<T>, command: ConsoleCommand) {
    debug!("Console command: {:?}", command);
    match command {
        ConsoleCommand::Connect => {
            println!("Connecting (Ctrl-C to cancel)...");
            let watcher = cancel_on_ctrl_c(service.cancel_handle());
            let _ = service.connect().await;
            watcher.abort();
        }
        ConsoleCommand::Disconnect => service.disconnect().await,
        ConsoleCommand::Status => println!("Status: {}", service.link_state()),
        ConsoleCommand::List => print!("{}", render_table(&service.slot_table())),
        ConsoleCommand::Search(query) => {
            let table = service.slot_table();
            print!("{}", render_slots(table.search(&query)));
        }
        ConsoleCommand::Set {
            id,
            brand,
            model,
            color,
            year,
        } => {
            let _ = service.set_slot(&id, &brand, &model, &color, &year).await;
        }
        ConsoleCommand::Clear(id) => {
            let _ = service.clear_slot(&id).await;
        }
        ConsoleCommand::Light { id, on } => {
            let _ = service.set_light(&id, on).await;
        }
        ConsoleCommand::Scalar(value) => {
            if let Err(e) = service.send_scalar(value).await {
                println!("Scalar write failed: {}", e);
            }
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}

async fn handle_event<T: BleTransport>(service: &mut SmartboxService<T>, event: AppEvent) {
    match event {
        AppEvent::SlotTable(table) => print!("{}", render_table(&table)),
        AppEvent::LinkState(state) => println!("Status: {}", state),
        AppEvent::LinkLost { reason } => {
            let watcher = cancel_on_ctrl_c(service.cancel_handle());
            service.handle_link_lost(&reason).await;
            watcher.abort();
        }
        AppEvent::LogMessage(message) => println!("{}", render_message(&message)),
    }
}

/// Drive the service from stdin until `quit`, end of input or Ctrl-C
pub async fn run<T: BleTransport>(
    service: SmartboxService<T>,
    events: mpsc::UnboundedReceiver<AppEvent>,
    connect_on_start: bool,
) -> Result<()> {
    println!("{}", HELP);
    drive(
        service,
        events,
        BufReader::new(tokio::io::stdin()),
        tokio::signal::ctrl_c,
        connect_on_start,
    )
    .await
}

/// Command loop. `shutdown` is re-armed on every turn so a Ctrl-C that
/// cancelled a connect does not also end the session.
async fn drive<T, R, S, F>(
    mut service: SmartboxService<T>,
    mut events: mpsc::UnboundedReceiver<AppEvent>,
    input: R,
    mut shutdown: S,
    connect_on_start: bool,
) -> Result<()>
where
    T: BleTransport,
    R: AsyncBufRead + Unpin,
    S: FnMut() -> F,
    F: Future,
{
    if connect_on_start {
        execute(&mut service, ConsoleCommand::Connect).await;
    }

    let mut lines = input.lines();
    loop {
        tokio::select! {
            _ = shutdown() => {
                debug!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => execute(&mut service, command).await,
                    Err(e) if e.is_empty() => {}
                    Err(e) => println!("{}", e),
                }
            }
            Some(event) = events.recv() => handle_event(&mut service, event).await,
        }
    }

    service.disconnect().await;
    Ok(())
}
