//! Line-oriented control console.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use stagecast_rtc::{ConnectionManager, NegotiationOutcome};
use stagecast_studio::{GuestSlot, Layout, LayoutChange, ParticipantId};
use tracing::{error, warn};

pub const HELP: &str = "\
commands:
  add <slot> <id>     register guest <id> in slot 1-4 and connect it
  remove <slot>       remove the guest in a slot
  layout <name>       grid-2x2 | grid-3up | grid-4up | picture-in-picture | side-by-side | spotlight
  auto on|off         follow the active speaker with the spotlight layout
  start               start streaming the composite
  stop                stop streaming
  status              show status, layout and participants
  quit                stop everything and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { slot: GuestSlot, id: String },
    Remove { slot: GuestSlot },
    Layout(Layout),
    Auto(bool),
    Start,
    Stop,
    Status,
    Help,
    Quit,
}

fn slot_arg(arg: Option<&str>) -> Result<GuestSlot> {
    let raw = arg.ok_or_else(|| anyhow!("missing slot number"))?;
    let n: u8 = raw.parse().map_err(|_| anyhow!("invalid slot '{raw}'"))?;
    Ok(GuestSlot::new(n)?)
}

impl Command {
    /// Parse one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let command = match verb.to_ascii_lowercase().as_str() {
            "add" => {
                let slot = slot_arg(words.next())?;
                let id = words.next().ok_or_else(|| anyhow!("missing guest id"))?;
                Command::Add {
                    slot,
                    id: id.to_string(),
                }
            }
            "remove" | "rm" => Command::Remove {
                slot: slot_arg(words.next())?,
            },
            "layout" => {
                let name = words.next().ok_or_else(|| anyhow!("missing layout name"))?;
                Command::Layout(name.parse()?)
            }
            "auto" => match words.next() {
                Some("on") => Command::Auto(true),
                Some("off") => Command::Auto(false),
                _ => bail!("usage: auto on|off"),
            },
            "start" => Command::Start,
            "stop" => Command::Stop,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command '{other}' (try 'help')"),
        };
        Ok(Some(command))
    }
}

/// Execute a command. Returns `false` once the console should exit.
pub async fn execute(manager: &Arc<ConnectionManager>, command: Command) -> bool {
    let session = manager.session();
    match command {
        Command::Add { slot, id } => {
            // Negotiation can take up to the transport timeouts; keep the
            // console responsive.
            let manager = manager.clone();
            tokio::spawn(async move {
                match manager.add_guest(slot, &id).await {
                    Ok(_) => println!("guest-{slot} '{id}' connected"),
                    Err(e) if e.is_local_rejection() => println!("rejected: {e}"),
                    Err(e) => println!("guest-{slot} '{id}': {e}"),
                }
            });
        }
        Command::Remove { slot } => {
            if manager.remove_guest(slot).await {
                println!("guest-{slot} removed");
            } else {
                println!("guest-{slot} is empty");
            }
        }
        Command::Layout(layout) => println!("{}", layout_message(session.select_layout(layout))),
        Command::Auto(enabled) => {
            let layout = session.set_auto_spotlight(enabled);
            println!(
                "auto spotlight {}; layout: {layout}",
                if enabled { "on" } else { "off" }
            );
        }
        Command::Start => {
            let manager = manager.clone();
            tokio::spawn(async move {
                match manager.start_publish().await {
                    Ok(NegotiationOutcome::Established(transport)) => {
                        println!("streaming via {transport}")
                    }
                    Ok(NegotiationOutcome::Degraded) => {
                        warn!("streaming without a media server");
                        println!("streaming (degraded)")
                    }
                    Err(e) => {
                        error!("publish failed: {}", e);
                        println!("{e}")
                    }
                }
            });
        }
        Command::Stop => {
            if !manager.stop_publish().await {
                println!("not streaming");
            }
        }
        Command::Status => print_status(manager),
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
    }
    true
}

fn print_status(manager: &ConnectionManager) {
    let session = manager.session();
    println!("status: {}", session.status().current());
    println!(
        "layout: {}{}",
        session.current_layout(),
        if session.is_auto_spotlight() { " (auto)" } else { "" }
    );
    if let Some(speaker) = session.active_speaker() {
        println!("active speaker: {speaker}");
    }
    session.with_registry(|registry| {
        for participant in registry.participants() {
            let connection = match participant.id {
                ParticipantId::Guest(slot) => manager
                    .guest_state(slot)
                    .map(|state| format!(" [{state:?}]"))
                    .unwrap_or_default(),
                ParticipantId::Host => String::new(),
            };
            println!(
                "  {:<8} {:<16} level {:>5.1}{}{}",
                participant.id.to_string(),
                participant.display_id,
                participant.audio_level,
                if participant.speaking { " speaking" } else { "" },
                connection
            );
        }
    });
}

fn layout_message(change: LayoutChange) -> String {
    match change {
        LayoutChange::Applied(layout) => format!("layout: {layout}"),
        LayoutChange::Ignored => "auto spotlight is on; layout unchanged".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use stagecast_common::StagecastConfig;
    use stagecast_studio::Session;

    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(
            Command::parse("add 2 alice").unwrap(),
            Some(Command::Add {
                slot: GuestSlot::new(2).unwrap(),
                id: "alice".into()
            })
        );
        assert_eq!(
            Command::parse("layout picture-in-picture").unwrap(),
            Some(Command::Layout(Layout::PictureInPicture))
        );
        assert_eq!(Command::parse("AUTO on").unwrap(), Some(Command::Auto(true)));
        assert_eq!(Command::parse("quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn test_layout_replies_follow_auto_mode() {
        let session = Session::new(StagecastConfig::default());
        let applied = session.select_layout(Layout::SideBySide);
        assert_eq!(layout_message(applied), "layout: side-by-side");

        session.set_auto_spotlight(true);
        let ignored = session.select_layout(Layout::Grid3Up);
        assert_eq!(layout_message(ignored), "auto spotlight is on; layout unchanged");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse("add 5 eve").is_err());
        assert!(Command::parse("add 1").is_err());
        assert!(Command::parse("remove x").is_err());
        assert!(Command::parse("layout mosaic").is_err());
        assert!(Command::parse("auto maybe").is_err());
        assert!(Command::parse("dance").is_err());
    }
}
