//! Line-oriented console presenter.
//!
//! Reads commands from stdin and prints orchestrator events to stdout.
//! Holds no protocol state beyond the last roster it was shown.

use crate::core::message_log::{FileHandle, Message, MessageKind};
use crate::core::orchestrator::{AppEvent, Command};
use crate::core::peer_registry::PeerSummary;
use crate::utils::paths::format_size;
use crate::utils::sos::SignalOfStop;
use chrono::{Local, TimeZone};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::debug;

const HELP: &str = "\
Commands:
  <text>                     send a chat message to every connected peer
  /send <path>               send a file to every connected peer
  /cancel <fileId> <peerId>  stop sending a file to one peer
  /peers                     list peers and their state
  /disconnect                leave and forget the remembered login
  /quit                      leave
  /help                      show this help";

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    Peers,
    Help,
    Invalid(String),
}

pub fn parse_line(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Input::Command(Command::SendChat(line.to_string())));
    };

    let (verb, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();
    let input = match verb {
        "send" if !args.is_empty() => Input::Command(Command::SendFile(PathBuf::from(args))),
        "send" => Input::Invalid("usage: /send <path>".into()),
        "cancel" => match args.split_whitespace().collect::<Vec<_>>()[..] {
            [file_id, peer_id] => Input::Command(Command::CancelUpload {
                file_id: file_id.to_string(),
                peer_id: peer_id.to_string(),
            }),
            _ => Input::Invalid("usage: /cancel <fileId> <peerId>".into()),
        },
        "peers" => Input::Peers,
        "disconnect" => Input::Command(Command::Disconnect),
        "quit" | "exit" => Input::Command(Command::Quit),
        "help" => Input::Help,
        other => Input::Invalid(format!("unknown command /{other}; try /help")),
    };
    Some(input)
}

pub fn format_message(message: &Message) -> String {
    let time = Local
        .timestamp_millis_opt(message.timestamp)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default();
    match &message.kind {
        MessageKind::System => format!("[{time}] * {}", message.content),
        MessageKind::Chat { .. } => format!("[{time}] {}: {}", message.author, message.content),
        MessageKind::File(record) => {
            let location = match &record.handle {
                FileHandle::Path(path) => path.display().to_string(),
                FileHandle::Memory(_) => "in memory".to_string(),
            };
            format!(
                "[{time}] {}: {} ({}, {location})",
                message.author,
                message.content,
                format_size(record.size)
            )
        }
    }
}

pub fn format_roster(roster: &[PeerSummary]) -> String {
    if roster.is_empty() {
        return "No peers".to_string();
    }
    roster
        .iter()
        .map(|p| {
            let channel = if p.channel_open { "channel open" } else { "no channel" };
            format!("  {} ({}) - {}, {channel}", p.display_name, p.peer_id, p.state)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read stdin on a plain thread; it ends with the process, never with the
/// runtime.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Run the console until stdin closes or the orchestrator goes away.
pub async fn run(
    commands: mpsc::UnboundedSender<Command>,
    mut events: mpsc::UnboundedReceiver<AppEvent>,
    sos: SignalOfStop,
) {
    let mut lines = spawn_stdin_reader();
    let mut roster: Vec<PeerSummary> = Vec::new();
    // Last progress quarter printed per (fileId, peerId).
    let mut quarters: HashMap<(String, String), u8> = HashMap::new();
    let mut stdin_open = true;
    println!("Type /help for commands.");

    loop {
        tokio::select! {
            _ = sos.wait() => break,
            line = lines.recv(), if stdin_open => match line {
                Some(Ok(line)) => match parse_line(&line) {
                    Some(Input::Command(command)) => {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    Some(Input::Peers) => println!("{}", format_roster(&roster)),
                    Some(Input::Help) => println!("{HELP}"),
                    Some(Input::Invalid(reason)) => println!("{reason}"),
                    None => {}
                },
                None => {
                    stdin_open = false;
                    let _ = commands.send(Command::Quit);
                }
                Some(Err(e)) => {
                    debug!(event = "console_read_failure", error = %e, "Failed to read stdin");
                    stdin_open = false;
                    let _ = commands.send(Command::Quit);
                }
            },
            event = events.recv() => match event {
                Some(AppEvent::MessageAppended(message)) => println!("{}", format_message(&message)),
                Some(AppEvent::RosterChanged(peers)) => roster = peers,
                Some(AppEvent::UploadProgress { file_id, peer_id, filename, progress, complete }) => {
                    let key = (file_id, peer_id);
                    if complete {
                        println!("  {filename} -> {}: done", key.1);
                        quarters.remove(&key);
                    } else if quarters.get(&key) != Some(&(progress / 25)) {
                        println!("  {filename} -> {}: {progress}% ({})", key.1, key.0);
                        quarters.insert(key, progress / 25);
                    }
                }
                Some(AppEvent::UploadRemoved { file_id, peer_id }) => {
                    println!("  upload {file_id} to {peer_id} stopped");
                    quarters.remove(&(file_id, peer_id));
                }
                Some(AppEvent::RelayStatus(status)) => println!("  relay: {status}"),
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::SessionState;
    use crate::core::message_log::FileRecord;
    use bytes::Bytes;

    #[test]
    fn parses_commands_and_chat() {
        assert_eq!(parse_line("   "), None);
        assert_eq!(
            parse_line("hello there"),
            Some(Input::Command(Command::SendChat("hello there".into())))
        );
        assert_eq!(
            parse_line("/send /tmp/a file.txt"),
            Some(Input::Command(Command::SendFile(PathBuf::from("/tmp/a file.txt"))))
        );
        assert_eq!(
            parse_line("/cancel f1 bob"),
            Some(Input::Command(Command::CancelUpload {
                file_id: "f1".into(),
                peer_id: "bob".into()
            }))
        );
        assert!(matches!(parse_line("/cancel f1"), Some(Input::Invalid(_))));
        assert!(matches!(parse_line("/send"), Some(Input::Invalid(_))));
        assert!(matches!(parse_line("/bogus"), Some(Input::Invalid(_))));
        assert_eq!(parse_line("/peers"), Some(Input::Peers));
        assert_eq!(parse_line("/disconnect"), Some(Input::Command(Command::Disconnect)));
        assert_eq!(parse_line("/quit"), Some(Input::Command(Command::Quit)));
    }

    #[test]
    fn formats_file_and_system_messages() {
        let file = Message::file(
            "bob",
            "Sent you a file: a.txt",
            FileRecord {
                file_id: "f1".into(),
                filename: "a.txt".into(),
                mime: "text/plain".into(),
                size: 3,
                own: false,
                handle: FileHandle::Memory(Bytes::from_static(b"abc")),
            },
        );
        let line = format_message(&file);
        assert!(line.ends_with("bob: Sent you a file: a.txt (3 Bytes, in memory)"), "{line}");

        let system = format_message(&Message::system("Joined room: R1"));
        assert!(system.ends_with("* Joined room: R1"));
    }

    #[test]
    fn roster_lines() {
        assert_eq!(format_roster(&[]), "No peers");
        let roster = vec![PeerSummary {
            peer_id: "u-bob".into(),
            display_name: "bob".into(),
            state: SessionState::Connected,
            channel_open: true,
        }];
        assert_eq!(format_roster(&roster), "  bob (u-bob) - connected, channel open");
    }
}
