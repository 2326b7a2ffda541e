//! Terminal front end
//!
//! Reads one-line commands from stdin and prints a line whenever the
//! session snapshot changes.

use crate::session::{SessionSnapshot, SessionState, UserCommand};
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

pub const HELP: &str = "Enter: start/stop talking   x: dismiss error   q: quit";

/// Text shown for a snapshot
pub fn render_snapshot(snapshot: &SessionSnapshot) -> String {
    let headline = match snapshot.state {
        SessionState::Speaking => "AI is speaking...",
        SessionState::Listening => "Listening...",
        SessionState::Idle => "Press Enter to start conversation",
    };

    let mut text = headline.to_string();
    if !snapshot.status.is_empty() {
        text.push_str(&format!("\n  status: {}", snapshot.status));
    }
    if let Some(error) = &snapshot.error {
        text.push_str(&format!("\n  error: {} (x to dismiss)", error));
    }
    text
}

/// Map a line typed by the user to a command
pub fn parse_command(line: &str) -> Option<UserCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Some(UserCommand::ToggleCapture),
        "start" => Some(UserCommand::StartCapture),
        "stop" => Some(UserCommand::StopCapture),
        "x" | "dismiss" => Some(UserCommand::DismissError),
        "q" | "quit" | "exit" => Some(UserCommand::Shutdown),
        _ => None,
    }
}

/// Forward stdin lines and Ctrl-C as commands until shutdown
pub async fn read_commands(commands: mpsc::UnboundedSender<UserCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let command = match line {
                    Ok(Some(line)) => match parse_command(&line) {
                        Some(command) => command,
                        None => {
                            println!("{}", HELP);
                            continue;
                        }
                    },
                    // stdin closed
                    Ok(None) | Err(_) => UserCommand::Shutdown,
                };

                let shutdown = command == UserCommand::Shutdown;
                if commands.send(command).is_err() || shutdown {
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                let _ = commands.send(UserCommand::Shutdown);
                return;
            }
        }
    }
}

/// Print every published snapshot until the session goes away
pub async fn print_snapshots(mut snapshots: watch::Receiver<SessionSnapshot>) {
    println!("{}", HELP);
    loop {
        let text = render_snapshot(&snapshots.borrow_and_update());
        println!("{}", text);

        if snapshots.changed().await.is_err() {
            debug!("Snapshot channel closed");
            return;
        }
    }
}
