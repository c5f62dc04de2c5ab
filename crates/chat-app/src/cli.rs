use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use parley_llm::StreamEvent;
use parley_storage::SessionRecord;
use snafu::ResultExt;

use super::app::{ChatApp, Upload, save_attachments};
use super::error::{AppError, AppResult, SettingsSnafu, TerminalSnafu};
use super::render::{ErrorNotice, render_message};
use super::settings::ChatSettings;

#[derive(Debug, Parser)]
#[command(name = "parley")]
#[command(about = "Chat with a streaming LLM endpoint and keep the history in SQLite")]
#[command(version)]
pub struct Cli {
    /// Settings file (JSON)
    #[arg(long, env = "PARLEY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List sessions, newest first
    Sessions,
    /// Create a session
    New { name: String },
    /// Print the messages of a session
    History {
        name: String,
        /// Also write every attachment into this directory
        #[arg(long)]
        save_attachments: Option<PathBuf>,
    },
    /// Delete every session and message
    Clear,
    /// Send one message and print the streamed reply
    Send {
        #[arg(long, short)]
        session: String,
        /// Attach a file (repeatable)
        #[arg(long = "file", short = 'f')]
        files: Vec<PathBuf>,
        text: Option<String>,
    },
    /// Interactive chat
    Chat {
        #[arg(long, short)]
        session: Option<String>,
    },
}

/// One line typed into the interactive chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplInput {
    Message(String),
    New(String),
    Switch(String),
    Sessions,
    Attach(PathBuf),
    History,
    Help,
    Quit,
    Unknown(String),
}

pub const REPL_HELP: &str = "\
/new <name>      create a session and switch to it
/switch <name>   switch to an existing session
/sessions        list sessions
/attach <path>   attach a file to the next message
/send [text]     send pending attachments, with optional text
/history         reprint the current session
/quit            leave";

/// `None` for blank lines.
pub fn parse_repl_line(line: &str) -> Option<ReplInput> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let Some(command) = line.trim_start().strip_prefix('/') else {
        return Some(ReplInput::Message(line.to_string()));
    };

    let (name, argument) = command
        .split_once(char::is_whitespace)
        .map(|(name, argument)| (name, argument.trim()))
        .unwrap_or((command, ""));
    let input = match (name, argument) {
        ("new", name) if !name.is_empty() => ReplInput::New(name.to_string()),
        ("switch", name) if !name.is_empty() => ReplInput::Switch(name.to_string()),
        ("attach", path) if !path.is_empty() => ReplInput::Attach(PathBuf::from(path)),
        ("send", text) => ReplInput::Message(text.to_string()),
        ("sessions", "") => ReplInput::Sessions,
        ("history", "") => ReplInput::History,
        ("help", "") => ReplInput::Help,
        ("quit" | "exit", "") => ReplInput::Quit,
        _ => ReplInput::Unknown(line.trim().to_string()),
    };
    Some(input)
}

pub fn run(cli: Cli) -> AppResult<()> {
    let settings = ChatSettings::load(cli.config.as_deref()).context(SettingsSnafu {
        stage: "cli-load-settings",
    })?;
    let mut app = ChatApp::from_settings(&settings)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::Sessions => print_sessions(&app, &mut out),
        Command::New { name } => {
            let session = app.create_session(&name)?;
            writeln!(out, "created session {} ({})", session.name, session.id)
                .context(TerminalSnafu { stage: "cli-new" })
        }
        Command::History {
            name,
            save_attachments: directory,
        } => {
            app.select_session(&name)?;
            print_transcript(&app, &mut out)?;
            if let Some(directory) = directory {
                for path in save_attachments(app.transcript(), &directory)? {
                    writeln!(out, "saved {}", path.display())
                        .context(TerminalSnafu { stage: "cli-history-save" })?;
                }
            }
            Ok(())
        }
        Command::Clear => {
            app.delete_all_sessions()?;
            writeln!(out, "deleted all sessions").context(TerminalSnafu { stage: "cli-clear" })
        }
        Command::Send {
            session,
            files,
            text,
        } => {
            app.select_session(&session)?;
            let uploads = files
                .iter()
                .map(|path| Upload::from_path(path))
                .collect::<AppResult<Vec<_>>>()?;
            drop(out);
            send_turn(
                &mut app,
                text.as_deref().unwrap_or_default(),
                uploads,
                &mut std::io::stdout(),
            )
        }
        Command::Chat { session } => {
            drop(out);
            run_chat(&mut app, session.as_deref())
        }
    }
}

fn run_chat(app: &mut ChatApp, session: Option<&str>) -> AppResult<()> {
    if let Some(name) = session {
        match app.select_session(name) {
            Ok(_) => {}
            Err(AppError::SessionNotFound { .. }) => {
                app.create_session(name)?;
            }
            Err(error) => return Err(error),
        }
    }

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    print_banner(app, &mut stdout)?;
    if app.active_session().is_some() {
        print_transcript(app, &mut stdout)?;
    }

    let mut pending = Vec::new();
    let mut line = String::new();
    loop {
        write!(stdout, "{}> ", prompt_label(app.active_session()))
            .and_then(|()| stdout.flush())
            .context(TerminalSnafu { stage: "chat-prompt" })?;

        line.clear();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .context(TerminalSnafu { stage: "chat-read-line" })?;
        if read == 0 {
            break;
        }

        let Some(input) = parse_repl_line(&line) else {
            continue;
        };
        let result = match input {
            ReplInput::Quit => break,
            ReplInput::Help => writeln!(stdout, "{REPL_HELP}")
                .context(TerminalSnafu { stage: "chat-help" }),
            ReplInput::Sessions => print_sessions(app, &mut stdout),
            ReplInput::New(name) => app.create_session(&name).map(|_| ()),
            ReplInput::Switch(name) => app
                .select_session(&name)
                .map(|_| ())
                .and_then(|()| print_transcript(app, &mut stdout)),
            ReplInput::History => print_transcript(app, &mut stdout),
            ReplInput::Attach(path) => Upload::from_path(&path).and_then(|upload| {
                writeln!(stdout, "attached {} ({} bytes)", upload.name, upload.data.len())
                    .context(TerminalSnafu { stage: "chat-attach" })?;
                pending.push(upload);
                Ok(())
            }),
            ReplInput::Message(text) => {
                let uploads = std::mem::take(&mut pending);
                let result = send_turn(app, &text, uploads.clone(), &mut stdout);
                if result.is_err() {
                    // Keep the files so the turn can be retried.
                    pending = uploads;
                }
                result
            }
            ReplInput::Unknown(command) => writeln!(stdout, "unknown command: {command} (try /help)")
                .context(TerminalSnafu { stage: "chat-unknown" }),
        };

        if let Err(error) = result {
            tracing::debug!(error = ?error, "chat command failed");
            writeln!(stdout, "{}", ErrorNotice::from_error(&error))
                .context(TerminalSnafu { stage: "chat-report-error" })?;
        }
    }

    Ok(())
}

fn send_turn(
    app: &mut ChatApp,
    text: &str,
    uploads: Vec<Upload>,
    out: &mut (impl Write + Send),
) -> AppResult<()> {
    let mut started = false;
    let mut write_error = None;
    let report = app.submit(text, uploads, &mut |event: StreamEvent<'_>| {
        if write_error.is_some() {
            return;
        }
        let written = match event {
            StreamEvent::Delta { fragment, .. } => {
                started = true;
                write!(out, "{fragment}")
            }
            StreamEvent::Issue(issue) => writeln!(out, "\n{}", ErrorNotice::from_issue(issue)),
            StreamEvent::Done => Ok(()),
        };
        if let Err(error) = written.and_then(|()| out.flush()) {
            write_error = Some(error);
        }
    })?;
    // The turn is already stored; a broken terminal is still reported.
    if let Some(source) = write_error {
        return Err(source).context(TerminalSnafu {
            stage: "send-stream-reply",
        });
    }

    if started {
        writeln!(out).context(TerminalSnafu { stage: "send-finish" })?;
    }
    tracing::debug!(
        user_message = %report.user.id,
        assistant_message = %report.assistant.id,
        outcome = ?report.outcome,
        "turn stored"
    );
    Ok(())
}

fn print_banner(app: &ChatApp, out: &mut impl Write) -> AppResult<()> {
    let model = app.model().unwrap_or("no provider configured");
    writeln!(
        out,
        "💬 parley ({model})\naccepted file types: {}\ntype /help for commands",
        app.accepted_file_types().join(", ")
    )
    .context(TerminalSnafu { stage: "chat-banner" })
}

fn print_sessions(app: &ChatApp, out: &mut impl Write) -> AppResult<()> {
    let sessions = app.sessions()?;
    if sessions.is_empty() {
        return writeln!(out, "no sessions").context(TerminalSnafu {
            stage: "print-sessions",
        });
    }
    for session in sessions {
        writeln!(
            out,
            "{}\t{}\t{}",
            session.id,
            session.name,
            session.created_at.to_rfc3339()
        )
        .context(TerminalSnafu {
            stage: "print-sessions",
        })?;
    }
    Ok(())
}

fn print_transcript(app: &ChatApp, out: &mut impl Write) -> AppResult<()> {
    for message in app.transcript() {
        writeln!(out, "{}\n", render_message(message)).context(TerminalSnafu {
            stage: "print-transcript",
        })?;
    }
    Ok(())
}

fn prompt_label(session: Option<&SessionRecord>) -> &str {
    session.map_or("(no session)", |session| session.name.as_str())
}
