use std::env;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use streamchat_contracts::data_url::decode_data_url;
use streamchat_contracts::events::{payload_from, SessionEvent, SessionLog};
use streamchat_contracts::messages::{ChatAttachment, MessageState};
use streamchat_contracts::stream::decode;
use streamchat_engine::transport::DEFAULT_API_BASE;
use streamchat_engine::{
    build_request_body, prepare_with, validate_selection, AttachmentSource, ChatSession,
    CompletionClient, MessageList, OptimizerConfig, StreamOutcome,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "streamchat", version, about = "Streaming chat client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat against a streaming completions endpoint.
    Chat(ChatArgs),
    /// Replay a captured event stream through the decoder.
    Decode(DecodeArgs),
    /// Run the attachment optimizer on one image.
    Prepare(PrepareArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "openrouter/auto")]
    model: String,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    system: Option<String>,
}

#[derive(Debug, Parser)]
struct DecodeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    chunk_size: Option<usize>,
}

#[derive(Debug, Parser)]
struct PrepareArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
}

const API_KEY_ENV_KEYS: &[&str] = &["STREAMCHAT_API_KEY", "OPENROUTER_API_KEY", "OPENAI_API_KEY"];
const API_BASE_ENV_KEYS: &[&str] = &["STREAMCHAT_API_BASE", "OPENAI_API_BASE", "OPENAI_BASE_URL"];

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

const CHAT_HELP: &[(&str, &str)] = &[
    ("/attach <path>", "stage an image for the next message"),
    ("/clear", "forget the conversation and staged images"),
    ("/help", "show this list"),
    ("/quit", "leave the chat"),
];

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("streamchat error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Decode(args) => run_decode(args),
        Command::Prepare(args) => run_prepare(args),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatCommand {
    Empty,
    Help,
    Quit,
    Clear,
    Attach(String),
    Unknown(String),
    Send(String),
}

fn parse_chat_line(line: &str) -> ChatCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ChatCommand::Empty;
    }
    if !trimmed.starts_with('/') {
        return ChatCommand::Send(trimmed.to_string());
    }
    let (command, arg) = match trimmed.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (trimmed, ""),
    };
    match command.to_ascii_lowercase().as_str() {
        "/help" => ChatCommand::Help,
        "/quit" | "/exit" => ChatCommand::Quit,
        "/clear" => ChatCommand::Clear,
        "/attach" => ChatCommand::Attach(unquote(arg).to_string()),
        _ => ChatCommand::Unknown(command.to_string()),
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let api_base = args
        .endpoint
        .clone()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| first_non_empty_env(API_BASE_ENV_KEYS))
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    let client = CompletionClient::new(&api_base, first_non_empty_env(API_KEY_ENV_KEYS))?;

    let session_id = Uuid::new_v4().to_string();
    let log = match args.events.as_ref() {
        Some(path) => SessionLog::to_file(path, session_id.clone()),
        None => SessionLog::disabled(session_id.clone()),
    };
    let mut session = ChatSession::with_log(log.clone());
    let config = OptimizerConfig::default();
    let mut staged: Vec<ChatAttachment> = Vec::new();
    let mut warnings_seen = 0usize;

    println!("streamchat {session_id} -> {}", client.endpoint());
    println!("Model: {}. Type /help for commands.", args.model);

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("failed to read input"),
        }

        match parse_chat_line(&line) {
            ChatCommand::Empty => continue,
            ChatCommand::Help => print_help(),
            ChatCommand::Quit => break,
            ChatCommand::Clear => match session.clear() {
                Ok(()) => {
                    staged.clear();
                    println!("Conversation cleared.");
                }
                Err(err) => eprintln!("{err:#}"),
            },
            ChatCommand::Attach(path) => {
                if path.is_empty() {
                    println!("Usage: /attach <path>");
                    continue;
                }
                match attach_image(Path::new(&path), &config, &log) {
                    Ok(attachment) => {
                        println!(
                            "Attached {} ({} bytes). {} image(s) staged.",
                            attachment.name,
                            attachment.size,
                            staged.len() + 1
                        );
                        staged.push(attachment);
                    }
                    Err(err) => eprintln!("attach failed: {err:#}"),
                }
            }
            ChatCommand::Unknown(command) => {
                println!("Unknown command {command}. Type /help for commands.")
            }
            ChatCommand::Send(text) => {
                let attachments = std::mem::take(&mut staged);
                send_turn(&mut session, &client, &args, &text, attachments);
            }
        }

        for warning in &session.warnings()[warnings_seen..] {
            eprintln!("warning: {warning}");
        }
        warnings_seen = session.warnings().len();
    }
    Ok(())
}

fn print_help() {
    println!("Commands:");
    for (command, description) in CHAT_HELP {
        println!("  {command:<16} {description}");
    }
    println!("Anything else is sent as a message.");
}

fn attach_image(path: &Path, config: &OptimizerConfig, log: &SessionLog) -> Result<ChatAttachment> {
    let source = AttachmentSource::from_path(path)?;
    validate_selection(&source, config)?;
    let prepared = prepare_with(&source, config)?;

    let reencoded = prepared.data_url != source.read_as_data_url();
    let payload = payload_from(json!({
        "name": prepared.name,
        "mime_type": prepared.mime_type,
        "original_bytes": source.size(),
        "encoded_bytes": prepared.size,
        "reencoded": reencoded,
    }));
    if let Err(err) = log.emit(SessionEvent::AttachmentPrepared, payload) {
        eprintln!("warning: event log write failed: {err:#}");
    }

    Ok(ChatAttachment::from(prepared))
}

fn send_turn(
    session: &mut ChatSession,
    client: &CompletionClient,
    args: &ChatArgs,
    text: &str,
    attachments: Vec<ChatAttachment>,
) {
    let turn = match session.begin_send(text, attachments) {
        Ok(turn) => turn,
        Err(err) => {
            eprintln!("{err:#}");
            return;
        }
    };
    let body = build_request_body(
        &args.model,
        args.system.as_deref(),
        &session.messages(),
        Some(turn.assistant_message_id.as_str()),
    );

    let mut printer = ReplyPrinter::new(&turn.assistant_message_id);
    let mut stdout = io::stdout();
    let response = match client.open_stream(&body) {
        Ok(response) => response,
        Err(err) => {
            session.fail(&turn.assistant_message_id, &err);
            let _ = printer.render(&session.messages(), &mut stdout);
            let _ = printer.finish(&mut stdout);
            return;
        }
    };

    let outcome = session.stream_response(&turn, response, |messages| {
        let _ = printer.render(messages, &mut stdout);
    });
    let _ = printer.finish(&mut stdout);
    if outcome == StreamOutcome::Cancelled {
        println!("(cancelled)");
    }
}

/// Prints the growing assistant reply incrementally: reasoning dimmed, then
/// content. Only the suffix not yet printed is written on each update.
struct ReplyPrinter {
    message_id: String,
    reasoning_printed: usize,
    content_printed: usize,
    failure_printed: bool,
}

impl ReplyPrinter {
    fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            reasoning_printed: 0,
            content_printed: 0,
            failure_printed: false,
        }
    }

    fn render(&mut self, messages: &MessageList, out: &mut impl Write) -> io::Result<()> {
        let Some(message) = messages
            .iter()
            .find(|message| message.id == self.message_id)
        else {
            return Ok(());
        };

        if message.state == MessageState::Failed {
            if !self.failure_printed {
                if self.reasoning_printed > 0 || self.content_printed > 0 {
                    writeln!(out)?;
                }
                write!(out, "{}", message.content)?;
                self.failure_printed = true;
            }
            return out.flush();
        }

        // Finalizing trims both channels, so offsets past that point are stale.
        if message.state == MessageState::Finalized {
            return out.flush();
        }

        let reasoning = message.reasoning_text();
        if self.content_printed == 0 {
            if let Some(fresh) = reasoning.get(self.reasoning_printed..) {
                if !fresh.is_empty() {
                    write!(out, "{DIM}{fresh}{RESET}")?;
                    self.reasoning_printed = reasoning.len();
                }
            }
        }

        if let Some(fresh) = message.content.get(self.content_printed..) {
            if !fresh.is_empty() {
                if self.content_printed == 0 && self.reasoning_printed > 0 {
                    write!(out, "\n\n")?;
                }
                write!(out, "{fresh}")?;
                self.content_printed = message.content.len();
            }
        }
        out.flush()
    }

    fn finish(&mut self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out)?;
        out.flush()
    }
}

fn run_decode(args: DecodeArgs) -> Result<i32> {
    let bytes =
        fs::read(&args.input).with_context(|| format!("failed to read {}", args.input.display()))?;
    let text = String::from_utf8(bytes)
        .with_context(|| format!("{} is not valid UTF-8", args.input.display()))?;
    let chunk_chars = match args.chunk_size {
        Some(0) => bail!("--chunk-size must be at least 1"),
        Some(size) => size,
        None => usize::MAX,
    };

    let mut stdout = io::stdout().lock();
    let mut buffer = String::new();
    for chunk in char_chunks(&text, chunk_chars) {
        buffer.push_str(chunk);
        let decoded = decode(&buffer);
        for event in &decoded.events {
            writeln!(stdout, "{}", serde_json::to_string(event)?)?;
        }
        buffer = decoded.remainder;
    }
    stdout.flush()?;

    if !buffer.trim().is_empty() {
        eprintln!(
            "unterminated frame left undecoded ({} bytes)",
            buffer.len()
        );
    }
    Ok(0)
}

/// Splits `text` into pieces of at most `size` characters.
fn char_chunks(text: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut count = 0usize;
    for (index, _) in text.char_indices() {
        if count == size {
            chunks.push(&text[start..index]);
            start = index;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

fn run_prepare(args: PrepareArgs) -> Result<i32> {
    let config = OptimizerConfig::default();
    let source = AttachmentSource::from_path(&args.image)?;
    validate_selection(&source, &config)?;
    let prepared = prepare_with(&source, &config)?;

    let summary = json!({
        "name": prepared.name,
        "type": prepared.mime_type,
        "original_bytes": source.size(),
        "encoded_bytes": prepared.size,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(out) = args.out.as_ref() {
        let (_, bytes) = decode_data_url(&prepared.data_url)?;
        if let Some(parent) = out.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(out, bytes).with_context(|| format!("failed to write {}", out.display()))?;
        println!("Wrote {}", out.display());
    }
    Ok(0)
}

fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
