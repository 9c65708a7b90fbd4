use std::env;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use vischat_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use vischat_contracts::conversation::{Conversation, Turn, TurnId};
use vischat_contracts::models::ModelSpec;
use vischat_engine::{
    image_data_url_from_path, load_model_registry, ChatSession, GenerationOutcome, TurnObserver,
    DEFAULT_ATTACHMENT_MAX_DIM,
};

#[derive(Debug, Parser)]
#[command(name = "vischat", version, about = "Streaming chat with image attachments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Ask(AskArgs),
    Models(ModelsArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    models: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    models: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long)]
    models: Option<PathBuf>,
}

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const LIST_PREVIEW_CHARS: usize = 60;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("vischat error: {err:#}");
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
        Command::Ask(args) => run_ask(args),
        Command::Models(args) => run_models(args),
    }
}

fn open_session(
    out: &Path,
    events: Option<PathBuf>,
    model: Option<String>,
    models: Option<&Path>,
) -> Result<ChatSession> {
    let registry = load_model_registry(models)?;
    let events_path = events.unwrap_or_else(|| out.join("events.jsonl"));
    let session = ChatSession::new(out, events_path, Some(resolve_model(model)), registry)?;
    if let Some(reason) = session.last_fallback_reason() {
        eprintln!("{reason} Using {}.", session.model().name);
    }
    Ok(session)
}

fn resolve_model(flag: Option<String>) -> String {
    flag.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            env::var("VISCHAT_MODEL")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let mut session = open_session(&args.out, args.events, args.model, args.models.as_deref())?;
    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "vischat started with {}. Type /help for commands.",
        session.model().name
    );
    if !session.conversation().is_empty() {
        print_conversation(&mut io::stdout(), session.conversation())?;
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            continue;
        }
        if !handle_intent(&mut session, &intent)? {
            break;
        }
    }

    session.finish()?;
    println!("Session saved in {}", session.session_dir().display());
    Ok(())
}

/// Runs one parsed chat line. Returns `false` when the session should end.
fn handle_intent(session: &mut ChatSession, intent: &Intent) -> Result<bool> {
    let mut stdout = io::stdout();
    match intent.action.as_str() {
        "help" => {
            println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
        }
        "list_models" => {
            print_models(&mut stdout, &session.models(), Some(&session.model().name))?;
        }
        "set_model" => {
            let Some(requested) = intent.arg("model") else {
                println!("Current model: {}", session.model().name);
                return Ok(true);
            };
            let name = session.select_model(Some(requested))?.name.clone();
            match session.last_fallback_reason() {
                Some(reason) => println!("{reason} Using {name}."),
                None => println!("Model set to {name}"),
            }
        }
        "set_system" => match session.set_system_prompt(intent.arg("text").unwrap_or(""))? {
            Some(id) => println!("System prompt set ({id})"),
            None => println!("System prompt cleared"),
        },
        "attach_image" | "inject_image" => {
            let Some(path) = intent.arg("path") else {
                println!("/{} requires a path", command_name(intent));
                return Ok(true);
            };
            let data_url = match image_data_url_from_path(Path::new(path), DEFAULT_ATTACHMENT_MAX_DIM)
            {
                Ok(data_url) => data_url,
                Err(err) => {
                    println!("Attach failed: {err:#}");
                    return Ok(true);
                }
            };
            let id = if intent.action == "attach_image" {
                session.attach_image(data_url)?
            } else {
                session.inject_image(data_url)?
            };
            println!("Image attached to {id}");
        }
        "edit" => {
            let Some(id) = intent.arg("id") else {
                println!("/edit requires a turn id");
                return Ok(true);
            };
            match session.begin_edit(&TurnId::from(id)) {
                Some(text) => {
                    println!("Editing {id}. Your next message replaces:");
                    println!("  {text}");
                }
                None => println!("No turn {id}"),
            }
        }
        "delete" => {
            let Some(id) = intent.arg("id") else {
                println!("/delete requires a turn id");
                return Ok(true);
            };
            if session.delete_turn(&TurnId::from(id))? {
                println!("Deleted {id}");
            } else {
                println!("No turn {id}");
            }
        }
        "regenerate" => {
            let Some(id) = intent.arg("id") else {
                println!("/regen requires a turn id");
                return Ok(true);
            };
            let mut renderer = TerminalRenderer::new(io::stdout());
            let outcome = session.regenerate(&TurnId::from(id), &mut renderer)?;
            renderer.finish()?;
            report_outcome(&outcome, "Nothing to regenerate for that turn.");
        }
        "send" => {
            let text = intent.text.as_deref().unwrap_or_default();
            let mut renderer = TerminalRenderer::new(io::stdout());
            let outcome = session.send(text, &mut renderer)?;
            renderer.finish()?;
            report_outcome(&outcome, "Nothing to answer yet.");
        }
        "list" => {
            print_conversation(&mut stdout, session.conversation())?;
        }
        "quit" => return Ok(false),
        "unknown" => {
            let command = intent
                .command_args
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            println!("Unknown command: /{command}. Type /help for commands.");
        }
        other => {
            println!("Unhandled action: {other}");
        }
    }
    Ok(true)
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let mut session = open_session(&args.out, args.events, args.model, args.models.as_deref())?;
    if let Some(path) = args.image.as_deref() {
        let data_url = image_data_url_from_path(path, DEFAULT_ATTACHMENT_MAX_DIM)
            .with_context(|| format!("failed to attach {}", path.display()))?;
        session.attach_image(data_url)?;
    }

    let mut renderer = TerminalRenderer::new(io::stdout()).without_headers();
    let outcome = session.send(&args.prompt, &mut renderer)?;
    renderer.finish()?;
    session.finish()?;

    match outcome {
        GenerationOutcome::Completed { .. } => Ok(0),
        GenerationOutcome::Skipped => {
            eprintln!("vischat: nothing to answer");
            Ok(1)
        }
        GenerationOutcome::Failed { .. } => Ok(1),
    }
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let registry = load_model_registry(args.models.as_deref())?;
    let models: Vec<ModelSpec> = registry.list().cloned().collect();
    print_models(&mut io::stdout(), &models, None)?;
    Ok(0)
}

fn report_outcome(outcome: &GenerationOutcome, skipped_message: &str) {
    match outcome {
        GenerationOutcome::Skipped => println!("{skipped_message}"),
        GenerationOutcome::Completed {
            done_marker: false,
            ..
        } => println!("(stream closed without [DONE])"),
        GenerationOutcome::Completed { .. } | GenerationOutcome::Failed { .. } => {}
    }
}

fn command_name(intent: &Intent) -> &str {
    match intent.action.as_str() {
        "attach_image" => "attach",
        "inject_image" => "image",
        other => other,
    }
}

/// Streams turn updates to a terminal: each update prints only the text that
/// was not printed yet, and a failure prints the error note on its own line.
struct TerminalRenderer<W: Write> {
    out: W,
    headers: bool,
    current: Option<TurnId>,
    printed: String,
    error_shown: bool,
    io_error: Option<io::Error>,
}

impl<W: Write> TerminalRenderer<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            headers: true,
            current: None,
            printed: String::new(),
            error_shown: false,
            io_error: None,
        }
    }

    fn without_headers(mut self) -> Self {
        self.headers = false;
        self
    }

    fn render(&mut self, id: &TurnId, turn: &Turn) -> io::Result<()> {
        if self.current.as_ref() != Some(id) {
            if self.current.is_some() {
                writeln!(self.out)?;
            }
            if self.headers {
                write!(self.out, "[{id}] {}: ", turn.role)?;
            }
            self.current = Some(id.clone());
            self.printed.clear();
            self.error_shown = false;
        }

        let text = turn.text();
        match text.strip_prefix(self.printed.as_str()) {
            Some(suffix) => write!(self.out, "{suffix}")?,
            None => write!(self.out, "\n{text}")?,
        }
        self.printed = text.to_string();

        if let (Some(error), false) = (turn.error.as_deref(), self.error_shown) {
            write!(self.out, "\n  ! {error}")?;
            self.error_shown = true;
        }
        self.out.flush()
    }

    fn finish(mut self) -> Result<W> {
        if let Some(err) = self.io_error.take() {
            return Err(err).context("failed writing reply to terminal");
        }
        if self.current.is_some() {
            writeln!(self.out)?;
        }
        self.out.flush()?;
        Ok(self.out)
    }
}

impl<W: Write> TurnObserver for TerminalRenderer<W> {
    fn turn_updated(&mut self, id: &TurnId, turn: &Turn) {
        if self.io_error.is_some() {
            return;
        }
        if let Err(err) = self.render(id, turn) {
            self.io_error = Some(err);
        }
    }
}

fn print_models(out: &mut impl Write, models: &[ModelSpec], current: Option<&str>) -> Result<()> {
    for model in models {
        let marker = if current == Some(model.name.as_str()) {
            "*"
        } else {
            " "
        };
        let vision = if model.supports_vision {
            "vision"
        } else {
            "text-only"
        };
        writeln!(
            out,
            "{marker} {} ({}, {vision}) {}",
            model.name, model.provider, model.url
        )?;
    }
    Ok(())
}

fn print_conversation(out: &mut impl Write, conversation: &Conversation) -> Result<()> {
    if conversation.is_empty() {
        writeln!(out, "(no turns yet)")?;
        return Ok(());
    }
    for (id, turn) in conversation.iter() {
        let marker = if id == conversation.cursor() { ">" } else { " " };
        let mut line = format!(
            "{marker} [{id}] {}: {}",
            turn.role,
            preview_text(turn.text(), LIST_PREVIEW_CHARS)
        );
        if turn.image().is_some() {
            line.push_str(" [image]");
        }
        if let Some(error) = turn.error.as_deref() {
            line.push_str(&format!(" (failed: {error})"));
        }
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn preview_text(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    flat.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use vischat_contracts::chat::parse_intent;
    use vischat_contracts::conversation::{Conversation, Turn, TurnId, TurnUpdate};
    use vischat_contracts::models::ModelRegistry;
    use vischat_engine::{ChatSession, TurnObserver};

    use super::{
        handle_intent, preview_text, print_conversation, print_models, resolve_model,
        TerminalRenderer,
    };

    fn rendered(renderer: TerminalRenderer<Vec<u8>>) -> anyhow::Result<String> {
        Ok(String::from_utf8(renderer.finish()?)?)
    }

    #[test]
    fn renderer_prints_only_new_suffix() -> anyhow::Result<()> {
        let mut renderer = TerminalRenderer::new(Vec::new());
        let id = TurnId::from("a1b2c3d4");
        renderer.turn_updated(&id, &Turn::assistant("Hel"));
        renderer.turn_updated(&id, &Turn::assistant("Hello"));
        renderer.turn_updated(&id, &Turn::assistant("Hello there"));
        assert_eq!(rendered(renderer)?, "[a1b2c3d4] assistant: Hello there\n");
        Ok(())
    }

    #[test]
    fn renderer_shows_error_note_once() -> anyhow::Result<()> {
        let mut renderer = TerminalRenderer::new(Vec::new()).without_headers();
        let id = TurnId::from("a1b2c3d4");
        let mut turn = Turn::assistant("par");
        renderer.turn_updated(&id, &turn);
        turn.error = Some("connection reset".to_string());
        renderer.turn_updated(&id, &turn);
        renderer.turn_updated(&id, &turn);
        assert_eq!(rendered(renderer)?, "par\n  ! connection reset\n");
        Ok(())
    }

    #[test]
    fn list_marks_cursor_images_and_failures() -> anyhow::Result<()> {
        let mut conversation = Conversation::new();
        let user = conversation.update_cursor_turn(TurnUpdate::Text("look\nhere".to_string()));
        conversation.set_turn(&user, TurnUpdate::Image("data:image/png;base64,AA".to_string()));
        let reply = TurnId::from("r1r1r1r1");
        conversation.upsert_reply(&reply, "a dog");
        conversation.mark_failed(&reply, "a dog", "stream ended");

        let mut out = Vec::new();
        print_conversation(&mut out, &conversation)?;
        let text = String::from_utf8(out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("> [{user}] user: look here [image]"));
        assert_eq!(lines[1], "  [r1r1r1r1] assistant: a dog (failed: stream ended)");
        Ok(())
    }

    #[test]
    fn models_listing_flags_current_and_vision() -> anyhow::Result<()> {
        let registry = ModelRegistry::with_api_base("http://localhost:8080/v1");
        let models: Vec<_> = registry.list().cloned().collect();
        let mut out = Vec::new();
        print_models(&mut out, &models, Some("dryrun-vision-1"))?;
        let text = String::from_utf8(out)?;
        assert!(text.contains("* dryrun-vision-1 (dryrun, vision)"));
        assert!(text.contains("  gpt-4o-mini (openai, vision) http://localhost:8080/v1/chat/completions"));
        Ok(())
    }

    #[test]
    fn explicit_model_flag_wins() {
        assert_eq!(resolve_model(Some(" gpt-4o ".to_string())), "gpt-4o");
    }

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(preview_text("a\n b", 10), "a b");
        assert_eq!(preview_text("abcdef", 3), "abc…");
    }

    #[test]
    fn chat_commands_drive_the_session() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = ChatSession::new(
            temp.path(),
            temp.path().join("events.jsonl"),
            Some("dryrun-vision-1".to_string()),
            ModelRegistry::new(None),
        )?;

        assert!(handle_intent(&mut session, &parse_intent("/system keep it short"))?);
        assert!(handle_intent(&mut session, &parse_intent("hello there"))?);
        assert_eq!(session.conversation().len(), 3);

        let reply = session
            .conversation()
            .iter()
            .last()
            .map(|(id, _)| id.to_string())
            .unwrap_or_default();
        assert!(handle_intent(&mut session, &parse_intent(&format!("/regen {reply}")))?);
        assert_eq!(session.conversation().len(), 3);

        assert!(handle_intent(&mut session, &parse_intent(&format!("/delete {reply}")))?);
        assert_eq!(session.conversation().len(), 2);
        assert!(handle_intent(&mut session, &parse_intent("/attach /no/such/file.png"))?);
        assert!(!handle_intent(&mut session, &parse_intent("/quit"))?);
        Ok(())
    }
}
