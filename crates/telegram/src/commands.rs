//! Parsing of control-bot slash commands.

use teloxide::types::BotCommand;

/// An operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Auth,
    Cancel,
    AddId { chat_id: i64, sender_id: i64 },
    Run,
    Stop,
    SetDelay { seconds: u64 },
    /// Range is checked by the service so the refusal names the value.
    Multi { count: i64 },
    ListIds,
    Sessions,
    SetSession { account: String },
    DelSession { account: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Unknown(String),
    Usage(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(name) => write!(f, "Unknown command /{name}. Send /help for the list."),
            Self::Usage(usage) => write!(f, "Usage: {usage}"),
        }
    }
}

pub const HELP_TEXT: &str = "\
Account setup:
/auth - log in a new account
/cancel - abandon the login in progress
/sessions - list your accounts
/setsession <id> - choose the account commands apply to
/delsession <id> - delete an account

Autoresponder (current account):
/addid <chat_id> <user_id> - reply in this chat to this sender
/listids - show the current target
/run - start replying
/stop - stop replying
/setdelay <seconds> - wait before replying
/multi <1-3> - replies per trigger";

/// Commands registered with the bot for client autocomplete.
pub fn bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("auth", "Log in a new account"),
        BotCommand::new("cancel", "Abandon the login in progress"),
        BotCommand::new("sessions", "List your accounts"),
        BotCommand::new("setsession", "Choose the current account"),
        BotCommand::new("delsession", "Delete an account"),
        BotCommand::new("addid", "Set target chat and sender"),
        BotCommand::new("listids", "Show the current target"),
        BotCommand::new("run", "Start the autoresponder"),
        BotCommand::new("stop", "Stop the autoresponder"),
        BotCommand::new("setdelay", "Set the reply delay in seconds"),
        BotCommand::new("multi", "Set replies per trigger (1-3)"),
        BotCommand::new("help", "Show available commands"),
    ]
}

/// Parse a message as a command.
///
/// Returns `None` for plain text and for commands addressed to a different
/// bot (`/run@other_bot`).
pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Result<Command, ParseError>> {
    let rest = text.trim().strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let head = parts.next()?;
    let name = match head.split_once('@') {
        Some((name, mention)) => {
            if bot_username.is_some_and(|me| !mention.eq_ignore_ascii_case(me)) {
                return None;
            }
            name
        },
        None => head,
    };
    let args: Vec<&str> = parts.collect();

    let command = match name.to_ascii_lowercase().as_str() {
        "help" | "start" => Ok(Command::Help),
        "auth" => Ok(Command::Auth),
        "cancel" => Ok(Command::Cancel),
        "run" => Ok(Command::Run),
        "stop" => Ok(Command::Stop),
        "listids" => Ok(Command::ListIds),
        "sessions" => Ok(Command::Sessions),
        "addid" => parse_addid(&args),
        "setdelay" => match args.as_slice() {
            [seconds] => seconds
                .parse()
                .map(|seconds| Command::SetDelay { seconds })
                .map_err(|_| ParseError::Usage("/setdelay <seconds>")),
            _ => Err(ParseError::Usage("/setdelay <seconds>")),
        },
        "multi" => match args.as_slice() {
            [count] => count
                .parse()
                .map(|count| Command::Multi { count })
                .map_err(|_| ParseError::Usage("/multi <1-3>")),
            _ => Err(ParseError::Usage("/multi <1-3>")),
        },
        "setsession" => match args.as_slice() {
            [account] => Ok(Command::SetSession {
                account: (*account).to_string(),
            }),
            _ => Err(ParseError::Usage("/setsession <account id>")),
        },
        "delsession" => match args.as_slice() {
            [account] => Ok(Command::DelSession {
                account: (*account).to_string(),
            }),
            _ => Err(ParseError::Usage("/delsession <account id>")),
        },
        other => Err(ParseError::Unknown(other.to_string())),
    };
    Some(command)
}

fn parse_addid(args: &[&str]) -> Result<Command, ParseError> {
    const USAGE: &str = "/addid <chat_id> <user_id>";
    match args {
        [chat, sender] => match (chat.parse(), sender.parse()) {
            (Ok(chat_id), Ok(sender_id)) => Ok(Command::AddId { chat_id, sender_id }),
            _ => Err(ParseError::Usage(USAGE)),
        },
        _ => Err(ParseError::Usage(USAGE)),
    }
}
