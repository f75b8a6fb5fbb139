//! Line commands understood by the terminal frontend.

/// One parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/send <target> <text>` or a bare line, which goes to the last target
    Send { target: Option<String>, text: String },
    /// `/state`
    State,
    /// `/contacts`
    Contacts,
    /// `/reconnect`
    Reconnect,
    /// `/help`
    Help,
    /// `/quit`
    Quit,
    /// Blank line
    Empty,
    /// Anything else starting with `/`
    Unknown(String),
}

pub const HELP: &str = "\
/send <target> <text>  send a message (later bare lines go to the same target)
/state                 show the connection state
/contacts              list friends and groups from the last sync
/reconnect             drop the current connection and log in again
/quit                  log out and exit";

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        if !line.starts_with('/') {
            return Command::Send {
                target: None,
                text: line.to_string(),
            };
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "/send" | "/s" => match rest.split_once(char::is_whitespace) {
                Some((target, text)) if !text.trim().is_empty() => Command::Send {
                    target: Some(target.to_string()),
                    text: text.trim().to_string(),
                },
                _ => Command::Unknown(line.to_string()),
            },
            "/state" => Command::State,
            "/contacts" => Command::Contacts,
            "/reconnect" => Command::Reconnect,
            "/help" | "/?" => Command::Help,
            "/quit" | "/exit" | "/q" => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}
