// src/io/hfp/at.rs
//
// AT (Hayes command) engine: the subset of ITU-T V.250 required for the
// Bluetooth Headset and Hands-Free profiles, plus chained extended commands.
// A command line is broken into commands; each is parsed for name, type and
// arguments and dispatched to a registered handler:
//
//   - Basic:  "ATD1234"  - single-letter name, remainder passed as one arg
//   - Action: "AT+CIMI"  - no arguments
//   - Read:   "AT+VGM?"
//   - Set:    "AT+VGM=14" - comma-delimited int/string arguments
//   - Test:   "AT+VGM=?"
//
// Extended commands chain with ';' and share one final result code; the
// chain aborts at the first non-OK result. The engine owns no connection
// state - it is a pure command -> response transform.

use std::collections::HashMap;

const CRLF: &str = "\r\n";

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtStatus {
    Ok,
    Error,
    /// Multi-line proactive response; no final OK/ERROR is appended.
    Unsolicited,
}

/// The result of executing a single AT command or command line: a status
/// plus zero or more response lines, CRLF-framed for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct AtCommandResult {
    status: AtStatus,
    response: String,
}

impl AtCommandResult {
    pub fn new(status: AtStatus) -> AtCommandResult {
        AtCommandResult {
            status,
            response: String::new(),
        }
    }

    /// OK result carrying a single response line.
    pub fn with_response(line: &str) -> AtCommandResult {
        let mut result = AtCommandResult::new(AtStatus::Ok);
        result.add_response(line);
        result
    }

    pub fn status(&self) -> AtStatus {
        self.status
    }

    pub fn add_response(&mut self, line: &str) {
        append_with_crlf(&mut self.response, line);
    }

    /// Fold another command's result into this one (command chaining).
    pub fn add_result(&mut self, other: AtCommandResult) {
        append_with_crlf(&mut self.response, &other.response);
        self.status = other.status;
    }
}

impl std::fmt::Display for AtCommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = self.response.clone();
        match self.status {
            AtStatus::Ok => append_with_crlf(&mut out, "OK"),
            AtStatus::Error => append_with_crlf(&mut out, "ERROR"),
            AtStatus::Unsolicited => {}
        }
        f.write_str(&out)
    }
}

/// Append a line, framing it in CRLF without doubling markers the line
/// already carries.
fn append_with_crlf(dst: &mut String, line: &str) {
    if line.is_empty() {
        return;
    }
    if !line.starts_with(CRLF) {
        dst.push_str(CRLF);
    }
    dst.push_str(line);
    if !line.ends_with(CRLF) {
        dst.push_str(CRLF);
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// One set-command argument: integer where it parses, string otherwise.
/// Missing arguments (",,") arrive as empty strings.
#[derive(Debug, Clone, PartialEq)]
pub enum AtArg {
    Int(i64),
    Text(String),
}

impl AtArg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AtArg::Int(value) => Some(*value),
            AtArg::Text(_) => None,
        }
    }
}

/// Handler for one registered command. Unimplemented operations answer
/// ERROR, except test which answers OK (the command is at least recognized).
pub trait AtCommandHandler: Send {
    fn handle_basic(&mut self, _arg: &str) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Error)
    }

    fn handle_action(&mut self) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Error)
    }

    fn handle_read(&mut self) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Error)
    }

    fn handle_set(&mut self, _args: &[AtArg]) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Error)
    }

    fn handle_test(&mut self) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Ok)
    }
}

// ============================================================================
// Parser
// ============================================================================

enum CommandType {
    Action,
    Read,
    Set,
    Test,
}

/// The parser. Extended handlers register by name; the empty name is the
/// catch-all consulted for any unknown command. Basic handlers register by
/// their single letter.
pub struct AtParser {
    ext_handlers: HashMap<String, Box<dyn AtCommandHandler>>,
    basic_handlers: HashMap<char, Box<dyn AtCommandHandler>>,
    // for "A/" (repeat last command) support
    last_input: String,
}

impl AtParser {
    pub fn new() -> AtParser {
        AtParser {
            ext_handlers: HashMap::new(),
            basic_handlers: HashMap::new(),
            last_input: String::new(),
        }
    }

    pub fn register(&mut self, command: &str, handler: Box<dyn AtCommandHandler>) {
        self.ext_handlers.insert(command.to_string(), handler);
    }

    pub fn register_basic(&mut self, command: char, handler: Box<dyn AtCommandHandler>) {
        self.basic_handlers.insert(command, handler);
    }

    /// Process one incoming command line (EOL already stripped).
    pub fn process(&mut self, raw_input: &str) -> AtCommandResult {
        let input = clean(raw_input);
        let input = if input.starts_with("A/") {
            self.last_input.clone()
        } else {
            self.last_input = input.clone();
            input
        };
        // Empty line - no response necessary
        if input.is_empty() {
            return AtCommandResult::new(AtStatus::Unsolicited);
        }
        if !input.starts_with("AT") {
            return AtCommandResult::new(AtStatus::Error);
        }

        let chars: Vec<char> = input.chars().collect();
        let mut index = 2;
        let mut result = AtCommandResult::new(AtStatus::Unsolicited);
        while index < chars.len() {
            let c = chars[index];
            if c.is_ascii_uppercase() {
                // Basic command: the rest of the line is the argument and no
                // further commands are parsed.
                let arg: String = chars[index + 1..].iter().collect();
                match self.basic_handlers.get_mut(&c) {
                    Some(handler) => result.add_result(handler.handle_basic(&arg)),
                    None => result.add_result(AtCommandResult::new(AtStatus::Error)),
                }
                return result;
            }
            if c == '+' {
                let name_end = find_end_extended_name(&chars, index + 1);
                let command_name: String = chars[index..name_end].iter().collect();
                let lookup = if self.ext_handlers.contains_key(&command_name) {
                    command_name
                } else if self.ext_handlers.contains_key("") {
                    String::new()
                } else {
                    result.add_result(AtCommandResult::new(AtStatus::Error));
                    return result;
                };
                let end_index = find_char(';', &chars, index);
                let command_type = if name_end >= end_index {
                    CommandType::Action
                } else if chars[name_end] == '?' {
                    CommandType::Read
                } else if chars[name_end] == '=' {
                    if name_end + 1 < end_index && chars[name_end + 1] == '?' {
                        CommandType::Test
                    } else {
                        CommandType::Set
                    }
                } else {
                    CommandType::Action
                };
                let handler = self
                    .ext_handlers
                    .get_mut(&lookup)
                    .expect("handler looked up above");
                let partial = match command_type {
                    CommandType::Action => handler.handle_action(),
                    CommandType::Read => handler.handle_read(),
                    CommandType::Test => handler.handle_test(),
                    CommandType::Set => {
                        let arg_text: String =
                            chars[name_end + 1..end_index].iter().collect();
                        handler.handle_set(&generate_args(&arg_text))
                    }
                };
                result.add_result(partial);
                if result.status() != AtStatus::Ok {
                    return result; // short-circuit the chain
                }
                index = end_index;
            } else {
                // Can't tell if this is a basic or extended command; push
                // forwards and hope we hit something.
                index += 1;
            }
        }
        result
    }
}

impl Default for AtParser {
    fn default() -> Self {
        AtParser::new()
    }
}

/// Strip whitespace and force uppercase, except inside double quotes (the
/// only quotes V.250 allows). Unmatched quotes are fixed by appending one.
fn clean(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            match chars[i + 1..].iter().position(|&x| x == '"') {
                None => {
                    // unmatched ", insert one
                    out.extend(chars[i..].iter());
                    out.push('"');
                    break;
                }
                Some(offset) => {
                    let j = i + 1 + offset;
                    out.extend(chars[i..=j].iter());
                    i = j;
                }
            }
        } else if c != ' ' {
            out.push(c.to_ascii_uppercase());
        }
        i += 1;
    }
    out
}

/// Find `ch`, ignoring quoted sections. Returns `chars.len()` if absent.
fn find_char(ch: char, chars: &[char], from_index: usize) -> usize {
    let mut i = from_index;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            match chars[i + 1..].iter().position(|&x| x == '"') {
                None => return chars.len(),
                Some(offset) => i = i + 1 + offset,
            }
        } else if c == ch {
            return i;
        }
        i += 1;
    }
    chars.len()
}

/// Comma-split a set-command argument string, parsing integers where
/// possible.
fn generate_args(input: &str) -> Vec<AtArg> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i <= chars.len() {
        let j = find_char(',', &chars, i);
        let arg: String = chars[i..j.min(chars.len())].iter().collect();
        match arg.parse::<i64>() {
            Ok(value) => out.push(AtArg::Int(value)),
            Err(_) => out.push(AtArg::Text(arg)),
        }
        i = j + 1; // move past comma
    }
    out
}

/// End of an extended command name, per the V.250 set of legal name
/// characters.
fn find_end_extended_name(chars: &[char], index: usize) -> usize {
    for (i, &c) in chars.iter().enumerate().skip(index) {
        if c.is_ascii_uppercase() || c.is_ascii_digit() {
            continue;
        }
        match c {
            '!' | '%' | '-' | '.' | '/' | ':' | '_' => continue,
            _ => return i,
        }
    }
    chars.len()
}
