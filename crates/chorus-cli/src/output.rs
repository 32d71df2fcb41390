// Output formatting: JSON for scripts, plain text for people.

use chorus_core::CanonicalMessage;
use serde::Serialize;

pub fn print_value<T: Serialize>(value: &T, json: bool) {
    let rendered = if json { serde_json::to_string(value) } else { serde_json::to_string_pretty(value) };
    match rendered {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Error formatting output: {}", e),
    }
}

pub fn print_error(msg: &str, json: bool) {
    if json {
        eprintln!("{}", serde_json::json!({ "error": msg }));
    } else {
        eprintln!("error: {}", msg);
    }
}

/// One line per message: time, score, sender, text.
pub fn message_line(msg: &CanonicalMessage) -> String {
    let marker = if msg.is_question { "?" } else { " " };
    format!(
        "{} {:>5.1}{} {:<20} {}",
        msg.timestamp.format("%H:%M:%S"),
        msg.score,
        marker,
        msg.identity,
        msg.text
    )
}

pub fn print_messages(messages: &[CanonicalMessage], json: bool) {
    if json {
        print_value(&messages, true);
        return;
    }
    if messages.is_empty() {
        println!("(no messages)");
    }
    for msg in messages {
        println!("{}", message_line(msg));
    }
}
