//! Colored status lines for the person at the terminal. Diagnostics go
//! through `tracing`, not here.

use owo_colors::OwoColorize;
use std::env;

pub fn should_use_color() -> bool {
    if env::var_os("NO_COLOR").is_some() {
        return false;
    }
    atty::is(atty::Stream::Stdout)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Step,
    Success,
    Warning,
    Failure,
}

pub fn render(tone: Tone, message: &str, color: bool) -> String {
    let marker = match tone {
        Tone::Step => "==>",
        Tone::Success => "ok",
        Tone::Warning => "warning:",
        Tone::Failure => "error:",
    };
    if !color {
        return format!("{} {}", marker, message);
    }
    let marker = match tone {
        Tone::Step => marker.blue().bold().to_string(),
        Tone::Success => marker.green().bold().to_string(),
        Tone::Warning => marker.yellow().bold().to_string(),
        Tone::Failure => marker.red().bold().to_string(),
    };
    format!("{} {}", marker, message)
}

pub fn step(message: impl AsRef<str>) {
    println!("{}", render(Tone::Step, message.as_ref(), should_use_color()));
}

pub fn success(message: impl AsRef<str>) {
    println!("{}", render(Tone::Success, message.as_ref(), should_use_color()));
}

pub fn warn(message: impl AsRef<str>) {
    println!("{}", render(Tone::Warning, message.as_ref(), should_use_color()));
}

/// Failure lines go to stderr.
pub fn failure(message: impl AsRef<str>) {
    let color = env::var_os("NO_COLOR").is_none() && atty::is(atty::Stream::Stderr);
    eprintln!("{}", render(Tone::Failure, message.as_ref(), color));
}
