//! Styled terminal output for the CLI's own messages.
//!
//! Process output goes through the dev multiplexer; these helpers only
//! cover Conch's one-line status messages around it.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use console::style;

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

fn accent<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).blue()
}

pub fn step(message: &str) {
    println!("{} {}", accent("•").bold(), message);
}

pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

pub fn error_stderr(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

pub fn muted(message: &str) {
    println!("{}", style(message).dim());
}
