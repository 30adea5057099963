use colored::{ColoredString, Colorize};

/// How a message line is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Plain,
    Good,
    Attention,
}

fn paint(tone: Tone, msg: &str) -> ColoredString {
    match tone {
        Tone::Plain => msg.normal(),
        Tone::Good => msg.green(),
        Tone::Attention => msg.yellow(),
    }
}

fn say(tone: Tone, msg: &str) {
    println!("{} {}", "[nicplug]".bold().cyan(), paint(tone, msg));
}

pub fn info(msg: &str) {
    say(Tone::Plain, msg);
}

pub fn success(msg: &str) {
    say(Tone::Good, msg);
}

pub fn warn(msg: &str) {
    say(Tone::Attention, msg);
}

/// Scenario step header, preceded by a blank line.
pub fn step(n: u32, total: u32, msg: &str) {
    println!();
    say(Tone::Plain, &format!("{} {}", format!("[{}/{}]", n, total).bold(), msg));
}

/// Phase and state words colored by how settled they are.
fn tone_of(value: &str) -> Tone {
    match value {
        "yes" | "running" | "confirmed" | "absent" => Tone::Good,
        "no" | "requested" | "pending-absent" | "scheduled" | "pending" => Tone::Attention,
        _ => Tone::Plain,
    }
}

/// Aligned `label value` line.
pub fn status_line(label: &str, value: &str) {
    println!("  {:<12} {}", label, paint(tone_of(value), value));
}
