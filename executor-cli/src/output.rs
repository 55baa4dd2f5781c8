// Terminal output for pipex commands: progress on stderr, step logs on stdout

const BOLD_CYAN: &str = "1;36";
const BOLD_GREEN: &str = "1;32";
const BOLD_RED: &str = "1;31";
const GREEN: &str = "32";
const RED: &str = "31";
const YELLOW: &str = "33";
const CYAN: &str = "36";
const DIM: &str = "2";

fn paint(style: &str, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", style, text)
}

/// Right-aligned action word followed by a message
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint(BOLD_CYAN, &format!("{:>12}", action)), message);
}

pub fn success(message: &str) {
    eprintln!("{} {}", paint(BOLD_GREEN, "  \u{2713}"), message);
}

pub fn failure(message: &str) {
    eprintln!("{} {}", paint(BOLD_RED, "  \u{2717}"), message);
}

pub fn check(message: &str) {
    eprintln!("{} {}", paint(GREEN, "  \u{2713}"), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", paint(YELLOW, "  !"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint(BOLD_RED, "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("{} {}", paint(CYAN, "  i"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", paint(DIM, message));
}

/// One-line step summary, green or red by outcome
pub fn step_summary(line: &str, succeeded: bool) {
    eprintln!("{}", paint(if succeeded { GREEN } else { RED }, line));
}

/// Captured step logs, indented under the step
pub fn step_logs(logs: &str) {
    for line in logs.lines() {
        println!("        | {}", line);
    }
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}
