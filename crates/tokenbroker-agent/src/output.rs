use colored::Colorize;
use time::OffsetDateTime;
use tokenbroker_agent::SessionState;

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_field(label: &str, value: &str) {
    println!("{}: {}", label.cyan(), value);
}

pub fn print_session(state: &SessionState) {
    let now = OffsetDateTime::now_utc();
    print_field("Subject", state.subject.as_deref().unwrap_or("(unknown)"));
    print_field("Access expiry", &expiry(state.access_expiry, now));
    print_field("Refresh expiry", &expiry(state.refresh_expiry, now));
}

fn expiry(at: OffsetDateTime, now: OffsetDateTime) -> String {
    let remaining = at - now;
    if remaining.is_negative() {
        return format!("{at} ({})", "expired".red());
    }
    let minutes = remaining.whole_minutes();
    let left = if minutes >= 24 * 60 {
        format!("{}d", remaining.whole_days())
    } else if minutes >= 60 {
        format!("{}h {}m", remaining.whole_hours(), minutes % 60)
    } else {
        format!("{minutes}m")
    };
    format!("{at} ({} left)", left.green())
}
