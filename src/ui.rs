use crate::model::{InvoiceRecord, InvoiceStatus};
use crate::requester::SubmitControl;
use crate::tier::{Tier, TierState};
use crate::watcher::{format_remaining, WatchState};
use crossterm::{
    cursor, queue,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use std::io::{self, Write};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Level {
    Info,
    Success,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Success => " ok ",
            Level::Warn => "wait",
            Level::Error => "fail",
        }
    }

    fn color(self) -> Color {
        match self {
            Level::Info => Color::Cyan,
            Level::Success => Color::Green,
            Level::Warn => Color::Yellow,
            Level::Error => Color::Red,
        }
    }
}

/// Line-oriented terminal output. `mono` drops all styling.
pub(crate) struct Console {
    mono: bool,
}

impl Console {
    pub(crate) fn new(mono: bool) -> Self {
        Self { mono }
    }

    pub(crate) fn notice(&self, level: Level, text: &str) {
        let mut out = io::stdout();
        // Output errors here are not actionable.
        let _ = self.write_notice(&mut out, level, text);
    }

    fn write_notice(&self, out: &mut impl Write, level: Level, text: &str) -> io::Result<()> {
        if self.mono {
            writeln!(out, "[{}] {}", level.tag(), text)?;
        } else {
            queue!(
                out,
                SetForegroundColor(level.color()),
                SetAttribute(Attribute::Bold),
                Print(format!("[{}]", level.tag())),
                SetAttribute(Attribute::Reset),
                ResetColor,
                Print(format!(" {text}\n"))
            )?;
        }
        out.flush()
    }

    pub(crate) fn tier(&self, st: &TierState) {
        let text = tier_line(st);
        let level = if st.unlocked() { Level::Success } else { Level::Warn };
        self.notice(level, &text);
    }

    pub(crate) fn control(&self, c: &SubmitControl) {
        let level = if c.enabled { Level::Info } else { Level::Warn };
        self.notice(level, &format!("[ {} ]", c.label));
    }

    pub(crate) fn invoice(&self, rec: &InvoiceRecord) {
        let mut out = io::stdout();
        let _ = writeln!(out, "  invoice id : {}", rec.invoice_id);
        let _ = writeln!(out, "  amount     : {} sats", rec.amount_sats);
        let _ = writeln!(out, "  expires at : {}", rec.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if !rec.lightning_invoice.is_empty() {
            let _ = writeln!(out, "  pay with   : {}", rec.lightning_invoice);
        }
        if rec.qr_code.is_some() {
            let _ = writeln!(out, "  qr code    : provided (open the site to scan it)");
        }
        let _ = out.flush();
    }

    /// Rewrites the current line with the countdown and status.
    pub(crate) fn countdown(&self, st: &WatchState) {
        let mut out = io::stdout();
        let _ = self.write_countdown(&mut out, st);
    }

    fn write_countdown(&self, out: &mut impl Write, st: &WatchState) -> io::Result<()> {
        let line = countdown_line(st);
        if self.mono {
            write!(out, "\r{line}")?;
        } else {
            queue!(
                out,
                cursor::MoveToColumn(0),
                Clear(ClearType::CurrentLine),
                SetForegroundColor(status_color(st.status)),
                Print(line),
                ResetColor
            )?;
        }
        out.flush()
    }

    /// Ends the countdown line so later output starts fresh.
    pub(crate) fn end_line(&self) {
        let mut out = io::stdout();
        let _ = writeln!(out);
    }
}

pub(crate) fn tier_line(st: &TierState) -> String {
    if st.unlocked() {
        format!(
            "Tier {} unlocked (score {}): up to {} batches",
            st.tier.label().to_uppercase(),
            st.score,
            st.max_batches
        )
    } else {
        format!(
            "Purchasing locked (score {}): reach {} in the game to unlock",
            st.score,
            Tier::Bronze.min_score()
        )
    }
}

pub(crate) fn countdown_line(st: &WatchState) -> String {
    let mut line = format!(
        "Waiting for payment  {}  status: {}",
        format_remaining(st.remaining),
        st.status
    );
    if st.last_error.is_some() {
        line.push_str("  (connection issue, retrying)");
    }
    line
}

fn status_color(s: InvoiceStatus) -> Color {
    match s {
        InvoiceStatus::Pending => Color::Yellow,
        InvoiceStatus::Paid | InvoiceStatus::Delivered => Color::Green,
        InvoiceStatus::Expired | InvoiceStatus::Failed => Color::Red,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::tier_of;
    use std::time::Duration;

    #[test]
    fn tier_lines() {
        assert_eq!(
            tier_line(&tier_of(25)),
            "Tier GOLD unlocked (score 25): up to 30 batches"
        );
        assert_eq!(
            tier_line(&tier_of(5)),
            "Purchasing locked (score 5): reach 11 in the game to unlock"
        );
    }

    #[test]
    fn mono_notice_is_plain() {
        let mut buf = Vec::new();
        Console::new(true)
            .write_notice(&mut buf, Level::Error, "Could not create the invoice.")
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "[fail] Could not create the invoice.\n");
    }

    #[test]
    fn countdown_mentions_retries() {
        let mut st = WatchState {
            status: InvoiceStatus::Pending,
            remaining: Duration::from_secs(754),
            last_error: None,
            active: true,
        };
        assert_eq!(countdown_line(&st), "Waiting for payment  12:34  status: pending");
        st.last_error = Some("timeout".into());
        assert!(countdown_line(&st).ends_with("(connection issue, retrying)"));

        let mut buf = Vec::new();
        Console::new(true).write_countdown(&mut buf, &st).unwrap();
        assert!(String::from_utf8(buf).unwrap().starts_with("\rWaiting for payment"));
    }
}
