use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "lightcat")]
#[command(about = "LIGHTCAT token sale client: tier check, RGB invoice purchase, payment watch")]
pub(crate) struct Cli {
    /// Backend base URL (overrides settings.json)
    #[arg(long, global = true)]
    pub(crate) api: Option<String>,

    /// Launch link carrying a score, e.g. "https://rgblightcat.com/#score=25"
    #[arg(long, global = true)]
    pub(crate) link: Option<String>,

    /// Status poll interval in seconds (overrides settings.json)
    #[arg(long, global = true)]
    pub(crate) poll_secs: Option<u64>,

    /// Force monochrome (no colors)
    #[arg(long, global = true, default_value_t = false)]
    pub(crate) mono: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Show the purchase tier unlocked by the current score
    Tier,

    /// Record or clear the local game score
    Score {
        #[command(subcommand)]
        action: ScoreAction,
    },

    /// Create an invoice and watch it until payment settles
    Buy {
        /// RGB invoice from your wallet ("rgb:..." or "rgb1...")
        #[arg(long)]
        invoice: String,

        /// Number of batches to buy (bounded by your tier)
        #[arg(long)]
        batches: u32,

        /// Optional email for the receipt
        #[arg(long)]
        email: Option<String>,

        /// Directory for the downloaded consignment
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the invoice and exit without watching
        #[arg(long, default_value_t = false)]
        no_watch: bool,
    },

    /// Check an invoice's status once
    Status { invoice_id: String },

    /// Resume watching an invoice (defaults to the last one created)
    Watch {
        invoice_id: Option<String>,

        /// Directory for the downloaded consignment
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the effective settings
    Config {
        /// Write them to settings.json
        #[arg(long, default_value_t = false)]
        save: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum ScoreAction {
    /// Store a score as the game would after a run
    Set {
        score: u32,

        /// Game session id to forward with purchases
        #[arg(long)]
        session: Option<String>,
    },
    /// Forget the stored score and tier
    Clear,
}
